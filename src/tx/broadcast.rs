//! Classification of broadcast errors
//!
//! Node implementations word the "already have this transaction" rejection
//! differently. Those errors are expected under retry races and count as
//! progress; the table is matched case-insensitively as substrings and can be
//! extended from configuration when a node changes its wording.

/// Error fragments meaning the payload (or one sharing its nonce) is already known
pub const KNOWN_BROADCAST_ERRORS: &[&str] = &[
    "replacement transaction underpriced",
    "known transaction",
    "gas price too low to replace",
    "transaction with the same hash was already imported",
    "gateway timeout",
    "nonce too low",
    "too stale nonce",
    "with same nonce already inserted",
    "discarded due to a too stale nonce",
    "tx already exist",
];

#[derive(Debug, Clone)]
pub struct BroadcastErrorClassifier {
    patterns: Vec<String>,
}

impl BroadcastErrorClassifier {
    /// Built-in table plus `extra` fragments
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = KNOWN_BROADCAST_ERRORS
            .iter()
            .map(|p| p.to_string())
            .chain(
                extra
                    .into_iter()
                    .map(|p| p.as_ref().trim().to_lowercase())
                    .filter(|p| !p.is_empty()),
            )
            .collect();

        Self { patterns }
    }

    /// Whether the node error means the broadcast already happened
    pub fn is_benign(&self, error: &str) -> bool {
        let error = error.to_lowercase();
        self.patterns.iter().any(|p| error.contains(p.as_str()))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for BroadcastErrorClassifier {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}
