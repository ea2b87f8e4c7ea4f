//! Append-only audit history for transaction records
//!
//! The first entry of a record is a full snapshot; every later entry holds
//! only the fields that changed, keyed by a `/`-separated path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
    pub changes: Vec<FieldChange>,
}

impl HistoryEntry {
    /// Initial snapshot of a record
    pub fn snapshot(state: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            note: Some("created".to_string()),
            changes: vec![FieldChange {
                path: String::new(),
                before: Value::Null,
                after: state,
            }],
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.changes.len() == 1 && self.changes[0].path.is_empty()
    }
}

/// Field-level difference between two JSON documents
pub fn diff(before: &Value, after: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    diff_at("", before, after, &mut changes);
    changes
}

fn diff_at(path: &str, before: &Value, after: &Value, changes: &mut Vec<FieldChange>) {
    match (before, after) {
        (Value::Object(lhs), Value::Object(rhs)) => {
            for (key, lhs_value) in lhs {
                let child = format!("{}/{}", path, key);
                let rhs_value = rhs.get(key).unwrap_or(&Value::Null);
                diff_at(&child, lhs_value, rhs_value, changes);
            }
            for (key, rhs_value) in rhs {
                if !lhs.contains_key(key) {
                    diff_at(&format!("{}/{}", path, key), &Value::Null, rhs_value, changes);
                }
            }
        }
        _ if before != after => changes.push(FieldChange {
            path: path.to_string(),
            before: before.clone(),
            after: after.clone(),
        }),
        _ => {}
    }
}
