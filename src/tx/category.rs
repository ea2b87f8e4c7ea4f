//! Transaction intent classification

use super::types::TxParams;
use crate::chain::ChainQuery;

use ethers::types::Bytes;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionCategory {
    SentEther,
    ContractDeployment,
    TokenMethodTransfer,
    TokenMethodApprove,
    TokenMethodTransferFrom,
    ContractInteraction,
}

/// Outcome of asking the node for the code at `to`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum CodeProbe {
    #[default]
    NotProbed,
    /// The query itself failed
    Failed,
    Code(Bytes),
}

impl CodeProbe {
    /// Non-empty, non-zero code means a contract lives at the address
    pub fn is_contract(&self) -> bool {
        match self {
            CodeProbe::Code(code) => code.iter().any(|byte| *byte != 0),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryResult {
    pub category: TransactionCategory,
    pub code_probe: CodeProbe,
}

lazy_static! {
    static ref TOKEN_METHODS: Vec<([u8; 4], TransactionCategory)> = vec![
        (
            selector("transfer(address,uint256)"),
            TransactionCategory::TokenMethodTransfer
        ),
        (
            selector("approve(address,uint256)"),
            TransactionCategory::TokenMethodApprove
        ),
        (
            selector("transferFrom(address,address,uint256)"),
            TransactionCategory::TokenMethodTransferFrom
        ),
    ];
}

/// First four bytes of the keccak256 of a method signature
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

fn token_method(params: &TxParams) -> Option<TransactionCategory> {
    let method = params.method_selector()?;
    TOKEN_METHODS
        .iter()
        .find(|(known, _)| *known == method)
        .map(|(_, category)| *category)
}

/// Classify what a transaction intends to do.
///
/// Token calls are recognized from the method selector alone. A missing `to`
/// with data is a deployment. Anything else asks the node whether `to` holds
/// code; a failed probe falls back to a plain send.
pub async fn determine_transaction_category(
    params: &TxParams,
    chain: &dyn ChainQuery,
) -> CategoryResult {
    if let Some(category) = token_method(params) {
        return CategoryResult {
            category,
            code_probe: CodeProbe::NotProbed,
        };
    }

    let to = match params.to {
        Some(to) => to,
        None if params.has_data() => {
            return CategoryResult {
                category: TransactionCategory::ContractDeployment,
                code_probe: CodeProbe::NotProbed,
            }
        }
        None => {
            return CategoryResult {
                category: TransactionCategory::SentEther,
                code_probe: CodeProbe::NotProbed,
            }
        }
    };

    let code_probe = match chain.get_code(to).await {
        Ok(code) => CodeProbe::Code(code),
        Err(e) => {
            debug!("Code probe for {:?} failed: {}", to, e);
            CodeProbe::Failed
        }
    };

    let category = if code_probe.is_contract() {
        TransactionCategory::ContractInteraction
    } else {
        TransactionCategory::SentEther
    };

    CategoryResult {
        category,
        code_probe,
    }
}
