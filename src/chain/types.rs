//! On-chain views and write payloads

use crate::crypto::Signature;
use serde::{Deserialize, Serialize};

/// Outcome of a chain write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReceipt {
    pub block_number: u64,
    pub tx_hash: String,
}

impl ChainReceipt {
    /// A receipt mined in block 0 is not a confirmation
    pub fn is_confirmed(&self) -> bool {
        self.block_number > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainTaskStatus {
    Unset,
    Active,
    Revealing,
    Completed,
    Failed,
}

/// Task as stored by the hub contract (deal fields flattened in)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTask {
    pub chain_task_id: String,
    pub status: ChainTaskStatus,
    /// Unix seconds
    pub contribution_deadline: i64,
    pub reveal_deadline: i64,
    pub final_deadline: i64,
    #[serde(default)]
    pub consensus_value: String,
    /// Stake required from each contributing worker
    #[serde(default)]
    pub worker_stake: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainContributionStatus {
    Unset,
    Contributed,
    Proved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContribution {
    pub status: ChainContributionStatus,
    #[serde(default)]
    pub result_hash: String,
    #[serde(default)]
    pub result_seal: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAccount {
    pub stake: u64,
    #[serde(default)]
    pub locked: u64,
}

/// Arguments of the hub's `contribute` entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributeCall {
    pub chain_task_id: String,
    pub result_hash: String,
    pub result_seal: String,
    pub enclave_challenge: String,
    pub enclave_signature: Signature,
    pub authorization_signature: Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_confirmation() {
        let receipt = ChainReceipt {
            block_number: 0,
            tx_hash: "0x1".to_string(),
        };
        assert!(!receipt.is_confirmed());
        assert!(ChainReceipt {
            block_number: 7,
            ..receipt
        }
        .is_confirmed());
    }

    #[test]
    fn test_chain_task_json() {
        let json = r#"{
            "chainTaskId": "0xabc",
            "status": "REVEALING",
            "contributionDeadline": 100,
            "revealDeadline": 200,
            "finalDeadline": 300,
            "consensusValue": "0xfeed"
        }"#;
        let task: ChainTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.status, ChainTaskStatus::Revealing);
        assert_eq!(task.worker_stake, 0);
    }
}
