//! Replicate lifecycle as reported to the scheduler

use crate::chain::ChainReceipt;
use serde::{Deserialize, Serialize};

/// Status of one worker's attempt at a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicateStatus {
    Received,
    Running,
    AppDownloading,
    AppDownloadFailed,
    AppDownloaded,
    DataDownloading,
    DataDownloadFailed,
    DataDownloaded,
    Computing,
    ComputeFailed,
    Computed,
    CantContributeSinceStakeTooLow,
    CantContributeSinceTaskNotActive,
    CantContributeSinceAfterDeadline,
    CantContributeSinceContributionAlreadySet,
    CantContributeSinceDeterminismHashNotFound,
    CantContributeSinceTeeExecutionNotVerified,
    OutOfGas,
    Contributing,
    Contributed,
    Revealing,
    Revealed,
    CantReveal,
    ResultUploading,
    ResultUploaded,
    ResultUploadFailed,
    Completed,
    AbortedOnConsensusReached,
    AbortedOnContributionTimeout,
}

impl ReplicateStatus {
    /// Position on the happy path; `None` for failure and abort states
    pub fn stage(&self) -> Option<u8> {
        use ReplicateStatus::*;
        let stage = match self {
            Received => 0,
            Running => 1,
            AppDownloading => 2,
            AppDownloaded => 3,
            DataDownloading => 4,
            DataDownloaded => 5,
            Computing => 6,
            Computed => 7,
            Contributing => 8,
            Contributed => 9,
            Revealing => 10,
            Revealed => 11,
            ResultUploading => 12,
            ResultUploaded => 13,
            Completed => 14,
            _ => return None,
        };
        Some(stage)
    }

    pub fn is_failure(&self) -> bool {
        use ReplicateStatus::*;
        matches!(
            self,
            AppDownloadFailed
                | DataDownloadFailed
                | ComputeFailed
                | CantContributeSinceStakeTooLow
                | CantContributeSinceTaskNotActive
                | CantContributeSinceAfterDeadline
                | CantContributeSinceContributionAlreadySet
                | CantContributeSinceDeterminismHashNotFound
                | CantContributeSinceTeeExecutionNotVerified
                | OutOfGas
                | CantReveal
                | ResultUploadFailed
        )
    }

    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            ReplicateStatus::AbortedOnConsensusReached
                | ReplicateStatus::AbortedOnContributionTimeout
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == ReplicateStatus::Completed || self.is_failure() || self.is_abort()
    }

    /// Forward move on the happy path, or a jump to a failure/abort state
    pub fn is_forward_transition(from: ReplicateStatus, to: ReplicateStatus) -> bool {
        if to.is_abort() {
            return !from.is_abort() && from != ReplicateStatus::Completed;
        }
        if from.is_terminal() {
            return false;
        }
        if to.is_failure() {
            return true;
        }
        match (from.stage(), to.stage()) {
            (Some(a), Some(b)) => b > a,
            _ => false,
        }
    }
}

impl std::fmt::Display for ReplicateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", value.as_str().unwrap_or_default())
    }
}

/// Optional payload attached to a status update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_receipt: Option<ChainReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_callback_data: Option<String>,
}

impl ReplicateDetails {
    pub fn with_receipt(receipt: ChainReceipt) -> Self {
        Self {
            chain_receipt: Some(receipt),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplicateStatus::*;

    #[test]
    fn test_display_matches_wire_name() {
        assert_eq!(AppDownloadFailed.to_string(), "APP_DOWNLOAD_FAILED");
        assert_eq!(
            AbortedOnConsensusReached.to_string(),
            "ABORTED_ON_CONSENSUS_REACHED"
        );
    }

    #[test]
    fn test_forward_transitions() {
        assert!(ReplicateStatus::is_forward_transition(Running, AppDownloading));
        assert!(ReplicateStatus::is_forward_transition(Contributed, Revealing));
        assert!(!ReplicateStatus::is_forward_transition(Computed, Running));
        assert!(ReplicateStatus::is_forward_transition(Computing, ComputeFailed));
        assert!(!ReplicateStatus::is_forward_transition(ComputeFailed, Computed));
    }

    #[test]
    fn test_abort_reachable_from_in_flight_states() {
        assert!(ReplicateStatus::is_forward_transition(Computing, AbortedOnConsensusReached));
        assert!(ReplicateStatus::is_forward_transition(ComputeFailed, AbortedOnContributionTimeout));
        assert!(!ReplicateStatus::is_forward_transition(Completed, AbortedOnConsensusReached));
    }

    #[test]
    fn test_classification() {
        assert!(OutOfGas.is_failure());
        assert!(Completed.is_terminal());
        assert!(!Contributed.is_terminal());
        assert_eq!(CantReveal.stage(), None);
    }

    #[test]
    fn test_details_skip_empty_fields() {
        let json = serde_json::to_value(ReplicateDetails::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));

        let details = ReplicateDetails::with_receipt(ChainReceipt {
            block_number: 12,
            tx_hash: "0xdead".to_string(),
        });
        let json = serde_json::to_value(details).unwrap();
        assert_eq!(json["chainReceipt"]["blockNumber"], 12);
    }
}
