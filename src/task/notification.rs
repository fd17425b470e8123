//! Instructions the scheduler sends about tasks already in flight

use super::ContributionAuthorization;
use serde::{Deserialize, Serialize};

/// External signal driving a task past its local stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskNotification {
    /// Contribute (or recompute then contribute) with this authorization
    PleaseContribute {
        authorization: ContributionAuthorization,
    },
    /// Consensus reached at `consensus_block`, reveal now
    PleaseReveal {
        chain_task_id: String,
        consensus_block: u64,
    },
    PleaseUpload {
        chain_task_id: String,
    },
    PleaseComplete {
        chain_task_id: String,
    },
    /// Another set of workers reached consensus without us
    PleaseAbortConsensusReached {
        chain_task_id: String,
    },
    PleaseAbortContributionTimeout {
        chain_task_id: String,
    },
}

impl TaskNotification {
    pub fn chain_task_id(&self) -> &str {
        match self {
            TaskNotification::PleaseContribute { authorization } => &authorization.chain_task_id,
            TaskNotification::PleaseReveal { chain_task_id, .. }
            | TaskNotification::PleaseUpload { chain_task_id }
            | TaskNotification::PleaseComplete { chain_task_id }
            | TaskNotification::PleaseAbortConsensusReached { chain_task_id }
            | TaskNotification::PleaseAbortContributionTimeout { chain_task_id } => chain_task_id,
        }
    }
}

/// What to do with a replicate interrupted by a worker restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    Wait,
    Contribute,
    AbortConsensusReached,
    AbortContributionTimeout,
    Reveal,
    UploadResult,
    Complete,
}

/// Entry of the scheduler's interrupted-replicates list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptedReplicate {
    pub contribution_authorization: ContributionAuthorization,
    pub recovery_action: RecoveryAction,
    /// Only meaningful for `Reveal`
    #[serde(default)]
    pub consensus_block: u64,
}

impl InterruptedReplicate {
    /// Translate into the notification the pipeline understands; `Wait` yields none
    pub fn into_notification(self) -> Option<TaskNotification> {
        let chain_task_id = self.contribution_authorization.chain_task_id.clone();
        match self.recovery_action {
            RecoveryAction::Wait => None,
            RecoveryAction::Contribute => Some(TaskNotification::PleaseContribute {
                authorization: self.contribution_authorization,
            }),
            RecoveryAction::AbortConsensusReached => {
                Some(TaskNotification::PleaseAbortConsensusReached { chain_task_id })
            }
            RecoveryAction::AbortContributionTimeout => {
                Some(TaskNotification::PleaseAbortContributionTimeout { chain_task_id })
            }
            RecoveryAction::Reveal => Some(TaskNotification::PleaseReveal {
                chain_task_id,
                consensus_block: self.consensus_block,
            }),
            RecoveryAction::UploadResult => Some(TaskNotification::PleaseUpload { chain_task_id }),
            RecoveryAction::Complete => Some(TaskNotification::PleaseComplete { chain_task_id }),
        }
    }
}
