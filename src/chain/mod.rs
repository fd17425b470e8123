//! Blockchain integration: the hub contract seen through a gateway, and the
//! worker's side of the commit/reveal protocol.

pub mod authorization;
pub mod contribution;
pub mod gas;
pub mod gateway;
pub mod reveal;
pub mod types;

pub use authorization::AuthorizationStore;
pub use contribution::{ContributionService, EnclaveSignatureFile};
pub use gas::GasGuard;
pub use gateway::ChainGatewayClient;
pub use reveal::RevealService;
pub use types::{
    ChainAccount, ChainContribution, ChainContributionStatus, ChainReceipt, ChainTask,
    ChainTaskStatus, ContributeCall,
};

use crate::error::ChainError;
use crate::task::TaskDescription;
use async_trait::async_trait;

/// Read and write access to the hub contract.
///
/// Every call is a blocking round-trip from the caller's point of view.
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, ChainError>;

    async fn task_description(
        &self,
        chain_task_id: &str,
    ) -> Result<Option<TaskDescription>, ChainError>;

    async fn view_task(&self, chain_task_id: &str) -> Result<Option<ChainTask>, ChainError>;

    async fn view_contribution(
        &self,
        chain_task_id: &str,
        worker: &str,
    ) -> Result<Option<ChainContribution>, ChainError>;

    async fn view_account(&self, wallet: &str) -> Result<ChainAccount, ChainError>;

    /// Pool the worker is subscribed to, if any
    async fn view_affectation(&self, worker: &str) -> Result<Option<String>, ChainError>;

    async fn subscribe(&self, pool: &str) -> Result<Option<ChainReceipt>, ChainError>;

    async fn has_enough_gas(&self, wallet: &str) -> Result<bool, ChainError>;

    async fn contribute(&self, call: &ContributeCall) -> Result<Option<ChainReceipt>, ChainError>;

    async fn reveal(
        &self,
        chain_task_id: &str,
        result_digest: &str,
    ) -> Result<Option<ChainReceipt>, ChainError>;

    /// Task exists on-chain past the `Unset` state
    async fn is_task_initialized(&self, chain_task_id: &str) -> bool {
        matches!(
            self.view_task(chain_task_id).await,
            Ok(Some(task)) if task.status != ChainTaskStatus::Unset
        )
    }

    /// Local view has caught up with `block`
    async fn is_block_available(&self, block: u64) -> bool {
        matches!(self.latest_block_number().await, Ok(latest) if latest >= block)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory hub used across module tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeChain {
        pub latest_block: Mutex<u64>,
        pub descriptions: Mutex<HashMap<String, TaskDescription>>,
        pub tasks: Mutex<HashMap<String, ChainTask>>,
        pub contributions: Mutex<HashMap<String, ChainContribution>>,
        pub account: Mutex<ChainAccount>,
        pub affectation: Mutex<Option<String>>,
        pub enough_gas: Mutex<bool>,
        /// Makes the balance read fail with this message
        pub gas_read_error: Mutex<Option<String>>,
        pub contribute_receipt: Mutex<Option<ChainReceipt>>,
        pub reveal_receipt: Mutex<Option<ChainReceipt>>,
        pub contribute_calls: Mutex<Vec<ContributeCall>>,
        pub reveal_calls: Mutex<Vec<(String, String)>>,
        pub subscribe_calls: Mutex<Vec<String>>,
    }

    impl FakeChain {
        pub fn new() -> Self {
            let chain = Self::default();
            *chain.enough_gas.lock() = true;
            chain
        }

        pub fn with_active_task(self, chain_task_id: &str) -> Self {
            let now = chrono::Utc::now().timestamp();
            self.tasks.lock().insert(
                chain_task_id.to_string(),
                ChainTask {
                    chain_task_id: chain_task_id.to_string(),
                    status: ChainTaskStatus::Active,
                    contribution_deadline: now + 3600,
                    reveal_deadline: now + 7200,
                    final_deadline: now + 10800,
                    consensus_value: String::new(),
                    worker_stake: 0,
                },
            );
            self
        }
    }

    #[async_trait]
    impl ChainService for FakeChain {
        async fn latest_block_number(&self) -> Result<u64, ChainError> {
            Ok(*self.latest_block.lock())
        }

        async fn task_description(
            &self,
            chain_task_id: &str,
        ) -> Result<Option<TaskDescription>, ChainError> {
            Ok(self.descriptions.lock().get(chain_task_id).cloned())
        }

        async fn view_task(&self, chain_task_id: &str) -> Result<Option<ChainTask>, ChainError> {
            Ok(self.tasks.lock().get(chain_task_id).cloned())
        }

        async fn view_contribution(
            &self,
            chain_task_id: &str,
            _worker: &str,
        ) -> Result<Option<ChainContribution>, ChainError> {
            Ok(self.contributions.lock().get(chain_task_id).cloned())
        }

        async fn view_account(&self, _wallet: &str) -> Result<ChainAccount, ChainError> {
            Ok(self.account.lock().clone())
        }

        async fn view_affectation(&self, _worker: &str) -> Result<Option<String>, ChainError> {
            Ok(self.affectation.lock().clone())
        }

        async fn subscribe(&self, pool: &str) -> Result<Option<ChainReceipt>, ChainError> {
            self.subscribe_calls.lock().push(pool.to_string());
            *self.affectation.lock() = Some(pool.to_string());
            Ok(Some(ChainReceipt {
                block_number: 1,
                tx_hash: "0xsub".to_string(),
            }))
        }

        async fn has_enough_gas(&self, _wallet: &str) -> Result<bool, ChainError> {
            if let Some(reason) = self.gas_read_error.lock().clone() {
                return Err(ChainError::InvalidData(reason));
            }
            Ok(*self.enough_gas.lock())
        }

        async fn contribute(
            &self,
            call: &ContributeCall,
        ) -> Result<Option<ChainReceipt>, ChainError> {
            self.contribute_calls.lock().push(call.clone());
            Ok(self.contribute_receipt.lock().clone())
        }

        async fn reveal(
            &self,
            chain_task_id: &str,
            result_digest: &str,
        ) -> Result<Option<ChainReceipt>, ChainError> {
            self.reveal_calls
                .lock()
                .push((chain_task_id.to_string(), result_digest.to_string()));
            Ok(self.reveal_receipt.lock().clone())
        }
    }
}
