//! Reveal protocol: disclose the determinism hash once consensus is reached

use super::{ChainContributionStatus, ChainReceipt, ChainService, ChainTaskStatus};
use crate::crypto::hash::compute_result_hash;
use crate::error::ChainError;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RevealService {
    chain: Arc<dyn ChainService>,
    worker_wallet: String,
}

impl RevealService {
    pub fn new(chain: Arc<dyn ChainService>, worker_wallet: &str) -> Self {
        Self {
            chain,
            worker_wallet: worker_wallet.to_string(),
        }
    }

    /// Local chain view has reached the consensus block
    pub async fn is_consensus_block_reached(&self, chain_task_id: &str, consensus_block: u64) -> bool {
        match self.chain.latest_block_number().await {
            Ok(latest) if latest >= consensus_block => true,
            Ok(latest) => {
                warn!(
                    "Chain view behind consensus block [chainTaskId:{}, latestBlock:{}, consensusBlock:{}]",
                    chain_task_id, latest, consensus_block
                );
                false
            }
            Err(e) => {
                warn!("Cannot read latest block [chainTaskId:{}]: {}", chain_task_id, e);
                false
            }
        }
    }

    /// On-chain state still lets this worker reveal `determinism_hash`
    pub async fn can_reveal(&self, chain_task_id: &str, determinism_hash: &str) -> bool {
        match self.check_can_reveal(chain_task_id, determinism_hash).await {
            Ok(can_reveal) => can_reveal,
            Err(e) => {
                warn!("Cannot check reveal eligibility [chainTaskId:{}]: {}", chain_task_id, e);
                false
            }
        }
    }

    async fn check_can_reveal(
        &self,
        chain_task_id: &str,
        determinism_hash: &str,
    ) -> Result<bool, ChainError> {
        let Some(task) = self.chain.view_task(chain_task_id).await? else {
            return Ok(false);
        };
        let Some(contribution) = self
            .chain
            .view_contribution(chain_task_id, &self.worker_wallet)
            .await?
        else {
            return Ok(false);
        };

        let is_revealing = task.status == ChainTaskStatus::Revealing;
        let before_deadline = chrono::Utc::now().timestamp() < task.reveal_deadline;
        let is_contributed = contribution.status == ChainContributionStatus::Contributed;
        let matches_consensus = contribution
            .result_hash
            .eq_ignore_ascii_case(&task.consensus_value);
        let matches_local = compute_result_hash(chain_task_id, determinism_hash)
            .map(|local| local.eq_ignore_ascii_case(&contribution.result_hash))
            .unwrap_or(false);

        debug!(
            "Reveal eligibility [chainTaskId:{}, revealing:{}, beforeDeadline:{}, contributed:{}, consensus:{}, local:{}]",
            chain_task_id, is_revealing, before_deadline, is_contributed, matches_consensus, matches_local
        );
        Ok(is_revealing && before_deadline && is_contributed && matches_consensus && matches_local)
    }

    pub async fn reveal(
        &self,
        chain_task_id: &str,
        determinism_hash: &str,
    ) -> Result<Option<ChainReceipt>, ChainError> {
        let receipt = self.chain.reveal(chain_task_id, determinism_hash).await?;
        if let Some(receipt) = &receipt {
            info!(
                "Reveal sent [chainTaskId:{}, txHash:{}, block:{}]",
                chain_task_id, receipt.tx_hash, receipt.block_number
            );
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::chain::ChainContribution;

    const WALLET: &str = "0x1a69b2eb604db8eba185df03ea4f5288dcbbd248";
    const TASK: &str = "0xd94b63fc2d3ec4b96daf84b403bbafdc8c8517e8e2addd51fec0fa4e67801be8";
    const HASH: &str = "0x09b727883db89fa3b3504f83e0c67d04a0d4fc35a9670cc4517c49d2a27ad171";

    fn revealing_chain() -> Arc<FakeChain> {
        let chain = FakeChain::new().with_active_task(TASK);
        let result_hash = compute_result_hash(TASK, HASH).unwrap();
        {
            let mut tasks = chain.tasks.lock();
            let task = tasks.get_mut(TASK).unwrap();
            task.status = ChainTaskStatus::Revealing;
            task.consensus_value = result_hash.clone();
        }
        chain.contributions.lock().insert(
            TASK.to_string(),
            ChainContribution {
                status: ChainContributionStatus::Contributed,
                result_hash,
                result_seal: String::new(),
            },
        );
        Arc::new(chain)
    }

    #[tokio::test]
    async fn test_can_reveal() {
        let service = RevealService::new(revealing_chain(), WALLET);
        assert!(service.can_reveal(TASK, HASH).await);
    }

    #[tokio::test]
    async fn test_cannot_reveal_other_result() {
        let service = RevealService::new(revealing_chain(), WALLET);
        let other = "0x0000000000000000000000000000000000000000000000000000000000000001";
        assert!(!service.can_reveal(TASK, other).await);
    }

    #[tokio::test]
    async fn test_cannot_reveal_outside_revealing_phase() {
        let chain = revealing_chain();
        chain.tasks.lock().get_mut(TASK).unwrap().status = ChainTaskStatus::Active;
        let service = RevealService::new(chain.clone(), WALLET);
        assert!(!service.can_reveal(TASK, HASH).await);

        chain.tasks.lock().get_mut(TASK).unwrap().status = ChainTaskStatus::Revealing;
        chain.tasks.lock().get_mut(TASK).unwrap().reveal_deadline = 1;
        assert!(!service.can_reveal(TASK, HASH).await);
    }

    #[tokio::test]
    async fn test_consensus_block_reached() {
        let chain = revealing_chain();
        *chain.latest_block.lock() = 99;
        let service = RevealService::new(chain.clone(), WALLET);
        assert!(!service.is_consensus_block_reached(TASK, 100).await);

        *chain.latest_block.lock() = 100;
        assert!(service.is_consensus_block_reached(TASK, 100).await);
    }

    #[tokio::test]
    async fn test_reveal_sends_determinism_hash() {
        let chain = revealing_chain();
        *chain.reveal_receipt.lock() = Some(ChainReceipt {
            block_number: 5,
            tx_hash: "0x02".to_string(),
        });
        let service = RevealService::new(chain.clone(), WALLET);

        let receipt = service.reveal(TASK, HASH).await.unwrap();
        assert!(receipt.unwrap().is_confirmed());
        assert_eq!(
            chain.reveal_calls.lock().as_slice(),
            &[(TASK.to_string(), HASH.to_string())]
        );
    }
}
