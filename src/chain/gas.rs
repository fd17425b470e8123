//! Gas balance check and the process-wide halt it can trigger

use super::ChainService;
use crate::error::{WorkerError, WorkerResult};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

/// Guards every chain write behind a gas check.
///
/// Once the wallet is found short of gas the guard stays tripped until the
/// process restarts, and every subscriber to [`GasGuard::subscribe`] sees `true`.
pub struct GasGuard {
    chain: Arc<dyn ChainService>,
    wallet: String,
    halt: watch::Sender<bool>,
}

impl GasGuard {
    pub fn new(chain: Arc<dyn ChainService>, wallet: &str) -> Self {
        let (halt, _) = watch::channel(false);
        Self {
            chain,
            wallet: wallet.to_string(),
            halt,
        }
    }

    pub fn is_halted(&self) -> bool {
        *self.halt.borrow()
    }

    /// Receiver flipping to `true` when the worker runs out of gas
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.halt.subscribe()
    }

    /// `Ok` when a transaction can be sent.
    ///
    /// Returns [`WorkerError::OutOfGas`] only when the balance is known to be
    /// too low, and from then on without querying the chain again. A failed
    /// balance read is returned as [`WorkerError::Chain`] and leaves the guard
    /// untouched.
    pub async fn ensure_enough_gas(&self) -> WorkerResult<()> {
        if self.is_halted() {
            return Err(WorkerError::OutOfGas(self.wallet.clone()));
        }
        if self.chain.has_enough_gas(&self.wallet).await? {
            return Ok(());
        }
        self.trip();
        Err(WorkerError::OutOfGas(self.wallet.clone()))
    }

    fn trip(&self) {
        let banner = "*".repeat(80);
        error!("{}", banner);
        error!(
            "Out of gas! please refill your wallet [walletAddress:{}]",
            self.wallet
        );
        error!("{}", banner);
        self.halt.send_replace(true);
    }
}
