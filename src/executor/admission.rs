//! Bounded gate in front of task computations

use crate::error::{WorkerError, WorkerResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Fixed number of compute slots; each admitted task holds one until its
/// future resolves.
#[derive(Clone)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Non-blocking
    pub fn can_accept_more(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Spawn `task` on a free slot, or fail with [`WorkerError::NoCapacity`]
    pub fn submit<F>(&self, task: F) -> WorkerResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| WorkerError::NoCapacity)?;
        debug!(
            "Task admitted [active:{}, capacity:{}]",
            self.active_count(),
            self.capacity
        );
        Ok(tokio::spawn(async move {
            let output = task.await;
            drop(permit);
            output
        }))
    }
}
