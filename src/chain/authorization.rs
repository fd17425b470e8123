//! Cache of validated contribution authorizations, one per task

use crate::error::AuthorizationError;
use crate::task::ContributionAuthorization;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, warn};

/// Authorizations accepted by this worker, keyed by chain task id.
///
/// At most one authorization is accepted per task: the first valid one.
/// Any different authorization for that task is refused until it is removed.
pub struct AuthorizationStore {
    scheduler_address: String,
    authorizations: DashMap<String, ContributionAuthorization>,
}

impl AuthorizationStore {
    pub fn new(scheduler_address: &str) -> Self {
        Self {
            scheduler_address: scheduler_address.to_string(),
            authorizations: DashMap::new(),
        }
    }

    pub fn scheduler_address(&self) -> &str {
        &self.scheduler_address
    }

    /// Check the authorization against the scheduler signer without caching it
    pub fn validate(&self, authorization: &ContributionAuthorization) -> Result<(), AuthorizationError> {
        authorization.verify(&self.scheduler_address)
    }

    /// Validate and cache. Nothing is stored when validation fails.
    ///
    /// `Ok(true)` when this call accepted the authorization, `Ok(false)` when
    /// the very same one was already cached.
    pub fn put(&self, authorization: ContributionAuthorization) -> Result<bool, AuthorizationError> {
        if let Err(e) = self.validate(&authorization) {
            error!(
                "Cannot accept contribution authorization [chainTaskId:{}]: {}",
                authorization.chain_task_id, e
            );
            return Err(e);
        }

        let chain_task_id = authorization.chain_task_id.clone();
        match self.authorizations.entry(chain_task_id.clone()) {
            Entry::Occupied(entry) if *entry.get() == authorization => Ok(false),
            Entry::Occupied(_) => {
                warn!(
                    "Another contribution authorization already accepted [chainTaskId:{}]",
                    chain_task_id
                );
                Err(AuthorizationError::AlreadyAccepted { chain_task_id })
            }
            Entry::Vacant(entry) => {
                entry.insert(authorization);
                debug!("Contribution authorization cached [chainTaskId:{}]", chain_task_id);
                Ok(true)
            }
        }
    }

    pub fn get(&self, chain_task_id: &str) -> Option<ContributionAuthorization> {
        self.authorizations
            .get(chain_task_id)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, chain_task_id: &str) -> Option<ContributionAuthorization> {
        self.authorizations
            .remove(chain_task_id)
            .map(|(_, authorization)| authorization)
    }

    pub fn len(&self) -> usize {
        self.authorizations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorizations.is_empty()
    }
}
