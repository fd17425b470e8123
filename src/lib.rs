//! iExec worker node
//!
//! Receives task authorizations from a scheduler, runs the task application in
//! a container, stores the result and takes part in the on-chain
//! commit/reveal consensus before uploading the result.
//!
//! ## Module Structure
//!
//! - `config`: local settings and the scheduler's public configuration
//! - `crypto`: keccak hashing, secp256k1 signatures, EIP-712 challenges
//! - `task`: task description, contribution authorization, notifications
//! - `replicate`: replicate statuses reported to the scheduler
//! - `sandbox`: container runtime and the executor built on it
//! - `dataset`: input download, secrets and dataset decryption
//! - `compute`: pre-compute, compute and post-compute stages
//! - `result`: result store and upload
//! - `chain`: hub contract access, contribution and reveal protocols
//! - `scheduler`: scheduler, SMS and result repository clients
//! - `executor`: admission control and the per-task pipeline
//! - `worker`: process-level driver

pub mod error;

pub mod config;

pub mod crypto;

pub mod task;

pub mod replicate;

pub mod sandbox;

pub mod dataset;

pub mod compute;

pub mod result;

pub mod chain;

pub mod scheduler;

pub mod executor;

pub mod worker;

pub use chain::{ChainGatewayClient, ChainService, GasGuard};
pub use config::{PublicConfiguration, TaskLayout, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::{AdmissionController, PipelineContext, TaskPipeline};
pub use replicate::{ReplicateDetails, ReplicateStatus};
pub use result::ResultService;
pub use sandbox::{DockerRuntime, SandboxExecutor};
pub use scheduler::{NotificationFeed, SchedulerClient, SchedulerEvent, StatusReporter};
pub use task::{ContributionAuthorization, TaskDescription, TaskNotification};
pub use worker::{Worker, WorkerContext};
