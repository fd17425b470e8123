//! Error types for the worker

use thiserror::Error;

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised while driving a sandboxed container
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to pull image {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("Failed to create container {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("Failed to start container {0}: {1}")]
    Start(String, String),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Errors from the blockchain gateway
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain gateway unreachable: {0}")]
    Unreachable(String),

    #[error("Chain gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid chain data: {0}")]
    InvalidData(String),
}

/// Errors from the remote scheduler and its satellite services
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler unreachable: {0}")]
    Unreachable(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Scheduler returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode scheduler response: {0}")]
    Decode(String),

    #[error("Login failed: {0}")]
    Login(String),
}

impl SchedulerError {
    /// Connection-level failure, the equivalent of an HTTP status of 0
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Unreachable(_))
    }
}

impl From<reqwest::Error> for SchedulerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SchedulerError::Decode(err.to_string())
        } else if err.is_connect() || err.is_timeout() || err.is_request() {
            SchedulerError::Unreachable(err.to_string())
        } else if let Some(status) = err.status() {
            SchedulerError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            SchedulerError::Unreachable(err.to_string())
        }
    }
}

/// Errors while validating a contribution authorization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Authorization has no chain task id")]
    MissingTaskId,

    #[error("Malformed authorization: {0}")]
    Malformed(String),

    #[error("Authorization for {chain_task_id} is not signed by {expected_signer}")]
    InvalidSigner {
        chain_task_id: String,
        expected_signer: String,
    },

    #[error("Another authorization was already accepted for {chain_task_id}")]
    AlreadyAccepted { chain_task_id: String },
}

/// Errors from the result store
#[derive(Error, Debug)]
pub enum ResultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("No result recorded for task {0}")]
    UnknownTask(String),

    #[error("Result upload failed: {0}")]
    Upload(String),
}

/// Errors from dataset download and decryption
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download of {uri} failed: {reason}")]
    Download { uri: String, reason: String },

    #[error("Invalid dataset secret: {0}")]
    InvalidSecret(String),

    #[error("Dataset decryption failed: {0}")]
    Decryption(String),
}

/// Errors from the pre-compute, compute and post-compute stages
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Cannot pull image {0}")]
    ImagePull(String),

    #[error("Secure session not created: {0}")]
    Session(String),

    #[error("{stage} container failed: {reason}")]
    Execution { stage: &'static str, reason: String },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level worker error
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("No capacity left to run another task")]
    NoCapacity,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Insufficient gas on wallet {0}")]
    OutOfGas(String),
}
