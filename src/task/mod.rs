//! Task definitions: what the chain says about a task, and what the
//! scheduler grants or asks the worker to do about it.

pub mod authorization;
pub mod description;
pub mod notification;

pub use authorization::ContributionAuthorization;
pub use description::{AppType, TaskDescription};
pub use notification::{InterruptedReplicate, RecoveryAction, TaskNotification};
