//! Task execution: admission control in front of the per-task pipeline

pub mod admission;
pub mod pipeline;

pub use admission::AdmissionController;
pub use pipeline::{PipelineContext, TaskPipeline};
