//! Settlement
//!
//! The withdrawal pipeline and the worker pool that runs it.

pub mod pipeline;
pub mod worker;

pub use pipeline::{Collaborators, PipelineConfig, PipelineError, WithdrawalPipeline};
pub use worker::{Outcome, SettlementWorker, WorkerConfig, WorkerError};
