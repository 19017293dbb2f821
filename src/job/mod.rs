//! Automation job domain types.
//!
//! - `model`: Job and Task rows, status enums, state machine helpers
//! - `cost`: token → cost estimation used at finalization

pub mod cost;
pub mod model;

pub use cost::CostModel;
pub use model::{
    Job, JobFinalization, JobProgress, JobStatus, JobTrigger, Task, TaskCompletion, TaskStatus,
    TaskType,
};
