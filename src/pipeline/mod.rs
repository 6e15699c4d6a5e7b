//! Question-to-rows pipeline: the orchestrator and the result it returns.

pub mod orchestrator;
pub mod result;

pub use orchestrator::Orchestrator;
pub use result::{CandidateQuery, PipelineResult, PipelineStatus, StepTrace};
