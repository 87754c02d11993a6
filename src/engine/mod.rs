pub mod error;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod progress;
pub mod resume;
pub mod types;

pub use error::EngineError;
pub use executor::NodeExecutor;
pub use graph::{GraphDefinition, campaign_graph};
pub use orchestrator::{EngineConfig, StartOptions, WorkflowEngine, time_budget};
pub use resume::{ResumeController, ResumeMode, ResumePlan};
