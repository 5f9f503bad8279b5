//! Core orchestration logic.
//!
//! This module contains:
//! - OutputParser: Structured line decoding
//! - ProcessTracker: Registry of spawned processes, emergency sweep
//! - ProcessExecutor: Supervised process runs with timeout and cancellation
//! - Step: Step lifecycle engine
//! - Pipeline / StepRegistry: Pipeline definitions and step kinds
//! - Orchestrator: Main execution engine

pub mod executor;
pub mod orchestrator;
pub mod output_parser;
pub mod pipeline;
pub mod registry;
pub mod step;
pub mod tracker;

// Re-export commonly used types
pub use executor::{split_arguments, ProcessExecutor, ProcessRequest, ProcessStream};
pub use orchestrator::Orchestrator;
pub use output_parser::{try_parse, ParsedLine};
pub use pipeline::Pipeline;
pub use registry::{StepDefinition, StepFactory, StepRegistry};
pub use step::{
    ProcessOutcome, ProcessSummary, Step, StepContext, StepEnvironment, StepError, StepRunner,
    StepSettings,
};
pub use tracker::{ProcessTracker, SweepReport, TrackedProcess};
