//! Domain types for the build engine.
//!
//! This module contains the core data structures:
//! - Build: a pipeline run and its step records
//! - Log: user-visible step log entries
//! - Output: streamed child-process output

pub mod build;
pub mod log;
pub mod output;

// Re-export commonly used types
pub use build::{Build, BuildResult, BuildStepRecord, BuildUpdate, StepState};
pub use log::{LogEntry, LogLevel};
pub use output::{OutputKind, ProcessFault, ProcessOutputLine};
