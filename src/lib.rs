//! buildkeeper - build and release pipeline engine
//!
//! Runs pipelines of steps that drive external tools (compilers, git,
//! signing and packaging utilities) and records every state change of the
//! build as it happens.
//!
//! # Architecture
//!
//! - Each step walks a fixed lifecycle (start, setup, process, one terminal
//!   outcome) and pushes snapshots of itself to an update sink
//! - External tools run under a supervised executor that streams their
//!   output line by line and honours both a per-process timeout and the
//!   build-wide abort signal
//! - Every spawned process is tracked per build so an aborted build can
//!   sweep whatever it left behind
//!
//! # Modules
//!
//! - `core`: Output parser, process tracker and executor, step engine,
//!   pipelines and the orchestrator
//! - `steps`: Git Step / File Step building blocks and built-in step kinds
//! - `adapters`: Update sinks (JSONL store, in-memory) and variable lookup
//! - `domain`: Data structures (Build, BuildStepRecord, ProcessOutputLine)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! buildkeeper run release --var channel=nightly
//!
//! # Check build status
//! buildkeeper status <build-id> --logs
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod steps;

// Re-export main types at crate root for convenience
pub use adapters::{JsonlBuildStore, MemorySink, UpdateSink, VariableStore};
pub use core::{
    Orchestrator, Pipeline, ProcessExecutor, ProcessRequest, ProcessTracker, Step, StepContext,
    StepRegistry, StepRunner,
};
pub use domain::{Build, BuildResult, BuildStepRecord, OutputKind, ProcessOutputLine};
