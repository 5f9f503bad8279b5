//! Adapter interfaces for external collaborators.
//!
//! The engine persists and broadcasts state through an [`UpdateSink`] and
//! reads tuning knobs through a [`VariableStore`]. How updates are stored or
//! where variables come from is up to the implementation.

pub mod memory;
pub mod store;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Build, BuildStepRecord, BuildUpdate};

// Re-export the bundled implementations
pub use memory::MemorySink;
pub use store::{JsonlBuildStore, UpdateRecord};

/// Receives every state change of a build
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// A build was queued with all its steps pre-allocated
    async fn create_build(&self, build: &Build) -> Result<()> {
        let _ = build;
        Ok(())
    }

    /// Merge a partial update into a build
    async fn apply_build_update(&self, build_id: Uuid, update: &BuildUpdate) -> Result<()>;

    /// Replace a step's record with its current snapshot
    async fn apply_step_update(&self, build_id: Uuid, step: &BuildStepRecord) -> Result<()>;
}

/// Key/value lookup for engine settings
pub trait VariableStore: Send + Sync {
    fn get_variable(&self, key: &str) -> Option<String>;
}

impl VariableStore for HashMap<String, String> {
    fn get_variable(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl VariableStore for BTreeMap<String, String> {
    fn get_variable(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Store without any variables; every lookup falls back to defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVariables;

impl VariableStore for NoVariables {
    fn get_variable(&self, _key: &str) -> Option<String> {
        None
    }
}
