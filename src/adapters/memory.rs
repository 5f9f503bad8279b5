//! In-memory update sink.
//!
//! Records every update it receives. Useful for embedding the engine
//! without persistence and for asserting on pushed state in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{Build, BuildStepRecord, BuildUpdate};

use super::store::{replay_build, UpdateRecord};
use super::UpdateSink;

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<UpdateRecord>>,

    /// When set, every push is rejected
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UpdateRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject (or accept again) all further updates
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("update sink unavailable");
        }
        Ok(())
    }

    /// Every accepted record in arrival order
    pub fn records(&self) -> Vec<UpdateRecord> {
        self.lock().clone()
    }

    /// Snapshots pushed for the step at `index`
    pub fn step_updates(&self, index: usize) -> Vec<BuildStepRecord> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                UpdateRecord::Step { step, .. } if step.index == index => Some(step.clone()),
                _ => None,
            })
            .collect()
    }

    /// Partial build updates in arrival order
    pub fn build_updates(&self) -> Vec<BuildUpdate> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                UpdateRecord::Build { update, .. } => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    /// State of the build as an observer of the updates would see it
    pub fn latest_build(&self) -> Option<Build> {
        replay_build(&self.lock())
    }
}

#[async_trait]
impl UpdateSink for MemorySink {
    async fn create_build(&self, build: &Build) -> Result<()> {
        self.check()?;
        self.lock().push(UpdateRecord::Created {
            at: Utc::now(),
            build: build.clone(),
        });
        Ok(())
    }

    async fn apply_build_update(&self, build_id: Uuid, update: &BuildUpdate) -> Result<()> {
        self.check()?;
        self.lock().push(UpdateRecord::Build {
            at: Utc::now(),
            build_id,
            update: update.clone(),
        });
        Ok(())
    }

    async fn apply_step_update(&self, build_id: Uuid, step: &BuildStepRecord) -> Result<()> {
        self.check()?;
        self.lock().push(UpdateRecord::Step {
            at: Utc::now(),
            build_id,
            step: step.clone(),
        });
        Ok(())
    }
}
