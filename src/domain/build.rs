//! Build and step records.
//!
//! A `Build` is one run of a pipeline. It owns one `BuildStepRecord` per
//! step, all allocated up front in the not-started state. Steps never touch
//! these records directly: the step engine mutates them and pushes every
//! change through the update sink.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::log::{LogEntry, LogLevel};

/// Result of a build or of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    #[default]
    None,
    Success,
    Warning,
    Failed,
    Cancelled,
    Skipped,
}

impl BuildResult {
    /// Whether this is one of the terminal outcomes
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Lifecycle position of a step, derived from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    Running,
    Finished(BuildResult),
}

/// Observable state of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStepRecord {
    /// Step name (unique within the pipeline)
    pub name: String,

    /// Position in the pipeline
    pub index: usize,

    pub running: bool,
    pub finished: bool,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Result so far; `None` until a warning or terminal transition
    pub result: BuildResult,

    /// Accumulated log entries
    pub log: Vec<LogEntry>,
}

impl BuildStepRecord {
    /// Create a not-started record
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            running: false,
            finished: false,
            started_at: None,
            finished_at: None,
            result: BuildResult::None,
            log: Vec::new(),
        }
    }

    pub fn state(&self) -> StepState {
        if self.finished {
            StepState::Finished(self.result)
        } else if self.running {
            StepState::Running
        } else {
            StepState::NotStarted
        }
    }

    /// Count log entries at a given level
    pub fn count_level(&self, level: LogLevel) -> usize {
        self.log.iter().filter(|e| e.level == level).count()
    }
}

/// A pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,

    /// Name of the pipeline being built
    pub pipeline: String,

    /// One record per step, in pipeline order
    pub steps: Vec<BuildStepRecord>,

    /// Values steps pass forward to later steps
    pub variables: BTreeMap<String, String>,

    pub result: BuildResult,
    pub running: bool,
    pub finished: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Create a queued build with every step pre-allocated
    pub fn new<I, S>(pipeline: impl Into<String>, step_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = step_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| BuildStepRecord::new(name, i))
            .collect();

        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            steps,
            variables: BTreeMap::new(),
            result: BuildResult::None,
            running: false,
            finished: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Merge a partial update into this build
    pub fn apply(&mut self, update: &BuildUpdate) {
        if let Some(running) = update.running {
            self.running = running;
        }
        if let Some(finished) = update.finished {
            self.finished = finished;
        }
        if let Some(result) = update.result {
            self.result = result;
        }
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.finished_at {
            self.finished_at = Some(at);
        }
        if let Some(ref variables) = update.variables {
            self.variables.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Replace the record of a step with a newer snapshot
    pub fn apply_step(&mut self, record: &BuildStepRecord) {
        if let Some(slot) = self.steps.get_mut(record.index) {
            *slot = record.clone();
        }
    }

    /// Overall result from the step results
    ///
    /// A cancelled build is `Cancelled` regardless of its steps. Skipped
    /// steps never lower the result.
    pub fn aggregate_result(&self, cancelled: bool) -> BuildResult {
        if cancelled {
            return BuildResult::Cancelled;
        }

        let results = self.steps.iter().map(|s| s.result);
        let mut overall = BuildResult::Success;
        for result in results {
            match result {
                BuildResult::Failed => return BuildResult::Failed,
                BuildResult::Cancelled => overall = BuildResult::Cancelled,
                BuildResult::Warning if overall == BuildResult::Success => {
                    overall = BuildResult::Warning
                }
                _ => {}
            }
        }
        overall
    }
}

/// Partial update of a build; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BuildResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, String>>,
}

impl BuildUpdate {
    /// Update marking the build as started now
    pub fn started() -> Self {
        Self {
            running: Some(true),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Update marking the build as finished now with a result
    pub fn finished(result: BuildResult) -> Self {
        Self {
            running: Some(false),
            finished: Some(true),
            result: Some(result),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Update setting a single build variable
    pub fn variable(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(key.into(), value.into());
        Self {
            variables: Some(variables),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_preallocates_steps() {
        let build = Build::new("release", ["checkout", "sign", "publish"]);

        assert_eq!(build.steps.len(), 3);
        assert_eq!(build.steps[2].name, "publish");
        assert_eq!(build.steps[2].index, 2);
        assert!(build
            .steps
            .iter()
            .all(|s| s.state() == StepState::NotStarted));
    }

    #[test]
    fn test_apply_partial_update() {
        let mut build = Build::new("release", ["checkout"]);
        build.apply(&BuildUpdate::started());
        assert!(build.running);
        assert!(build.started_at.is_some());

        build.apply(&BuildUpdate::variable("source_changed", "true"));
        assert!(build.running);
        assert_eq!(build.variables.get("source_changed").map(String::as_str), Some("true"));

        build.apply(&BuildUpdate::finished(BuildResult::Success));
        assert!(!build.running);
        assert!(build.finished);
        assert_eq!(build.result, BuildResult::Success);
        // Earlier variables survive later partial updates
        assert!(build.variables.contains_key("source_changed"));
    }

    #[test]
    fn test_aggregate_result() {
        let mut build = Build::new("release", ["a", "b", "c"]);
        build.steps[0].result = BuildResult::Success;
        build.steps[1].result = BuildResult::Skipped;
        build.steps[2].result = BuildResult::Success;
        assert_eq!(build.aggregate_result(false), BuildResult::Success);

        build.steps[1].result = BuildResult::Warning;
        assert_eq!(build.aggregate_result(false), BuildResult::Warning);

        build.steps[2].result = BuildResult::Failed;
        assert_eq!(build.aggregate_result(false), BuildResult::Failed);
        assert_eq!(build.aggregate_result(true), BuildResult::Cancelled);
    }

    #[test]
    fn test_step_state() {
        let mut record = BuildStepRecord::new("sign", 0);
        assert_eq!(record.state(), StepState::NotStarted);

        record.running = true;
        assert_eq!(record.state(), StepState::Running);

        record.running = false;
        record.finished = true;
        record.result = BuildResult::Failed;
        assert_eq!(record.state(), StepState::Finished(BuildResult::Failed));
    }
}
