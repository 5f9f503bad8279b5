//! Append-only build store with file-based persistence.
//!
//! Every build gets a directory holding `updates.jsonl`: one JSON record per
//! creation, build update, or step snapshot. Replaying the records in order
//! yields the latest state of the build.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Build, BuildStepRecord, BuildUpdate};

use super::UpdateSink;

/// One persisted change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum UpdateRecord {
    Created {
        at: DateTime<Utc>,
        build: Build,
    },
    Build {
        at: DateTime<Utc>,
        build_id: Uuid,
        update: BuildUpdate,
    },
    Step {
        at: DateTime<Utc>,
        build_id: Uuid,
        step: BuildStepRecord,
    },
}

impl UpdateRecord {
    pub fn build_id(&self) -> Uuid {
        match self {
            Self::Created { build, .. } => build.id,
            Self::Build { build_id, .. } | Self::Step { build_id, .. } => *build_id,
        }
    }
}

/// Rebuild the latest state of a build from its records
///
/// Records before the creation record are ignored.
pub fn replay_build(records: &[UpdateRecord]) -> Option<Build> {
    let mut build: Option<Build> = None;

    for record in records {
        match record {
            UpdateRecord::Created { build: created, .. } => build = Some(created.clone()),
            UpdateRecord::Build { update, .. } => {
                if let Some(ref mut build) = build {
                    build.apply(update);
                }
            }
            UpdateRecord::Step { step, .. } => {
                if let Some(ref mut build) = build {
                    build.apply_step(step);
                }
            }
        }
    }

    build
}

/// File-based build store using JSONL
pub struct JsonlBuildStore {
    /// Directory containing one subdirectory per build
    base_dir: PathBuf,

    /// Serializes appends from concurrent heartbeats
    write_lock: Mutex<()>,
}

impl JsonlBuildStore {
    /// Create a store rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store under the configured builds directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::config::builds_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to a build's update log
    pub fn updates_path(&self, build_id: Uuid) -> PathBuf {
        self.base_dir.join(build_id.to_string()).join("updates.jsonl")
    }

    /// Append a record to its build's log
    pub async fn append(&self, record: &UpdateRecord) -> Result<()> {
        let path = self.updates_path(record.build_id());
        let json = serde_json::to_string(record).context("Failed to serialize update")?;

        let _guard = self.write_lock.lock().await;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create build directory: {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open updates file: {}", path.display()))?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write update")?;
        file.flush().await.context("Failed to flush update")?;

        Ok(())
    }

    /// All records of a build in write order
    pub async fn replay(&self, build_id: Uuid) -> Result<Vec<UpdateRecord>> {
        let path = self.updates_path(build_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open updates file: {}", path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: UpdateRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse update: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }

    /// Latest state of a build, if it was ever created
    pub async fn load_build(&self, build_id: Uuid) -> Result<Option<Build>> {
        let records = self.replay(build_id).await?;
        Ok(replay_build(&records))
    }

    /// List all build ids in the store
    pub async fn list_builds(&self) -> Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut builds = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = Uuid::parse_str(name) {
                        builds.push(id);
                    }
                }
            }
        }

        Ok(builds)
    }
}

#[async_trait]
impl UpdateSink for JsonlBuildStore {
    async fn create_build(&self, build: &Build) -> Result<()> {
        self.append(&UpdateRecord::Created {
            at: Utc::now(),
            build: build.clone(),
        })
        .await
    }

    async fn apply_build_update(&self, build_id: Uuid, update: &BuildUpdate) -> Result<()> {
        self.append(&UpdateRecord::Build {
            at: Utc::now(),
            build_id,
            update: update.clone(),
        })
        .await
    }

    async fn apply_step_update(&self, build_id: Uuid, step: &BuildStepRecord) -> Result<()> {
        self.append(&UpdateRecord::Step {
            at: Utc::now(),
            build_id,
            step: step.clone(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildResult, LogEntry, LogLevel};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_replay_build() {
        let temp = TempDir::new().unwrap();
        let store = JsonlBuildStore::new(temp.path());
        let build = Build::new("release", ["checkout", "sign"]);

        store.create_build(&build).await.unwrap();
        store
            .apply_build_update(build.id, &BuildUpdate::started())
            .await
            .unwrap();

        let mut step = build.steps[1].clone();
        step.running = true;
        step.log.push(LogEntry::new(LogLevel::Info, "signing"));
        store.apply_step_update(build.id, &step).await.unwrap();

        let records = store.replay(build.id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], UpdateRecord::Created { .. }));

        let loaded = store.load_build(build.id).await.unwrap().unwrap();
        assert!(loaded.running);
        assert!(loaded.steps[1].running);
        assert_eq!(loaded.steps[1].log[0].message, "signing");
        assert!(!loaded.steps[0].running);
    }

    #[tokio::test]
    async fn test_replay_missing_build_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonlBuildStore::new(temp.path());

        let id = Uuid::new_v4();
        assert!(store.replay(id).await.unwrap().is_empty());
        assert!(store.load_build(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_builds() {
        let temp = TempDir::new().unwrap();
        let store = JsonlBuildStore::new(temp.path());

        let a = Build::new("a", ["one"]);
        let b = Build::new("b", ["one"]);
        store.create_build(&a).await.unwrap();
        store.create_build(&b).await.unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-build")).unwrap();

        let mut ids = store.list_builds().await.unwrap();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_replay_ignores_records_before_creation() {
        let build = Build::new("release", ["checkout"]);
        let records = vec![
            UpdateRecord::Build {
                at: Utc::now(),
                build_id: build.id,
                update: BuildUpdate::finished(BuildResult::Failed),
            },
            UpdateRecord::Created {
                at: Utc::now(),
                build: build.clone(),
            },
        ];

        let replayed = replay_build(&records).unwrap();
        assert_eq!(replayed.result, BuildResult::None);
    }
}
