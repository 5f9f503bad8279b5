//! Registry of OS processes spawned on behalf of builds.
//!
//! The executor registers every child it starts for a build and removes it
//! once the child has exited. Anything still registered after a build was
//! aborted is an orphan: `kill_build` finds and terminates it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-wide tracker shared by every executor
static SHARED: OnceLock<Arc<ProcessTracker>> = OnceLock::new();

/// One tracked child process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedProcess {
    pub process_id: u32,
    pub build_id: Uuid,

    /// Executable and arguments, for operators
    pub description: String,

    pub registered_at: DateTime<Utc>,
}

/// Outcome of an emergency sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Processes that were signalled
    pub killed: Vec<u32>,

    /// Entries whose process had already exited
    pub missing: Vec<u32>,

    /// Processes that refused the kill; their entries are kept
    pub failed: Vec<u32>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.killed.is_empty() && self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Thread-safe map of process id to the build that spawned it
#[derive(Debug, Default)]
pub struct ProcessTracker {
    entries: Mutex<HashMap<u32, TrackedProcess>>,
}

impl ProcessTracker {
    /// Create an empty, private tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide tracker
    pub fn shared() -> Arc<Self> {
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, TrackedProcess>> {
        // Entries stay consistent even if a holder panicked mid-operation
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a process; a second registration of the same id replaces the first
    pub fn register(
        &self,
        process_id: u32,
        build_id: Uuid,
        description: impl Into<String>,
    ) -> Option<TrackedProcess> {
        let entry = TrackedProcess {
            process_id,
            build_id,
            description: description.into(),
            registered_at: Utc::now(),
        };
        debug!(pid = process_id, %build_id, "tracking process");
        let previous = self.lock().insert(process_id, entry);
        if let Some(ref previous) = previous {
            if previous.build_id != build_id {
                warn!(
                    pid = process_id,
                    old_build = %previous.build_id,
                    new_build = %build_id,
                    "process id re-registered for a different build"
                );
            }
        }
        previous
    }

    /// Stop tracking a process; unknown ids are ignored
    pub fn unregister(&self, process_id: u32) -> Option<TrackedProcess> {
        let removed = self.lock().remove(&process_id);
        if removed.is_some() {
            debug!(pid = process_id, "untracked process");
        }
        removed
    }

    pub fn contains(&self, process_id: u32) -> bool {
        self.lock().contains_key(&process_id)
    }

    pub fn get(&self, process_id: u32) -> Option<TrackedProcess> {
        self.lock().get(&process_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of tracked processes, optionally for one build, ordered by id
    pub fn entries(&self, build_id: Option<Uuid>) -> Vec<TrackedProcess> {
        let mut entries: Vec<TrackedProcess> = self
            .lock()
            .values()
            .filter(|e| build_id.map_or(true, |id| e.build_id == id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.process_id);
        entries
    }

    /// Terminate every process still tracked for a build
    pub fn kill_build(&self, build_id: Uuid) -> SweepReport {
        let targets = self.entries(Some(build_id));
        if !targets.is_empty() {
            info!(%build_id, count = targets.len(), "sweeping orphaned build processes");
        }
        self.sweep(targets)
    }

    /// Terminate every tracked process
    pub fn kill_all(&self) -> SweepReport {
        let targets = self.entries(None);
        if !targets.is_empty() {
            warn!(count = targets.len(), "emergency stop: killing all tracked processes");
        }
        self.sweep(targets)
    }

    fn sweep(&self, targets: Vec<TrackedProcess>) -> SweepReport {
        let mut report = SweepReport::default();
        if targets.is_empty() {
            return report;
        }

        let pids: Vec<Pid> = targets.iter().map(|t| Pid::from_u32(t.process_id)).collect();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);

        for target in targets {
            let pid = target.process_id;
            match system.process(Pid::from_u32(pid)) {
                Some(process) if process.kill() => {
                    info!(pid, build_id = %target.build_id, "killed tracked process");
                    self.remove_if_owned(&target);
                    report.killed.push(pid);
                }
                Some(_) => {
                    warn!(pid, build_id = %target.build_id, "failed to kill tracked process");
                    report.failed.push(pid);
                }
                None => {
                    debug!(pid, "tracked process already exited");
                    self.remove_if_owned(&target);
                    report.missing.push(pid);
                }
            }
        }

        report
    }

    /// Remove an entry unless it was re-registered since the snapshot
    fn remove_if_owned(&self, target: &TrackedProcess) {
        let mut entries = self.lock();
        if entries
            .get(&target.process_id)
            .is_some_and(|e| e.build_id == target.build_id && e.registered_at == target.registered_at)
        {
            entries.remove(&target.process_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let tracker = ProcessTracker::new();
        let build = Uuid::new_v4();

        assert!(tracker.register(100, build, "signtool sign").is_none());
        assert!(tracker.contains(100));
        assert_eq!(tracker.get(100).unwrap().description, "signtool sign");

        let removed = tracker.unregister(100).unwrap();
        assert_eq!(removed.build_id, build);
        assert!(!tracker.contains(100));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let tracker = ProcessTracker::new();
        assert!(tracker.unregister(4242).is_none());
        assert!(tracker.unregister(4242).is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let tracker = ProcessTracker::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        tracker.register(7, first, "git fetch");
        let previous = tracker.register(7, second, "git checkout").unwrap();

        assert_eq!(previous.build_id, first);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get(7).unwrap().build_id, second);
    }

    #[test]
    fn test_entries_filtered_by_build() {
        let tracker = ProcessTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.register(3, a, "one");
        tracker.register(1, a, "two");
        tracker.register(2, b, "three");

        let for_a: Vec<u32> = tracker.entries(Some(a)).iter().map(|e| e.process_id).collect();
        assert_eq!(for_a, vec![1, 3]);
        assert_eq!(tracker.entries(None).len(), 3);
    }

    #[test]
    fn test_sweep_of_exited_process_drops_entry() {
        let tracker = ProcessTracker::new();
        let build = Uuid::new_v4();
        // Far above any default pid_max, so no live process has it
        tracker.register(u32::MAX - 7, build, "ghost");

        let report = tracker.kill_build(build);
        assert_eq!(report.missing, vec![u32::MAX - 7]);
        assert!(tracker.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_build_terminates_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let tracker = ProcessTracker::new();
        let build = Uuid::new_v4();
        let other = Uuid::new_v4();
        tracker.register(child.id(), build, "sleep 30");
        tracker.register(u32::MAX - 9, other, "other build");

        let report = tracker.kill_build(build);

        assert_eq!(report.killed, vec![child.id()]);
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!tracker.contains(child.id()));
        // Other builds are untouched
        assert!(tracker.contains(u32::MAX - 9));
    }

    #[test]
    fn test_concurrent_registration() {
        let tracker = Arc::new(ProcessTracker::new());
        let build = Uuid::new_v4();

        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let pid = t * 1000 + i;
                        tracker.register(pid, build, "worker");
                        if i % 2 == 0 {
                            tracker.unregister(pid);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.len(), 8 * 50);
    }
}
