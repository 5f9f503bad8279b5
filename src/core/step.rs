//! Step lifecycle engine.
//!
//! Concrete build stages implement [`Step`]. The pipeline driver wraps each
//! one in a [`StepRunner`], which walks it through
//! `start → setup → process` and then exactly one terminal outcome
//! (`succeed`, `fail`, `cancel`, `skip`). Hooks talk to the engine through
//! the [`StepContext`] they are handed: logging, warnings, build variables
//! and process execution all go through it, so every change reaches the
//! update sink.
//!
//! While a step runs, a heartbeat task pushes its record whenever the
//! serialized snapshot changed. Every push (heartbeat or explicit) holds the
//! same per-step permit, and once the sink has accepted the terminal flush
//! nothing else is pushed for that step.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{UpdateSink, VariableStore};
use crate::domain::{
    BuildResult, BuildStepRecord, BuildUpdate, LogEntry, LogLevel, OutputKind, ProcessFault,
};

use super::executor::{ProcessExecutor, ProcessRequest};

/// Heartbeat interval in milliseconds
pub const HEARTBEAT_INTERVAL_KEY: &str = "step.heartbeat_interval_ms";
/// Grace period after `process` before the forced update, in milliseconds
pub const LOG_SETTLE_KEY: &str = "step.log_settle_ms";
/// Mirror every step log entry to the diagnostic log at info level
pub const FORCE_LOGGING_KEY: &str = "step.force_logging";
/// Timeout for processes started by steps, in seconds
pub const PROCESS_TIMEOUT_KEY: &str = "process.default_timeout_seconds";

const DEFAULT_HEARTBEAT_MS: u64 = 2000;
const MIN_HEARTBEAT_MS: u64 = 50;
const DEFAULT_LOG_SETTLE_MS: u64 = 500;
const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 600;
/// Tries of the terminal flush before `stop` gives up, one heartbeat apart
const FINAL_PUSH_ATTEMPTS: usize = 3;

/// Tuning knobs of the step engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSettings {
    pub heartbeat_interval: Duration,
    pub log_settle_delay: Duration,
    pub force_logging: bool,
    pub process_timeout: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            log_settle_delay: Duration::from_millis(DEFAULT_LOG_SETTLE_MS),
            force_logging: false,
            process_timeout: Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS),
        }
    }
}

impl StepSettings {
    /// Read settings from a variable store; missing or bad values use defaults
    pub fn from_variables(vars: &dyn VariableStore) -> Self {
        let number = |key: &str| -> Option<u64> {
            let raw = vars.get_variable(key)?;
            match raw.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring non-numeric setting");
                    None
                }
            }
        };

        let heartbeat_ms = number(HEARTBEAT_INTERVAL_KEY)
            .unwrap_or(DEFAULT_HEARTBEAT_MS)
            .max(MIN_HEARTBEAT_MS);

        Self {
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            log_settle_delay: Duration::from_millis(
                number(LOG_SETTLE_KEY).unwrap_or(DEFAULT_LOG_SETTLE_MS),
            ),
            force_logging: vars
                .get_variable(FORCE_LOGGING_KEY)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(false),
            process_timeout: Duration::from_secs(
                number(PROCESS_TIMEOUT_KEY).unwrap_or(DEFAULT_PROCESS_TIMEOUT_SECS),
            ),
        }
    }
}

/// Parse a boolean-ish setting
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Where a runner is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Started,
    SetUp,
    Processed,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::SetUp => "set up",
            Self::Processed => "processed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Errors raised by lifecycle operations
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}' was cancelled")]
    Cancelled { step: String },

    #[error("step '{step}' cannot {operation} while {phase}")]
    InvalidTransition {
        step: String,
        operation: &'static str,
        phase: Phase,
    },

    #[error("step '{step}' failed: {cause:#}")]
    Hook { step: String, cause: anyhow::Error },
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A build stage
///
/// All hooks default to doing nothing, so a stage only overrides what it
/// needs. Returning an error from `setup` or `process` lets the driver fail
/// the step.
#[async_trait]
pub trait Step: Send + Sync {
    /// Decide from build state whether the step should run at all
    fn check_guards(&self, ctx: &StepContext) -> bool {
        let _ = ctx;
        true
    }

    /// Resolve collaborators before processing
    async fn setup(&mut self, ctx: &StepContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Do the work
    async fn process(&mut self, ctx: &StepContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Everything the steps of one build share
#[derive(Clone)]
pub struct StepEnvironment {
    pub build_id: Uuid,
    pub sink: Arc<dyn UpdateSink>,

    /// Aborts the whole build
    pub cancel: CancellationToken,

    pub settings: StepSettings,
    pub executor: ProcessExecutor,

    /// The build's variable bag
    pub variables: Arc<Mutex<BTreeMap<String, String>>>,

    /// Default working directory for processes
    pub working_dir: PathBuf,
}

impl StepEnvironment {
    pub fn new(build_id: Uuid, sink: Arc<dyn UpdateSink>, cancel: CancellationToken) -> Self {
        Self {
            build_id,
            sink,
            cancel,
            settings: StepSettings::default(),
            executor: ProcessExecutor::default(),
            variables: Arc::new(Mutex::new(BTreeMap::new())),
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_settings(mut self, settings: StepSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_executor(mut self, executor: ProcessExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = Arc::new(Mutex::new(variables));
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// Current copy of the build variables
    pub fn variables(&self) -> BTreeMap<String, String> {
        self.variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// How a process run ended, from the step's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(i32),
    Cancelled,
    TimedOut(Duration),
    Faulted(ProcessFault),
}

/// Result of [`StepContext::run_process`]
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub command: String,
    pub outcome: ProcessOutcome,

    /// Standard-output messages (structured ones decoded)
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessSummary {
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ProcessOutcome::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == ProcessOutcome::Exited(0)
    }

    /// Error unless the process exited with code zero
    pub fn ensure_success(&self) -> Result<()> {
        match &self.outcome {
            ProcessOutcome::Exited(0) => Ok(()),
            ProcessOutcome::Exited(code) => match self.stderr.last() {
                Some(last) => anyhow::bail!("'{}' exited with code {}: {}", self.command, code, last),
                None => anyhow::bail!("'{}' exited with code {}", self.command, code),
            },
            ProcessOutcome::Cancelled => anyhow::bail!("'{}' was cancelled", self.command),
            ProcessOutcome::TimedOut(after) => {
                anyhow::bail!("'{}' timed out after {}s", self.command, after.as_secs())
            }
            ProcessOutcome::Faulted(fault) => anyhow::bail!("'{}' failed: {}", self.command, fault),
        }
    }
}

#[derive(Debug, Default)]
struct PushState {
    /// Last snapshot the sink accepted
    last: Option<serde_json::Value>,

    /// Set once the terminal flush was accepted; no pushes after it
    closed: bool,

    /// The step stopped but the sink has not accepted its terminal record
    final_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    /// Only if the snapshot changed
    Heartbeat,
    Forced,
    /// Forced, and closes the step for further pushes
    Final,
}

struct Shared {
    env: StepEnvironment,
    name: String,
    index: usize,
    record: Mutex<BuildStepRecord>,
    /// The single permit every push goes through
    push: tokio::sync::Mutex<PushState>,
    warned: AtomicBool,
}

/// Handle passed to step hooks; cheap to clone
#[derive(Clone)]
pub struct StepContext {
    shared: Arc<Shared>,
}

impl StepContext {
    pub fn new(env: &StepEnvironment, index: usize, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(Shared {
                env: env.clone(),
                record: Mutex::new(BuildStepRecord::new(name.clone(), index)),
                name,
                index,
                push: tokio::sync::Mutex::new(PushState::default()),
                warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn build_id(&self) -> Uuid {
        self.shared.env.build_id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn settings(&self) -> &StepSettings {
        &self.shared.env.settings
    }

    pub fn working_dir(&self) -> &Path {
        &self.shared.env.working_dir
    }

    /// The build-level abort signal
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shared.env.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.env.cancel.is_cancelled()
    }

    /// Current snapshot of the step record
    pub fn record(&self) -> BuildStepRecord {
        self.lock_record().clone()
    }

    fn lock_record(&self) -> MutexGuard<'_, BuildStepRecord> {
        self.shared.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut BuildStepRecord) -> R) -> R {
        f(&mut self.lock_record())
    }

    /// Append an entry to the step log
    pub fn log_entry(&self, entry: LogEntry) {
        let step = self.name();
        if self.settings().force_logging {
            info!(step, level = ?entry.level, "{}", entry.message);
        } else {
            debug!(step, level = ?entry.level, "{}", entry.message);
        }
        self.with_record(|r| r.log.push(entry));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_entry(LogEntry::new(level, message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Record a non-terminal warning
    ///
    /// The step keeps running; a later `succeed` ends as `Warning`.
    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
        self.shared.warned.store(true, Ordering::SeqCst);
        self.with_record(|r| {
            if !r.finished && r.result != BuildResult::Failed {
                r.result = BuildResult::Warning;
            }
        });
    }

    pub fn has_warned(&self) -> bool {
        self.shared.warned.load(Ordering::SeqCst)
    }

    /// Read a build variable
    pub fn variable(&self, key: &str) -> Option<String> {
        self.shared
            .env
            .variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Set a build variable for later steps and push it
    pub async fn set_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.shared
            .env
            .variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.clone());

        let update = BuildUpdate::variable(key, value);
        if let Err(e) = self
            .shared
            .env
            .sink
            .apply_build_update(self.build_id(), &update)
            .await
        {
            warn!(step = self.name(), error = %format!("{:#}", e), "failed to push build variable");
        }
    }

    /// A request preset with this step's working directory, timeout and build
    pub fn process_request(
        &self,
        executable: impl Into<PathBuf>,
        arguments: impl Into<String>,
    ) -> ProcessRequest {
        ProcessRequest::new(executable, self.working_dir(), arguments)
            .with_timeout(self.settings().process_timeout)
            .for_build(self.build_id())
    }

    /// Run a process under the build's abort signal, logging its output
    ///
    /// Never fails: the outcome is returned so the step decides severity.
    pub async fn run_process(&self, request: ProcessRequest) -> ProcessSummary {
        let command = request.describe();
        self.info(format!("> {}", command));

        let mut stream = self.shared.env.executor.execute(request, self.cancellation());
        let mut summary = ProcessSummary {
            command,
            outcome: ProcessOutcome::Faulted(ProcessFault::Internal {
                message: "process produced no terminal event".to_string(),
            }),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };

        while let Some(line) = stream.next().await {
            match line.kind {
                OutputKind::Output if line.process_id.is_some() => self.debug(line.content),
                OutputKind::Output => {
                    let mut entry = LogEntry::new(LogLevel::Info, line.content.clone());
                    if let Some(colour) = line.colour {
                        entry = entry.with_colour(colour);
                    }
                    self.log_entry(entry);
                    summary.stdout.push(line.content);
                }
                OutputKind::Error => match line.fault {
                    None => {
                        self.error(line.content.clone());
                        summary.stderr.push(line.content);
                    }
                    Some(ProcessFault::Timeout { after }) => {
                        self.error(line.content);
                        summary.outcome = ProcessOutcome::TimedOut(after);
                    }
                    Some(fault) => {
                        self.error(line.content);
                        summary.outcome = ProcessOutcome::Faulted(fault);
                    }
                },
                OutputKind::Completed => {
                    let code = line.exit_code.unwrap_or(-1);
                    self.debug(line.content);
                    summary.outcome = ProcessOutcome::Exited(code);
                }
                OutputKind::Cancelled => {
                    self.log(LogLevel::Warning, line.content);
                    summary.outcome = ProcessOutcome::Cancelled;
                }
            }
        }

        summary
    }

    /// Push the current record now
    pub async fn update(&self) {
        self.push(Push::Forced).await;
    }

    /// Push the record; returns whether the sink accepted it (or had it already)
    async fn push(&self, kind: Push) -> bool {
        let mut state = self.shared.push.lock().await;
        if state.closed {
            debug!(step = self.name(), ?kind, "step already flushed; dropping push");
            return true;
        }

        // Until the terminal record lands, every push after stop is a final one
        let kind = if state.final_pending { Push::Final } else { kind };

        let record = self.record();
        let snapshot = match serde_json::to_value(&record) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(step = self.name(), error = %e, "failed to snapshot step");
                return false;
            }
        };

        if kind == Push::Heartbeat && state.last.as_ref() == Some(&snapshot) {
            return true;
        }

        match self
            .shared
            .env
            .sink
            .apply_step_update(self.build_id(), &record)
            .await
        {
            Ok(()) => {
                state.last = Some(snapshot);
                if kind == Push::Final {
                    state.closed = true;
                    state.final_pending = false;
                }
                true
            }
            Err(e) => {
                // Not marked as pushed; the next heartbeat, or the next update after stop, retries
                if kind == Push::Final {
                    state.final_pending = true;
                }
                warn!(step = self.name(), ?kind, error = %format!("{:#}", e), "failed to push step update");
                false
            }
        }
    }

    /// Whether the terminal record has been accepted by the sink
    pub async fn is_flushed(&self) -> bool {
        self.shared.push.lock().await.closed
    }
}

/// Background task pushing changed snapshots on an interval
struct Heartbeat {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn spawn(ctx: StepContext) -> Self {
        // Also stops when the build is aborted
        let stop = ctx.cancellation().child_token();
        let token = stop.clone();
        let interval = ctx.settings().heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        ctx.push(Push::Heartbeat).await;
                    }
                }
            }
            debug!(step = ctx.name(), "heartbeat stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the task and wait until it can no longer push
    async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Drives one step through its lifecycle
pub struct StepRunner {
    step: Box<dyn Step>,
    ctx: StepContext,
    phase: Phase,
    heartbeat: Option<Heartbeat>,
}

impl StepRunner {
    pub fn new(step: Box<dyn Step>, ctx: StepContext) -> Self {
        Self {
            step,
            ctx,
            phase: Phase::Created,
            heartbeat: None,
        }
    }

    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn record(&self) -> BuildStepRecord {
        self.ctx.record()
    }

    fn ensure_not_cancelled(&self) -> Result<(), StepError> {
        if self.ctx.is_cancelled() {
            return Err(StepError::Cancelled {
                step: self.name().to_string(),
            });
        }
        Ok(())
    }

    fn require(&self, operation: &'static str, expected: Phase) -> Result<(), StepError> {
        if self.phase != expected {
            return Err(StepError::InvalidTransition {
                step: self.name().to_string(),
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn hook_error(&self, cause: anyhow::Error) -> StepError {
        StepError::Hook {
            step: self.name().to_string(),
            cause,
        }
    }

    /// Mark the step running and start its heartbeat
    pub async fn start(&mut self) -> Result<(), StepError> {
        self.ensure_not_cancelled()?;
        self.require("start", Phase::Created)?;

        self.ctx.with_record(|r| {
            r.running = true;
            r.started_at = Some(Utc::now());
        });
        self.phase = Phase::Started;
        info!(build_id = %self.ctx.build_id(), step = self.name(), "step started");

        self.heartbeat = Some(Heartbeat::spawn(self.ctx.clone()));
        self.ctx.update().await;
        Ok(())
    }

    /// Whether the step wants to run given the current build state
    pub fn check_guards(&self) -> bool {
        self.step.check_guards(&self.ctx)
    }

    pub async fn setup(&mut self) -> Result<(), StepError> {
        self.ensure_not_cancelled()?;
        self.require("set up", Phase::Started)?;

        if let Err(cause) = self.step.setup(&self.ctx).await {
            return Err(self.hook_error(cause));
        }
        self.phase = Phase::SetUp;

        self.ctx.update().await;
        Ok(())
    }

    /// Run the process hook, then flush once trailing log lines have landed
    pub async fn process(&mut self) -> Result<(), StepError> {
        self.ensure_not_cancelled()?;
        self.require("process", Phase::SetUp)?;

        let result = self.step.process(&self.ctx).await;
        self.phase = Phase::Processed;

        tokio::time::sleep(self.ctx.settings().log_settle_delay).await;
        self.ctx.update().await;

        result.map_err(|cause| self.hook_error(cause))
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.ctx.warning(message);
    }

    /// Finish successfully, or with `Warning` if a warning was raised
    pub async fn succeed(&mut self) {
        let result = if self.ctx.has_warned() {
            BuildResult::Warning
        } else {
            BuildResult::Success
        };
        let message = match result {
            BuildResult::Warning => "Step completed with warnings",
            _ => "Step completed",
        };
        self.finish(result, LogLevel::Info, message.to_string()).await;
    }

    pub async fn fail(&mut self, cause: impl fmt::Display) {
        self.finish(BuildResult::Failed, LogLevel::Error, format!("Step failed: {:#}", cause))
            .await;
    }

    pub async fn cancel(&mut self) {
        self.finish(BuildResult::Cancelled, LogLevel::Warning, "Step cancelled".to_string())
            .await;
    }

    pub async fn skip(&mut self) {
        self.finish(BuildResult::Skipped, LogLevel::Info, "Step skipped".to_string())
            .await;
    }

    async fn finish(&mut self, result: BuildResult, level: LogLevel, message: String) {
        if self.phase == Phase::Stopped {
            debug!(step = self.name(), %result, "step already finished; ignoring");
            return;
        }

        self.ctx.log(level, message);
        self.ctx.with_record(|r| {
            // Failed is sticky
            if r.result != BuildResult::Failed {
                r.result = result;
            }
        });
        self.stop().await;
    }

    /// Shared terminal sequence
    async fn stop(&mut self) {
        self.ctx.with_record(|r| {
            r.running = false;
            r.finished = true;
            r.finished_at = Some(Utc::now());
        });
        self.phase = Phase::Stopped;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.shutdown().await;
        }
        let mut delivered = self.ctx.push(Push::Final).await;
        for _ in 1..FINAL_PUSH_ATTEMPTS {
            if delivered {
                break;
            }
            tokio::time::sleep(self.ctx.settings().heartbeat_interval).await;
            delivered = self.ctx.push(Push::Final).await;
        }
        if !delivered {
            warn!(
                build_id = %self.ctx.build_id(),
                step = self.name(),
                "terminal step update not delivered; next update() retries"
            );
        }

        let result = self.ctx.record().result;
        info!(build_id = %self.ctx.build_id(), step = self.name(), %result, "step finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemorySink;
    use std::collections::HashMap;

    fn fast_settings() -> StepSettings {
        StepSettings {
            heartbeat_interval: Duration::from_millis(20),
            log_settle_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn runner_with(step: impl Step + 'static) -> (StepRunner, Arc<MemorySink>, CancellationToken) {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let env = StepEnvironment::new(Uuid::new_v4(), sink.clone(), cancel.clone())
            .with_settings(fast_settings());
        let ctx = StepContext::new(&env, 0, "sign");
        (StepRunner::new(Box::new(step), ctx), sink, cancel)
    }

    struct Noop;
    impl Step for Noop {}

    #[test]
    fn test_settings_defaults_when_missing() {
        let settings = StepSettings::from_variables(&crate::adapters::NoVariables);
        assert_eq!(settings, StepSettings::default());
    }

    #[test]
    fn test_settings_from_variables() {
        let vars: HashMap<String, String> = [
            (HEARTBEAT_INTERVAL_KEY, "10"),
            (LOG_SETTLE_KEY, "nonsense"),
            (FORCE_LOGGING_KEY, "yes"),
            (PROCESS_TIMEOUT_KEY, "30"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = StepSettings::from_variables(&vars);
        // Clamped to the minimum
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(MIN_HEARTBEAT_MS));
        assert_eq!(settings.log_settle_delay, Duration::from_millis(DEFAULT_LOG_SETTLE_MS));
        assert!(settings.force_logging);
        assert_eq!(settings.process_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[tokio::test]
    async fn test_start_pushes_running_snapshot() {
        let (mut runner, sink, _cancel) = runner_with(Noop);
        runner.start().await.unwrap();

        let updates = sink.step_updates(0);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].running);
        assert!(updates[0].started_at.is_some());

        runner.succeed().await;
    }

    #[tokio::test]
    async fn test_start_after_cancel_is_rejected() {
        let (mut runner, sink, cancel) = runner_with(Noop);
        cancel.cancel();

        let err = runner.start().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(sink.step_updates(0).is_empty());
    }

    #[tokio::test]
    async fn test_setup_before_start_is_invalid() {
        let (mut runner, _sink, _cancel) = runner_with(Noop);
        let err = runner.setup().await.unwrap_err();
        assert!(matches!(
            err,
            StepError::InvalidTransition {
                phase: Phase::Created,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_is_sticky() {
        let (mut runner, _sink, _cancel) = runner_with(Noop);
        runner.start().await.unwrap();
        runner.fail(anyhow::anyhow!("signing key missing")).await;
        runner.succeed().await;

        let record = runner.record();
        assert_eq!(record.result, BuildResult::Failed);
        assert!(record
            .log
            .iter()
            .any(|e| e.message.contains("signing key missing")));
    }

    #[tokio::test]
    async fn test_no_push_after_stop() {
        let (mut runner, sink, _cancel) = runner_with(Noop);
        runner.start().await.unwrap();
        runner.skip().await;

        let count = sink.step_updates(0).len();
        runner.context().info("late line");
        runner.context().update().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.step_updates(0).len(), count);
        let last = sink.step_updates(0).pop().unwrap();
        assert!(last.finished);
        assert_eq!(last.result, BuildResult::Skipped);
    }
}
