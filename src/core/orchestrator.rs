//! Main orchestrator for pipeline execution.
//!
//! Builds every step of a pipeline up front, then drives them one after the
//! other through the step lifecycle, pushing build-level updates to the sink
//! and sweeping leftover processes when the build is aborted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::adapters::UpdateSink;
use crate::domain::{Build, BuildResult, BuildUpdate};

use super::executor::ProcessExecutor;
use super::pipeline::Pipeline;
use super::registry::StepRegistry;
use super::step::{StepContext, StepEnvironment, StepRunner, StepSettings};

/// Main pipeline orchestrator
pub struct Orchestrator {
    registry: StepRegistry,
    sink: Arc<dyn UpdateSink>,
    executor: ProcessExecutor,

    /// Default working directory for step processes
    working_dir: PathBuf,
}

impl Orchestrator {
    /// Create an orchestrator using the process-wide tracker
    pub fn new(registry: StepRegistry, sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            registry,
            sink,
            executor: ProcessExecutor::default(),
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_executor(mut self, executor: ProcessExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Execute a pipeline
    ///
    /// Returns the finished build. Errors are reserved for problems before
    /// the build exists (invalid pipeline, bad step options, sink refusing
    /// the new build); step failures end up in the build result.
    #[instrument(skip(self, pipeline, variables, cancel), fields(pipeline = %pipeline.name))]
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        variables: BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<Build> {
        pipeline.validate(&self.registry)?;

        let steps = pipeline
            .steps
            .iter()
            .map(|definition| self.registry.create(definition))
            .collect::<Result<Vec<_>>>()?;

        let mut build = Build::new(pipeline.name.clone(), pipeline.step_names());
        build.variables = variables.clone();
        let build_id = build.id;
        info!(%build_id, steps = steps.len(), "Starting build");

        self.sink
            .create_build(&build)
            .await
            .with_context(|| format!("Failed to create build {}", build_id))?;
        self.push_build(&mut build, BuildUpdate::started()).await;

        let env = StepEnvironment::new(build_id, self.sink.clone(), cancel.clone())
            .with_settings(StepSettings::from_variables(&variables))
            .with_executor(self.executor.clone())
            .with_variables(variables)
            .with_working_dir(self.working_dir.clone());

        for (index, (definition, step)) in pipeline.steps.iter().zip(steps).enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let ctx = StepContext::new(&env, index, definition.name.clone());
            let mut runner = StepRunner::new(step, ctx);
            let result = self.run_step(&mut runner, &cancel).await;
            build.apply_step(&runner.record());

            match result {
                BuildResult::Failed => {
                    error!(step = %definition.name, "Step failed, stopping build");
                    break;
                }
                BuildResult::Cancelled => break,
                _ => {}
            }
        }

        build.variables = env.variables();

        let cancelled = cancel.is_cancelled();
        if cancelled {
            let report = self.executor.tracker().kill_build(build_id);
            if !report.is_empty() {
                warn!(
                    %build_id,
                    killed = report.killed.len(),
                    failed = report.failed.len(),
                    "Swept leftover processes"
                );
            }
        }

        let result = build.aggregate_result(cancelled);
        self.push_build(&mut build, BuildUpdate::finished(result)).await;
        info!(%build_id, %result, "Build finished");

        Ok(build)
    }

    /// Drive one step to a terminal state and return its result
    async fn run_step(&self, runner: &mut StepRunner, cancel: &CancellationToken) -> BuildResult {
        if let Err(e) = runner.start().await {
            // Never started; the record stays not-started
            warn!(step = runner.name(), error = %e, "Step did not start");
            return if e.is_cancelled() {
                BuildResult::Cancelled
            } else {
                BuildResult::Failed
            };
        }

        if !runner.check_guards() {
            runner.skip().await;
            return runner.record().result;
        }

        let outcome = match runner.setup().await {
            Ok(()) => runner.process().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => runner.succeed().await,
            Err(_) if cancel.is_cancelled() => runner.cancel().await,
            Err(e) => runner.fail(e).await,
        }

        runner.record().result
    }

    async fn push_build(&self, build: &mut Build, update: BuildUpdate) {
        build.apply(&update);
        if let Err(e) = self.sink.apply_build_update(build.id, &update).await {
            warn!(build_id = %build.id, error = %format!("{:#}", e), "Failed to push build update");
        }
    }
}
