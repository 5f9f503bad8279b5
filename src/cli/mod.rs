//! Command-line interface for buildkeeper.
//!
//! Provides commands for running pipelines, inspecting recorded builds,
//! validating pipeline files and showing the resolved configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::JsonlBuildStore;
use crate::config;
use crate::core::step::{
    FORCE_LOGGING_KEY, HEARTBEAT_INTERVAL_KEY, LOG_SETTLE_KEY, PROCESS_TIMEOUT_KEY,
};
use crate::core::{Orchestrator, Pipeline, StepSettings};
use crate::domain::{Build, BuildResult, LogLevel, StepState};
use crate::steps::builtin_registry;

/// buildkeeper - build and release pipeline runner
#[derive(Parser, Debug)]
#[command(name = "buildkeeper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline name (looks for <pipelines>/<name>.yaml) or path
        pipeline: String,

        /// Build variable, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Working directory for step processes
        #[arg(short = 'C', long, env = "BUILDKEEPER_WORKDIR")]
        working_dir: Option<PathBuf>,
    },

    /// Show a recorded build
    Status {
        /// Build ID (UUID)
        build_id: String,

        /// Include step logs
        #[arg(short, long)]
        logs: bool,
    },

    /// List recorded builds
    Builds {
        /// Maximum number of builds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Check a pipeline file without running it
    Validate {
        /// Pipeline name or path
        pipeline: String,
    },

    /// List available step kinds
    Steps,

    /// Show resolved configuration (debug)
    Config,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline,
                vars,
                working_dir,
            } => run_pipeline(&pipeline, vars, working_dir).await,
            Commands::Status { build_id, logs } => show_status(&build_id, logs).await,
            Commands::Builds { limit } => list_builds(limit).await,
            Commands::Validate { pipeline } => validate_pipeline(&pipeline),
            Commands::Steps => {
                list_steps();
                Ok(())
            }
            Commands::Config => show_config(),
        }
    }
}

fn load_pipeline(name: &str) -> Result<Pipeline> {
    let path = config::config()?.pipeline_path(name);
    if !path.exists() {
        anyhow::bail!("Pipeline not found: {}", path.display());
    }
    Pipeline::from_file(&path)
}

async fn run_pipeline(
    pipeline_name: &str,
    vars: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
) -> Result<()> {
    let pipeline = load_pipeline(pipeline_name)?;
    let cfg = config::config()?;

    let mut variables: BTreeMap<String, String> = cfg.variables.clone();
    variables.extend(vars);

    let working_dir = match working_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };

    let store = Arc::new(JsonlBuildStore::open_default()?);
    let orchestrator = Orchestrator::new(builtin_registry(), store).with_working_dir(working_dir);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting build");
            on_signal.cancel();
        }
    });

    let build = orchestrator
        .run_pipeline(&pipeline, variables, cancel)
        .await;
    signal_task.abort();
    let build = build?;

    print_steps(&build, false);
    eprintln!("\n[Build {} finished: {}]", build.id, build.result);

    match build.result {
        BuildResult::Success | BuildResult::Warning | BuildResult::Skipped => Ok(()),
        _ => std::process::exit(1),
    }
}

fn parse_build_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid build ID: {}", raw))
}

async fn show_status(build_id: &str, logs: bool) -> Result<()> {
    let build_id = parse_build_id(build_id)?;
    let store = JsonlBuildStore::open_default()?;
    let build = store
        .load_build(build_id)
        .await?
        .with_context(|| format!("Build {} not found", build_id))?;

    println!("Build ID: {}", build.id);
    println!("Pipeline: {}", build.pipeline);
    println!("Result: {}", build.result);
    println!("Created: {}", build.created_at);
    if let Some(started) = build.started_at {
        println!("Started: {}", started);
    }
    if let Some(finished) = build.finished_at {
        println!("Finished: {}", finished);
    }
    if !build.variables.is_empty() {
        println!("\nVariables:");
        for (k, v) in &build.variables {
            println!("  {} = {}", k, v);
        }
    }
    println!("\nSteps:");
    print_steps(&build, logs);

    Ok(())
}

fn print_steps(build: &Build, logs: bool) {
    for step in &build.steps {
        let state = match step.state() {
            StepState::NotStarted => "not started".to_string(),
            StepState::Running => "running".to_string(),
            StepState::Finished(result) => result.to_string(),
        };
        let warnings = step.count_level(LogLevel::Warning);
        if warnings > 0 {
            println!("  {:>2}. {:<24} {} ({} warning(s))", step.index + 1, step.name, state, warnings);
        } else {
            println!("  {:>2}. {:<24} {}", step.index + 1, step.name, state);
        }

        if logs {
            for entry in &step.log {
                println!(
                    "        {} [{:?}] {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.level,
                    entry.message
                );
            }
        }
    }
}

async fn list_builds(limit: usize) -> Result<()> {
    let store = JsonlBuildStore::open_default()?;
    let mut builds = Vec::new();

    for build_id in store.list_builds().await? {
        match store.load_build(build_id).await {
            Ok(Some(build)) => builds.push(build),
            Ok(None) => {}
            Err(e) => warn!(%build_id, error = %e, "Skipping unreadable build"),
        }
    }

    if builds.is_empty() {
        println!("No builds found");
        return Ok(());
    }

    // Most recent first
    builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!("{:<38} {:<20} {:<10} {}", "BUILD ID", "PIPELINE", "RESULT", "CREATED");
    println!("{}", "-".repeat(90));

    for build in builds.into_iter().take(limit) {
        let result = if build.running {
            "running".to_string()
        } else {
            build.result.to_string()
        };
        println!(
            "{:<38} {:<20} {:<10} {}",
            build.id,
            build.pipeline,
            result,
            build.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn validate_pipeline(name: &str) -> Result<()> {
    let pipeline = load_pipeline(name)?;
    let registry = builtin_registry();
    pipeline.validate(&registry)?;

    // Options are checked by building each step
    for definition in &pipeline.steps {
        registry.create(definition)?;
    }

    println!(
        "Pipeline '{}' is valid ({} steps)",
        pipeline.name,
        pipeline.steps.len()
    );
    Ok(())
}

fn list_steps() {
    for (kind, summary) in builtin_registry().kinds() {
        println!("  {:<14} {}", kind, summary);
    }
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let settings = StepSettings::from_variables(cfg);

    println!("buildkeeper configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Builds:              {}", cfg.builds_dir().display());
    println!("  Pipelines:           {}", cfg.pipelines_dir.display());
    println!();
    println!("Step engine:");
    println!("  {:<32} {}ms", HEARTBEAT_INTERVAL_KEY, settings.heartbeat_interval.as_millis());
    println!("  {:<32} {}ms", LOG_SETTLE_KEY, settings.log_settle_delay.as_millis());
    println!("  {:<32} {}", FORCE_LOGGING_KEY, settings.force_logging);
    println!("  {:<32} {}s", PROCESS_TIMEOUT_KEY, settings.process_timeout.as_secs());
    println!();
    println!("Variables:");
    if cfg.variables.is_empty() {
        println!("  (none)");
    } else {
        for (k, v) in &cfg.variables {
            println!("  {} = {}", k, v);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("channel=nightly").unwrap(),
            ("channel".to_string(), "nightly".to_string())
        );
        assert_eq!(
            parse_var("flags=a=b").unwrap(),
            ("flags".to_string(), "a=b".to_string())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from([
            "buildkeeper",
            "run",
            "release",
            "--var",
            "channel=beta",
            "--var",
            "step.force_logging=on",
        ]);
        match cli.command {
            Commands::Run { pipeline, vars, .. } => {
                assert_eq!(pipeline, "release");
                assert_eq!(vars.len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
