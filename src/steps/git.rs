//! Git Step: steps that drive a repository through a [`GitClient`].
//!
//! The client is resolved during setup, once the repository directory is
//! known to exist. Every git invocation goes through the step's process
//! runner, so output lands in the step log and the build's abort signal
//! applies.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::{ProcessSummary, Step, StepContext};

/// Thin wrapper over the `git` command line for one repository
#[derive(Debug, Clone)]
pub struct GitClient {
    executable: PathBuf,
    repository: PathBuf,
}

impl GitClient {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            executable: PathBuf::from("git"),
            repository: repository.into(),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    /// Run git with raw arguments in the repository
    pub async fn run(&self, ctx: &StepContext, arguments: &str) -> ProcessSummary {
        let mut request = ctx.process_request(&self.executable, arguments);
        request.working_dir = self.repository.clone();
        ctx.run_process(request).await
    }

    /// Run git and require a zero exit code
    pub async fn run_checked(&self, ctx: &StepContext, arguments: &str) -> Result<ProcessSummary> {
        let summary = self.run(ctx, arguments).await;
        summary.ensure_success()?;
        Ok(summary)
    }

    /// Commit id of HEAD
    pub async fn head(&self, ctx: &StepContext) -> Result<String> {
        let summary = self.run_checked(ctx, "rev-parse HEAD").await?;
        summary
            .stdout
            .first()
            .cloned()
            .context("git rev-parse printed nothing")
    }

    pub async fn fetch(&self, ctx: &StepContext, remote: &str) -> Result<()> {
        self.run_checked(ctx, &format!("fetch --quiet {}", quote(remote)))
            .await
            .map(|_| ())
    }

    pub async fn checkout(&self, ctx: &StepContext, reference: &str) -> Result<()> {
        self.run_checked(ctx, &format!("checkout --quiet {}", quote(reference)))
            .await
            .map(|_| ())
    }
}

/// Quote a value for the executor's argument splitter
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// The work of a git step
#[async_trait]
pub trait GitTask: Send + Sync {
    fn check_guards(&self, ctx: &StepContext) -> bool {
        let _ = ctx;
        true
    }

    /// Repository directory; defaults to the build's working directory
    fn repository(&self, ctx: &StepContext) -> PathBuf {
        ctx.working_dir().to_path_buf()
    }

    async fn run(&mut self, git: &GitClient, ctx: &StepContext) -> Result<()>;
}

/// Adapts a [`GitTask`] into a [`Step`]
pub struct GitStep<T> {
    task: T,
    executable: PathBuf,
    client: Option<GitClient>,
}

impl<T: GitTask> GitStep<T> {
    pub fn new(task: T) -> Self {
        Self {
            task,
            executable: PathBuf::from("git"),
            client: None,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }
}

#[async_trait]
impl<T: GitTask> Step for GitStep<T> {
    fn check_guards(&self, ctx: &StepContext) -> bool {
        self.task.check_guards(ctx)
    }

    async fn setup(&mut self, ctx: &StepContext) -> Result<()> {
        let repository = self.task.repository(ctx);
        if !repository.is_dir() {
            anyhow::bail!("Repository directory not found: {}", repository.display());
        }

        ctx.debug(format!("Using repository {}", repository.display()));
        self.client = Some(GitClient::new(repository).with_executable(&self.executable));
        Ok(())
    }

    async fn process(&mut self, ctx: &StepContext) -> Result<()> {
        let client = self.client.as_ref().context("git client was not set up")?;
        self.task.run(client, ctx).await
    }
}
