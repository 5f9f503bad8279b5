//! File Step: steps that work on the filesystem through a [`FileBatch`].
//!
//! The batch is resolved during setup. A [`FileTask`] queues operations
//! while processing and the step commits them in order afterwards, so a task
//! that bails while planning leaves the filesystem untouched.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::core::{Step, StepContext};

/// One queued filesystem operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Copy { from: PathBuf, to: PathBuf },
    CreateDir(PathBuf),
    /// File or directory; a missing target is fine
    Remove(PathBuf),
    Write { path: PathBuf, contents: Vec<u8> },
}

impl FileOp {
    fn describe(&self) -> String {
        match self {
            Self::Copy { from, to } => format!("copy {} -> {}", from.display(), to.display()),
            Self::CreateDir(path) => format!("create {}", path.display()),
            Self::Remove(path) => format!("remove {}", path.display()),
            Self::Write { path, contents } => {
                format!("write {} ({} bytes)", path.display(), contents.len())
            }
        }
    }
}

/// Ordered filesystem operations relative to a root directory
#[derive(Debug, Clone)]
pub struct FileBatch {
    root: PathBuf,
    ops: Vec<FileOp>,
}

impl FileBatch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ops: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute paths are kept; relative ones are joined onto the root
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn copy(&mut self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> &mut Self {
        let op = FileOp::Copy {
            from: self.resolve(from),
            to: self.resolve(to),
        };
        self.ops.push(op);
        self
    }

    pub fn create_dir(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let op = FileOp::CreateDir(self.resolve(path));
        self.ops.push(op);
        self
    }

    pub fn remove(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let op = FileOp::Remove(self.resolve(path));
        self.ops.push(op);
        self
    }

    pub fn write(&mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> &mut Self {
        let op = FileOp::Write {
            path: self.resolve(path),
            contents: contents.into(),
        };
        self.ops.push(op);
        self
    }

    pub fn pending(&self) -> &[FileOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every queued operation in order and clear the queue
    ///
    /// Stops at the first failing operation; the ones before it stay applied.
    pub async fn commit(&mut self) -> Result<usize> {
        let ops = std::mem::take(&mut self.ops);
        let count = ops.len();

        for op in ops {
            debug!(op = %op.describe(), "applying file operation");
            apply(&op)
                .await
                .with_context(|| format!("Failed to {}", op.describe()))?;
        }

        Ok(count)
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn apply(op: &FileOp) -> Result<()> {
    match op {
        FileOp::Copy { from, to } => {
            ensure_parent(to).await?;
            fs::copy(from, to).await?;
        }
        FileOp::CreateDir(path) => fs::create_dir_all(path).await?,
        FileOp::Remove(path) => match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await?,
            Ok(_) => fs::remove_file(path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
        FileOp::Write { path, contents } => {
            ensure_parent(path).await?;
            fs::write(path, contents).await?;
        }
    }
    Ok(())
}

/// The work of a file step
#[async_trait]
pub trait FileTask: Send + Sync {
    fn check_guards(&self, ctx: &StepContext) -> bool {
        let _ = ctx;
        true
    }

    /// Directory the batch resolves relative paths against
    fn root(&self, ctx: &StepContext) -> PathBuf {
        ctx.working_dir().to_path_buf()
    }

    /// Queue the operations to perform
    async fn plan(&mut self, batch: &mut FileBatch, ctx: &StepContext) -> Result<()>;
}

/// Adapts a [`FileTask`] into a [`Step`]
pub struct FileStep<T> {
    task: T,
    batch: Option<FileBatch>,
}

impl<T: FileTask> FileStep<T> {
    pub fn new(task: T) -> Self {
        Self { task, batch: None }
    }
}

#[async_trait]
impl<T: FileTask> Step for FileStep<T> {
    fn check_guards(&self, ctx: &StepContext) -> bool {
        self.task.check_guards(ctx)
    }

    async fn setup(&mut self, ctx: &StepContext) -> Result<()> {
        let root = self.task.root(ctx);
        ctx.debug(format!("File operations relative to {}", root.display()));
        self.batch = Some(FileBatch::new(root));
        Ok(())
    }

    async fn process(&mut self, ctx: &StepContext) -> Result<()> {
        let batch = self.batch.as_mut().context("file batch was not set up")?;
        self.task.plan(batch, ctx).await?;

        for op in batch.pending() {
            ctx.debug(op.describe());
        }
        let applied = batch.commit().await?;
        ctx.info(format!("Applied {} file operation(s)", applied));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let temp = TempDir::new().unwrap();
        let mut batch = FileBatch::new(temp.path());

        batch
            .write("src/a.txt", "alpha")
            .create_dir("out")
            .copy("src/a.txt", "out/nested/a.txt")
            .remove("src");
        assert_eq!(batch.len(), 4);

        assert_eq!(batch.commit().await.unwrap(), 4);
        assert!(batch.is_empty());

        let copied = std::fs::read_to_string(temp.path().join("out/nested/a.txt")).unwrap();
        assert_eq!(copied, "alpha");
        assert!(!temp.path().join("src").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let mut batch = FileBatch::new(temp.path());
        batch.remove("never-existed");

        assert!(batch.commit().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_copy_names_operation() {
        let temp = TempDir::new().unwrap();
        let mut batch = FileBatch::new(temp.path());
        batch.copy("missing.txt", "out.txt");

        let err = batch.commit().await.unwrap_err();
        assert!(err.to_string().contains("copy"));
        assert!(err.to_string().contains("missing.txt"));
    }

    #[test]
    fn test_resolve_keeps_absolute_paths() {
        let batch = FileBatch::new("/work");
        assert_eq!(batch.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(batch.resolve("dist"), PathBuf::from("/work/dist"));
    }
}
