//! `backup` step: copy files matching a glob into a directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::core::{Step, StepContext, StepDefinition};

use super::files::{FileBatch, FileStep, FileTask};

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupOptions {
    /// Directory the pattern is matched in
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// Glob relative to `source`, e.g. `config/**/*.toml`
    pub pattern: String,

    pub destination: PathBuf,

    /// Empty the destination first
    #[serde(default)]
    pub clean: bool,
}

pub struct Backup {
    options: BackupOptions,
}

pub fn from_definition(definition: &StepDefinition) -> Result<Box<dyn Step>> {
    let options: BackupOptions = definition.options()?;
    glob::Pattern::new(&options.pattern)
        .with_context(|| format!("Invalid pattern '{}'", options.pattern))?;

    Ok(Box::new(FileStep::new(Backup { options })))
}

#[async_trait]
impl FileTask for Backup {
    async fn plan(&mut self, batch: &mut FileBatch, ctx: &StepContext) -> Result<()> {
        let opts = &self.options;
        let source = batch.resolve(&opts.source);
        let destination = batch.resolve(&opts.destination);

        if opts.clean {
            batch.remove(&destination);
        }
        batch.create_dir(&destination);

        let pattern = source.join(&opts.pattern);
        let pattern = pattern.to_string_lossy();
        let mut matched = 0usize;

        for entry in glob::glob(&pattern).with_context(|| format!("Invalid pattern '{}'", pattern))? {
            let path = entry.context("Failed to read a matched path")?;
            if !path.is_file() || path.starts_with(&destination) {
                continue;
            }
            let relative = path
                .strip_prefix(&source)
                .with_context(|| format!("{} is outside {}", path.display(), source.display()))?;

            batch.copy(&path, destination.join(relative));
            matched += 1;
        }

        if matched == 0 {
            ctx.warning(format!("No files matched {}", pattern));
        } else {
            ctx.info(format!("Backing up {} file(s) to {}", matched, destination.display()));
        }
        Ok(())
    }
}
