//! `git-checkout` step: move a repository to a reference.
//!
//! Records whether HEAD moved so later steps can skip work when nothing
//! changed (see the `only_if` option of `command`).

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::core::{Step, StepContext, StepDefinition};

use super::git::{GitClient, GitStep, GitTask};

fn default_changed_variable() -> String {
    "git.head_changed".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckoutOptions {
    /// Branch, tag or commit
    pub reference: String,

    /// Relative to the build's working directory
    pub repository: Option<PathBuf>,

    #[serde(default)]
    pub fetch: bool,

    #[serde(default = "default_remote")]
    pub remote: String,

    /// Variable receiving "true" or "false"
    #[serde(default = "default_changed_variable")]
    pub changed_variable: String,

    pub git: Option<PathBuf>,
}

pub struct Checkout {
    options: CheckoutOptions,
}

pub fn from_definition(definition: &StepDefinition) -> Result<Box<dyn Step>> {
    let options: CheckoutOptions = definition.options()?;
    let git = options.git.clone();
    let step = GitStep::new(Checkout { options });

    Ok(match git {
        Some(executable) => Box::new(step.with_executable(executable)),
        None => Box::new(step),
    })
}

#[async_trait]
impl GitTask for Checkout {
    fn repository(&self, ctx: &StepContext) -> PathBuf {
        match &self.options.repository {
            Some(path) => ctx.working_dir().join(path),
            None => ctx.working_dir().to_path_buf(),
        }
    }

    async fn run(&mut self, git: &GitClient, ctx: &StepContext) -> Result<()> {
        let opts = &self.options;
        let before = git.head(ctx).await?;

        if opts.fetch {
            git.fetch(ctx, &opts.remote).await?;
        }
        git.checkout(ctx, &opts.reference).await?;

        let after = git.head(ctx).await?;
        let changed = before != after;
        if changed {
            ctx.info(format!("HEAD moved {} -> {}", short(&before), short(&after)));
        } else {
            ctx.info(format!("HEAD unchanged at {}", short(&after)));
        }

        ctx.set_variable(opts.changed_variable.clone(), changed.to_string())
            .await;
        ctx.set_variable("git.head", after).await;
        Ok(())
    }
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_defaults() {
        let def = StepDefinition::new("checkout", "git-checkout", json!({ "reference": "main" }));
        let opts: CheckoutOptions = def.options().unwrap();

        assert_eq!(opts.reference, "main");
        assert_eq!(opts.remote, "origin");
        assert_eq!(opts.changed_variable, "git.head_changed");
        assert!(!opts.fetch);
    }

    #[test]
    fn test_reference_is_required() {
        let def = StepDefinition::new("checkout", "git-checkout", serde_json::Value::Null);
        assert!(from_definition(&def).is_err());
    }

    #[test]
    fn test_short_commit() {
        assert_eq!(short("0123456789abcdef"), "0123456789");
        assert_eq!(short("abc"), "abc");
    }
}
