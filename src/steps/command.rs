//! `command` step: run one external tool.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::core::step::parse_flag;
use crate::core::{ProcessOutcome, Step, StepContext, StepDefinition};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandOptions {
    pub executable: PathBuf,

    /// Raw argument string
    #[serde(default)]
    pub arguments: String,

    /// Relative to the build's working directory
    pub working_dir: Option<PathBuf>,

    /// Overrides `process.default_timeout_seconds`
    pub timeout_seconds: Option<u64>,

    /// Downgrade a non-zero exit, timeout or spawn failure to a warning
    #[serde(default)]
    pub allow_failure: bool,

    /// Only run when this build variable is set to a true value
    pub only_if: Option<String>,
}

pub struct CommandStep {
    options: CommandOptions,
}

impl CommandStep {
    pub fn new(options: CommandOptions) -> Self {
        Self { options }
    }

    pub fn from_definition(definition: &StepDefinition) -> Result<Box<dyn Step>> {
        Ok(Box::new(Self::new(definition.options()?)))
    }
}

#[async_trait]
impl Step for CommandStep {
    fn check_guards(&self, ctx: &StepContext) -> bool {
        match &self.options.only_if {
            None => true,
            Some(key) => ctx
                .variable(key)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(false),
        }
    }

    async fn process(&mut self, ctx: &StepContext) -> Result<()> {
        let opts = &self.options;
        let mut request = ctx.process_request(&opts.executable, opts.arguments.as_str());
        if let Some(dir) = &opts.working_dir {
            request.working_dir = ctx.working_dir().join(dir);
        }
        if let Some(secs) = opts.timeout_seconds {
            request.timeout = Duration::from_secs(secs);
        }

        let summary = ctx.run_process(request).await;
        match (&summary.outcome, opts.allow_failure) {
            (ProcessOutcome::Exited(0), _) | (ProcessOutcome::Cancelled, _) => {
                summary.ensure_success()
            }
            (_, true) => {
                if let Err(e) = summary.ensure_success() {
                    ctx.warning(format!("{:#}", e));
                }
                Ok(())
            }
            (_, false) => summary.ensure_success(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_defaults() {
        let def = StepDefinition::new("build", "command", json!({ "executable": "cargo" }));
        let opts: CommandOptions = def.options().unwrap();

        assert_eq!(opts.executable, PathBuf::from("cargo"));
        assert!(opts.arguments.is_empty());
        assert!(!opts.allow_failure);
        assert!(opts.only_if.is_none());
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let def = StepDefinition::new(
            "build",
            "command",
            json!({ "executable": "cargo", "args": "build" }),
        );
        assert!(CommandStep::from_definition(&def).is_err());
    }
}
