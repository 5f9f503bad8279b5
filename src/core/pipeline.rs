//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML and consist of ordered steps, each naming
//! a registered step kind and the options for it.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::registry::{StepDefinition, StepRegistry};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered list of steps to execute
    pub steps: Vec<StepDefinition>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition against the known step kinds
    pub fn validate(&self, registry: &StepRegistry) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }
            if !seen.insert(step.name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", step.name);
            }
            if !registry.contains(&step.kind) {
                anyhow::bail!("Step '{}' has unknown kind '{}'", step.name, step.kind);
            }
        }

        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::Step;

    const TEST_PIPELINE_YAML: &str = r#"
name: release
description: Nightly release

steps:
  - name: checkout
    kind: marker
    options:
      reference: main

  - name: package
    kind: marker
"#;

    struct Marker;
    impl Step for Marker {}

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register("marker", "test step", |_| Ok(Box::new(Marker)));
        registry
    }

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();

        assert_eq!(pipeline.name, "release");
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.steps[0].options["reference"], "main");
        assert!(pipeline.steps[1].options.is_null());
        assert_eq!(pipeline.step_names(), vec!["checkout", "package"]);
    }

    #[test]
    fn test_pipeline_validation() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        assert!(pipeline.validate(&registry()).is_ok());
    }

    #[test]
    fn test_duplicate_step_names() {
        let yaml = r#"
name: dup
steps:
  - name: build
    kind: marker
  - name: build
    kind: marker
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        let err = pipeline.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name 'build'"));
    }

    #[test]
    fn test_unknown_kind() {
        let yaml = r#"
name: odd
steps:
  - name: upload
    kind: ftp
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        assert!(pipeline.validate(&registry()).is_err());
    }

    #[test]
    fn test_empty_pipeline() {
        let pipeline = Pipeline::from_yaml("name: empty\nsteps: []\n").unwrap();
        assert!(pipeline.validate(&registry()).is_err());
    }
}
