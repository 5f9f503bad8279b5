//! Step kinds available to pipelines.
//!
//! A pipeline names each step's `kind`; the registry maps that name to a
//! factory building the concrete [`Step`] from the step's options.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::step::Step;

/// One step as written in a pipeline file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name (unique within pipeline)
    pub name: String,

    /// Registered step kind (e.g. "command")
    pub kind: String,

    /// Kind-specific options
    #[serde(default)]
    pub options: serde_json::Value,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            options,
        }
    }

    /// Decode the options into a kind's typed form
    ///
    /// Missing options decode like an empty mapping.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.options {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value)
            .with_context(|| format!("Invalid options for {} step '{}'", self.kind, self.name))
    }
}

/// Builds a step from its definition
pub type StepFactory = fn(&StepDefinition) -> Result<Box<dyn Step>>;

#[derive(Clone)]
struct Registration {
    summary: &'static str,
    factory: StepFactory,
}

/// Known step kinds
#[derive(Clone, Default)]
pub struct StepRegistry {
    kinds: BTreeMap<String, Registration>,
}

impl StepRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind, replacing any earlier registration of the same name
    pub fn register(&mut self, kind: impl Into<String>, summary: &'static str, factory: StepFactory) {
        self.kinds.insert(kind.into(), Registration { summary, factory });
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kinds with their one-line summaries, sorted by name
    pub fn kinds(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.kinds.iter().map(|(k, r)| (k.as_str(), r.summary))
    }

    /// Build the step a definition describes
    pub fn create(&self, definition: &StepDefinition) -> Result<Box<dyn Step>> {
        let registration = self.kinds.get(&definition.kind).with_context(|| {
            format!(
                "Step '{}' has unknown kind '{}'",
                definition.name, definition.kind
            )
        })?;
        (registration.factory)(definition)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds.keys()).finish()
    }
}
