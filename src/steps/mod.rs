//! Concrete step kinds.
//!
//! - `git` / `files`: the Git Step and File Step building blocks
//! - `command`, `checkout`, `backup`: the built-in kinds pipelines can name

pub mod backup;
pub mod checkout;
pub mod command;
pub mod files;
pub mod git;

pub use files::{FileBatch, FileOp, FileStep, FileTask};
pub use git::{GitClient, GitStep, GitTask};

use crate::core::StepRegistry;

/// Add the built-in step kinds to a registry
pub fn register_builtin(registry: &mut StepRegistry) {
    registry.register(
        "command",
        "Run an external tool",
        command::CommandStep::from_definition,
    );
    registry.register(
        "git-checkout",
        "Check out a git reference and record whether HEAD moved",
        checkout::from_definition,
    );
    registry.register(
        "backup",
        "Copy files matching a glob into a directory",
        backup::from_definition,
    );
}

/// A registry holding only the built-in kinds
pub fn builtin_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_builtin(&mut registry);
    registry
}
