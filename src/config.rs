//! Configuration for buildkeeper.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (BUILDKEEPER_HOME, BUILDKEEPER_PIPELINES)
//! 2. Config file (.buildkeeper/config.yaml)
//! 3. Defaults (~/.buildkeeper, ./pipelines)
//!
//! Config file discovery:
//! - Searches current directory and parents for .buildkeeper/config.yaml
//! - `home` is relative to the .buildkeeper/ directory, `pipelines` to the
//!   project root
//!
//! The `variables` map seeds every build. Engine settings such as
//! `step.heartbeat_interval_ms` live there too.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::VariableStore;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".buildkeeper";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Scalars only; numbers and booleans are stringified
    #[serde(default)]
    pub variables: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .buildkeeper/)
    pub home: Option<String>,
    /// Pipeline definitions (relative to the project root)
    pub pipelines: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state (build logs)
    pub home: PathBuf,
    pub pipelines_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default build variables
    pub variables: BTreeMap<String, String>,
}

impl ResolvedConfig {
    pub fn builds_dir(&self) -> PathBuf {
        self.home.join("builds")
    }

    /// Resolve a pipeline argument to a file
    ///
    /// Anything that looks like a path is used as is; a bare name maps to
    /// `<pipelines>/<name>.yaml`.
    pub fn pipeline_path(&self, name: &str) -> PathBuf {
        let candidate = PathBuf::from(name);
        if candidate.extension().is_some() || candidate.components().count() > 1 {
            return candidate;
        }
        self.pipelines_dir.join(format!("{}.yaml", name))
    }
}

impl VariableStore for ResolvedConfig {
    fn get_variable(&self, key: &str) -> Option<String> {
        self.variables.get(key).cloned()
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn scalar_to_string(key: &str, value: serde_yaml::Value) -> Result<String> {
    use serde_yaml::Value;

    match value {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        _ => anyhow::bail!("variable '{}' must be a scalar", key),
    }
}

/// Environment overrides, read once per load
struct EnvOverrides {
    home: Option<PathBuf>,
    pipelines: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("BUILDKEEPER_HOME").ok().map(PathBuf::from),
            pipelines: std::env::var("BUILDKEEPER_PIPELINES").ok().map(PathBuf::from),
        }
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    load_config_from(&cwd, &default_home, EnvOverrides::from_env())
}

fn load_config_from(
    cwd: &Path,
    default_home: &Path,
    env: EnvOverrides,
) -> Result<ResolvedConfig> {
    let config_file = find_config_file(cwd);

    let (home, pipelines_dir, variables) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        // Project root is the parent of .buildkeeper/
        let base_dir = config_dir.parent().unwrap_or(Path::new("."));

        let home = match (env.home, config.paths.home.as_deref()) {
            (Some(home), _) => home,
            (None, Some(home)) => resolve_path(config_dir, home),
            (None, None) => default_home.to_path_buf(),
        };

        let pipelines_dir = match (env.pipelines, config.paths.pipelines.as_deref()) {
            (Some(dir), _) => dir,
            (None, Some(dir)) => resolve_path(base_dir, dir),
            (None, None) => base_dir.join("pipelines"),
        };

        let variables = config
            .variables
            .into_iter()
            .map(|(k, v)| {
                let value = scalar_to_string(&k, v)?;
                Ok((k, value))
            })
            .collect::<Result<BTreeMap<_, _>>>()
            .with_context(|| format!("Invalid variables in {}", config_path.display()))?;

        (home, pipelines_dir, variables)
    } else {
        let home = env.home.unwrap_or_else(|| default_home.to_path_buf());
        let pipelines_dir = env.pipelines.unwrap_or_else(|| cwd.join("pipelines"));
        (home, pipelines_dir, BTreeMap::new())
    };

    Ok(ResolvedConfig {
        home,
        pipelines_dir,
        config_file,
        variables,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the buildkeeper home directory (engine state)
pub fn buildkeeper_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the builds directory ($BUILDKEEPER_HOME/builds)
pub fn builds_dir() -> Result<PathBuf> {
    Ok(config()?.builds_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env() -> EnvOverrides {
        EnvOverrides {
            home: None,
            pipelines: None,
        }
    }

    fn write_config(root: &Path, body: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", body).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");

        let config = load_config_from(temp.path(), &home, no_env()).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.pipelines_dir, temp.path().join("pipelines"));
        assert!(config.config_file.is_none());
        assert!(config.variables.is_empty());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: ./state
  pipelines: ci
variables:
  step.heartbeat_interval_ms: 250
  step.force_logging: true
  channel: nightly
"#,
        );

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home.as_deref(), Some("./state"));
        assert_eq!(config.paths.pipelines.as_deref(), Some("ci"));
        assert_eq!(config.variables.len(), 3);
    }

    #[test]
    fn test_config_found_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  pipelines: ci
variables:
  step.heartbeat_interval_ms: 250
  step.force_logging: true
"#,
        );
        let nested = temp.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let config = load_config_from(&nested, Path::new("/unused"), no_env()).unwrap();

        assert!(config.config_file.is_some());
        assert!(config.pipelines_dir.ends_with("ci"));
        assert_eq!(
            config.get_variable("step.heartbeat_interval_ms").as_deref(),
            Some("250")
        );
        assert_eq!(config.get_variable("step.force_logging").as_deref(), Some("true"));
    }

    #[test]
    fn test_env_overrides_config_file() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "version: \"1.0\"\npaths:\n  home: ./state\n");

        let env = EnvOverrides {
            home: Some(PathBuf::from("/srv/buildkeeper")),
            pipelines: Some(PathBuf::from("/srv/pipelines")),
        };
        let config = load_config_from(temp.path(), Path::new("/unused"), env).unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/buildkeeper"));
        assert_eq!(config.pipelines_dir, PathBuf::from("/srv/pipelines"));
    }

    #[test]
    fn test_nested_variable_is_rejected() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            "version: \"1.0\"\nvariables:\n  matrix:\n    - a\n    - b\n",
        );

        let err = load_config_from(temp.path(), Path::new("/unused"), no_env()).unwrap_err();
        assert!(format!("{:#}", err).contains("must be a scalar"));
    }

    #[test]
    fn test_pipeline_path() {
        let config = ResolvedConfig {
            home: PathBuf::from("/test/.buildkeeper"),
            pipelines_dir: PathBuf::from("/test/pipelines"),
            config_file: None,
            variables: BTreeMap::new(),
        };

        assert_eq!(
            config.pipeline_path("release"),
            PathBuf::from("/test/pipelines/release.yaml")
        );
        assert_eq!(
            config.pipeline_path("ci/release.yaml"),
            PathBuf::from("ci/release.yaml")
        );
        assert_eq!(config.builds_dir(), PathBuf::from("/test/.buildkeeper/builds"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
