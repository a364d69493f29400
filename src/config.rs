//! Configuration for sagaflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SAGAFLOW_HOME)
//! 2. Config file (.sagaflow/config.yaml)
//! 3. Defaults (~/.sagaflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sagaflow/config.yaml
//! - Input paths in the config file (`paths.home`, `history.path`,
//!   `etl.csv_source`) are relative to the .sagaflow/ directory
//! - `etl.output_dir` is state, so it is relative to the sagaflow home
//!
//! Library types never read this module; the CLI resolves it once and
//! passes explicit settings into constructors.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::order::OrderSettings;
use crate::core::{
    HistoryStore, InMemoryHistoryStore, JsonlHistoryStore, RetryPolicy, RuntimeSettings,
    SafetyLimits, SqliteHistoryStore,
};
use crate::etl::EtlSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub safety: Option<SafetyLimits>,
    #[serde(default)]
    pub etl: Option<EtlSettings>,
    #[serde(default)]
    pub order: Option<OrderSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .sagaflow/)
    pub home: Option<String>,
}

/// Where instance histories are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    /// One JSONL file per instance
    #[default]
    Jsonl,
    /// A single SQLite database
    Sqlite,
    /// Process memory only
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub backend: HistoryBackend,
    /// Directory (jsonl) or database file (sqlite)
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    pub max_concurrent_activities: Option<usize>,
    pub activity_timeout_seconds: Option<u64>,
    pub instance_timeout_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to sagaflow home (engine state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub history_backend: HistoryBackend,
    /// History directory or database file
    pub history_path: PathBuf,
    pub runtime: RuntimeSettings,
    pub etl: EtlSettings,
    pub order: OrderSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: PathBuf) -> Self {
        let etl = EtlSettings {
            output_dir: home.join("etl-output"),
            ..EtlSettings::default()
        };

        Self {
            history_path: default_history_path(&home, HistoryBackend::Jsonl),
            home,
            config_file: None,
            history_backend: HistoryBackend::Jsonl,
            runtime: RuntimeSettings::default(),
            etl,
            order: OrderSettings::default(),
        }
    }

    /// Open the configured history backend
    pub fn open_history_store(&self) -> Result<Arc<dyn HistoryStore>> {
        let store: Arc<dyn HistoryStore> = match self.history_backend {
            HistoryBackend::Jsonl => Arc::new(JsonlHistoryStore::open(&self.history_path)?),
            HistoryBackend::Sqlite => Arc::new(SqliteHistoryStore::open(&self.history_path)?),
            HistoryBackend::Memory => Arc::new(InMemoryHistoryStore::new()),
        };
        Ok(store)
    }
}

fn default_history_path(home: &Path, backend: HistoryBackend) -> PathBuf {
    match backend {
        HistoryBackend::Sqlite => home.join("history.db"),
        HistoryBackend::Jsonl | HistoryBackend::Memory => home.join("instances"),
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".sagaflow").join("config.yaml");
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

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<ConfigFile> {
    // An empty file is a valid, all-defaults config
    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

/// Resolve a path that may be relative to the config directory
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

/// Combine a parsed config file with the environment override
fn resolve(
    config: ConfigFile,
    config_file: Option<PathBuf>,
    env_home: Option<PathBuf>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = match (env_home, &config.paths.home) {
        (Some(env_home), _) => env_home,
        (None, Some(home_path)) => resolve_path(&config_dir, home_path),
        (None, None) => default_home,
    };

    let mut resolved = ResolvedConfig::with_home(home);
    resolved.config_file = config_file;

    resolved.history_backend = config.history.backend;
    resolved.history_path = match config.history.path {
        Some(ref path) => resolve_path(&config_dir, path),
        None => default_history_path(&resolved.home, config.history.backend),
    };

    let runtime = &mut resolved.runtime;
    if let Some(n) = config.runtime.max_concurrent_activities {
        runtime.max_concurrent_activities = n;
    }
    if let Some(secs) = config.runtime.activity_timeout_seconds {
        runtime.activity_timeout_seconds = secs;
    }
    if let Some(secs) = config.runtime.instance_timeout_seconds {
        runtime.instance_timeout_seconds = secs;
    }
    if let Some(retry) = config.retry {
        runtime.retry = retry;
    }
    if let Some(safety) = config.safety {
        runtime.safety = safety;
    }

    if let Some(mut etl) = config.etl {
        // Output lives with the rest of the state; inputs sit next to the config
        etl.output_dir = if etl.output_dir.is_absolute() {
            etl.output_dir
        } else {
            resolved.home.join(&etl.output_dir)
        };
        etl.csv_source = etl
            .csv_source
            .map(|p| resolve_path(&config_dir, &p.to_string_lossy()));
        resolved.etl = etl;
    }

    if let Some(order) = config.order {
        resolved.order = order;
    }

    resolved
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".sagaflow");

    let config_file = find_config_file();
    let config = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let env_home = std::env::var("SAGAFLOW_HOME").ok().map(PathBuf::from);

    Ok(resolve(config, config_file, env_home, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the sagaflow home directory (engine state).
pub fn sagaflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(ConfigFile::default(), None, None, PathBuf::from("/home/u/.sagaflow"));

        assert_eq!(config.home, PathBuf::from("/home/u/.sagaflow"));
        assert_eq!(config.history_backend, HistoryBackend::Jsonl);
        assert_eq!(config.history_path, PathBuf::from("/home/u/.sagaflow/instances"));
        assert_eq!(config.etl.output_dir, PathBuf::from("/home/u/.sagaflow/etl-output"));
        assert_eq!(config.runtime, RuntimeSettings::default());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_env_home_wins() {
        let config = ConfigFile {
            paths: PathsConfig {
                home: Some("state".to_string()),
            },
            ..ConfigFile::default()
        };
        let resolved = resolve(
            config,
            Some(PathBuf::from("/proj/.sagaflow/config.yaml")),
            Some(PathBuf::from("/env/home")),
            PathBuf::from("/default"),
        );

        assert_eq!(resolved.home, PathBuf::from("/env/home"));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".sagaflow");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
history:
  backend: sqlite
runtime:
  max_concurrent_activities: 4
  instance_timeout_seconds: 60
retry:
  max_attempts: 5
  initial_delay_ms: 10
safety:
  max_tasks_per_instance: 20
etl:
  output_dir: out
  csv_source: data/customers.csv
  max_records_per_source: 50
order:
  payment_limit: 500.0
  stock:
    WIDGET-1: 3
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        let resolved = resolve(config, Some(config_path), Some(PathBuf::from("/h")), PathBuf::from("/d"));

        assert_eq!(resolved.history_backend, HistoryBackend::Sqlite);
        assert_eq!(resolved.history_path, PathBuf::from("/h/history.db"));
        assert_eq!(resolved.runtime.max_concurrent_activities, 4);
        assert_eq!(resolved.runtime.instance_timeout_seconds, 60);
        assert_eq!(resolved.runtime.activity_timeout_seconds, 30);
        assert_eq!(resolved.runtime.retry.max_attempts, 5);
        assert_eq!(resolved.runtime.retry.initial_delay_ms, 10);
        assert_eq!(resolved.runtime.safety.max_tasks_per_instance, 20);
        assert_eq!(resolved.etl.output_dir, PathBuf::from("/h/out"));
        assert_eq!(resolved.etl.csv_source, Some(dir.join("data/customers.csv")));
        assert_eq!(resolved.etl.max_records_per_source, 50);
        assert_eq!(resolved.etl.sources.len(), 3);
        assert_eq!(resolved.order.payment_limit, Some(500.0));
        assert_eq!(resolved.order.stock.get("WIDGET-1"), Some(&3));
    }

    #[test]
    fn test_empty_config_file() {
        assert!(parse_config("").unwrap().retry.is_none());
    }

    #[test]
    fn test_open_memory_store() {
        let mut config = ResolvedConfig::with_home(PathBuf::from("/unused"));
        config.history_backend = HistoryBackend::Memory;
        assert_eq!(config.open_history_store().unwrap().name(), "memory");
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
