//! Configuration for conductor.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONDUCTOR_HOME, CONDUCTOR_DB, CONDUCTOR_GENERATOR,
//!    ANTHROPIC_API_KEY)
//! 2. Config file (.conductor/config.yaml)
//! 3. Defaults (~/.conductor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conductor/config.yaml
//! - Paths in config file are relative to the .conductor/ directory

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{GenerationSettings, StagePolicies};

const CONFIG_DIR: &str = ".conductor";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub stages: Option<StagePolicies>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .conductor/)
    pub home: Option<String>,
    /// SQLite database file (relative to .conductor/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_ms: Option<u64>,
}

/// Which generative backend the stages call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// No service; every stage uses its fallback
    Offline,
    Anthropic,
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "offline" | "none" => Ok(Self::Offline),
            "anthropic" => Ok(Self::Anthropic),
            other => anyhow::bail!("Unknown generation provider: {}", other),
        }
    }
}

/// Resolved generation settings
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSettingsConfig {
    pub provider: Provider,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub base_url: String,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl GenerationSettingsConfig {
    pub fn settings(&self) -> GenerationSettings {
        GenerationSettings {
            max_tokens: self.max_tokens,
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to conductor home (engine state)
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub generation: GenerationSettingsConfig,
    pub stages: StagePolicies,
    pub poll_interval_ms: u64,
}

impl ResolvedConfig {
    /// Load configuration from the environment, the nearest config file and defaults
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let config_file = find_config_file(&cwd);
        Self::from_sources(config_file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Resolve from an explicit config file and environment lookup
    pub fn from_sources(
        config_path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = match config_path {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        // paths in the file are relative to .conductor/
        let config_dir = config_path.and_then(Path::parent).unwrap_or(Path::new("."));

        let home = if let Some(env_home) = env("CONDUCTOR_HOME") {
            PathBuf::from(env_home)
        } else if let (Some(home), Some(_)) = (&file.paths.home, config_path) {
            resolve_path(config_dir, home)
        } else {
            default_home()?
        };

        let database = if let Some(env_db) = env("CONDUCTOR_DB") {
            PathBuf::from(env_db)
        } else if let (Some(db), Some(_)) = (&file.paths.database, config_path) {
            resolve_path(config_dir, db)
        } else {
            home.join("conductor.db")
        };

        let api_key = env("ANTHROPIC_API_KEY").filter(|key| !key.trim().is_empty());
        let provider = match env("CONDUCTOR_GENERATOR").or(file.generation.provider.clone()) {
            Some(name) => name.parse()?,
            // a key alone is enough to opt in
            None if api_key.is_some() => Provider::Anthropic,
            None => Provider::Offline,
        };

        let generation = GenerationSettingsConfig {
            provider,
            model: file
                .generation
                .model
                .unwrap_or_else(|| "claude-3-sonnet-20240229".to_string()),
            max_tokens: file.generation.max_tokens.unwrap_or(4096),
            timeout_seconds: file.generation.timeout_seconds.unwrap_or(120),
            base_url: file
                .generation
                .base_url
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            api_key,
        };

        Ok(Self {
            home,
            database,
            config_file: config_path.map(Path::to_path_buf),
            generation,
            stages: file.stages.unwrap_or_default(),
            poll_interval_ms: file.worker.poll_interval_ms.unwrap_or(500),
        })
    }

    /// Durable job queue log
    pub fn queue_path(&self) -> PathBuf {
        self.home.join("queue.jsonl")
    }

    /// Stage run log
    pub fn run_log_path(&self) -> PathBuf {
        self.home.join("runs.jsonl")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let config_dir = dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join(CONFIG_FILE);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ResolvedConfig::from_sources(None, env(&[])).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".conductor");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.database, expected_home.join("conductor.db"));
        assert_eq!(config.queue_path(), expected_home.join("queue.jsonl"));
        assert_eq!(config.generation.provider, Provider::Offline);
        assert_eq!(config.stages.planning.retry.max_attempts, 3);
        assert_eq!(config.stages.planning.concurrency, 5);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1"
paths:
  home: ./state
generation:
  provider: anthropic
  model: claude-test
  max_tokens: 900
stages:
  planning:
    max_attempts: 5
    base_delay_ms: 10
    concurrency: 2
worker:
  poll_interval_ms: 50
"#,
        );

        let config = ResolvedConfig::from_sources(Some(&path), env(&[])).unwrap();

        assert_eq!(config.home, temp.path().join(CONFIG_DIR).join("state"));
        assert_eq!(config.database, config.home.join("conductor.db"));
        assert_eq!(config.generation.provider, Provider::Anthropic);
        assert_eq!(config.generation.model, "claude-test");
        assert_eq!(config.generation.max_tokens, 900);
        assert_eq!(config.stages.planning.retry.max_attempts, 5);
        assert_eq!(config.stages.planning.retry.base_delay_ms, 10);
        assert_eq!(config.stages.planning.concurrency, 2);
        assert_eq!(config.stages.feasibility.retry.max_attempts, 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            "paths:\n  home: ./state\ngeneration:\n  provider: anthropic\n",
        );

        let config = ResolvedConfig::from_sources(
            Some(&path),
            env(&[
                ("CONDUCTOR_HOME", "/srv/conductor"),
                ("CONDUCTOR_DB", "/srv/db/pipeline.db"),
                ("CONDUCTOR_GENERATOR", "offline"),
            ]),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/conductor"));
        assert_eq!(config.database, PathBuf::from("/srv/db/pipeline.db"));
        assert_eq!(config.generation.provider, Provider::Offline);
    }

    #[test]
    fn test_api_key_selects_anthropic() {
        let config =
            ResolvedConfig::from_sources(None, env(&[("ANTHROPIC_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.generation.provider, Provider::Anthropic);
        assert_eq!(config.generation.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let err = ResolvedConfig::from_sources(None, env(&[("CONDUCTOR_GENERATOR", "gpt")]))
            .unwrap_err();
        assert!(err.to_string().contains("gpt"));
    }

    #[test]
    fn test_find_config_file_searches_parents() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "version: \"1\"\n");
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
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
