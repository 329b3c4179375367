use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Top-level Sluice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for the database, analytics store and logs.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub relational: RelationalConfig,
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            relational: RelationalConfig::default(),
            warehouse: None,
            model: None,
            sandbox: SandboxConfig::default(),
            log: None,
        }
    }
}

fn default_workspace() -> String { "~/.sluice".to_string() }

/// How unresolved `{placeholders}` are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// Leave unresolved placeholders in place.
    #[default]
    Permissive,
    /// Fail the node with `DataNotFound`.
    Strict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One node at a time in topological order.
    #[default]
    Sequential,
    /// Ready-queue dispatch of independent nodes.
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub resolver: ResolverMode,
    #[serde(default)]
    pub execution: ExecutionMode,
    /// Upper bound on concurrently running nodes per session (parallel mode).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverMode::default(),
            execution: ExecutionMode::default(),
            max_parallel: default_max_parallel(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_parallel() -> usize { 4 }
fn default_event_capacity() -> usize { 256 }

/// Engine state database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite file. Default: <workspace>/sluice.db
    #[serde(default)]
    pub path: Option<String>,
}

/// Relational store used by `dataSource` and `sql_execution` nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// Path to the SQLite file. Default: <workspace>/analytics.db
    #[serde(default)]
    pub path: Option<String>,
}

/// HTTP warehouse connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_warehouse_timeout")]
    pub timeout_secs: u64,
}

fn default_warehouse_timeout() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Script sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Parent directory for per-run working dirs. Default: the system temp dir.
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    /// Bytes kept from the end of stdout and of stderr.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_interpreter() -> String { "python3".to_string() }
fn default_sandbox_timeout() -> u64 { 60 }
fn default_max_output_bytes() -> usize { 10 * 1024 * 1024 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            work_dir: None,
            timeout_secs: default_sandbox_timeout(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = session summary only, 2 = per node, 3 = per node with snapshots (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SluiceError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        Self::parse(&expanded)
    }

    /// Parse config from TOML text (no env expansion).
    pub fn parse(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| SluiceError::Config(e.to_string()))?;
        if config.engine.max_parallel == 0 {
            return Err(SluiceError::Config("engine.max_parallel must be at least 1".into()));
        }
        Ok(config)
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    pub fn store_path(&self) -> PathBuf {
        match &self.store.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("sluice.db"),
        }
    }

    pub fn relational_path(&self) -> PathBuf {
        match &self.relational.path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("analytics.db"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("logs"),
        }
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        match &self.sandbox.work_dir {
            Some(p) => expand_home(p),
            None => std::env::temp_dir(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SLUICE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SLUICE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SLUICE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SLUICE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SLUICE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.resolver, ResolverMode::Permissive);
        assert_eq!(config.engine.execution, ExecutionMode::Sequential);
        assert_eq!(config.engine.max_parallel, 4);
        assert_eq!(config.sandbox.interpreter, "python3");
        assert_eq!(config.sandbox.timeout_secs, 60);
        assert!(config.model.is_none());
        assert!(config.warehouse.is_none());
        assert!(config.log.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
workspace = "/srv/sluice"

[engine]
resolver = "strict"
execution = "parallel"
max_parallel = 8

[warehouse]
base_url = "https://warehouse.internal/api"
token = "secret"

[model]
model_id = "gpt-4o-mini"
api_key = "sk-test"

[model.retry]
max_retries = 5

[sandbox]
interpreter = "/usr/bin/python3.12"
timeout_secs = 30

[log]
level = 3
"#;
        let config = AppConfig::parse(toml_str).unwrap();
        assert_eq!(config.engine.resolver, ResolverMode::Strict);
        assert_eq!(config.engine.execution, ExecutionMode::Parallel);
        assert_eq!(config.engine.max_parallel, 8);
        assert_eq!(config.warehouse.as_ref().unwrap().timeout_secs, 60);
        let model = config.model.as_ref().unwrap();
        assert_eq!(model.provider, "openai");
        assert_eq!(model.retry.as_ref().unwrap().max_retries, 5);
        assert_eq!(model.retry.as_ref().unwrap().initial_backoff_ms, 1000);
        assert_eq!(config.sandbox.timeout_secs, 30);
        assert_eq!(config.log.as_ref().unwrap().level, 3);
        assert_eq!(config.store_path(), PathBuf::from("/srv/sluice/sluice.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/sluice/logs"));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = AppConfig::parse("[engine]\nmax_parallel = 0\n").unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn test_unknown_resolver_mode_rejected() {
        assert!(AppConfig::parse("[engine]\nresolver = \"lenient\"\n").is_err());
    }
}
