use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Codeflow
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodeflowConfig {
    /// Per-workflow execution bounds
    pub governance: GovernanceConfig,
    /// Per-client workflow-start ceiling
    pub rate_limit: RateLimitConfig,
    /// Durable checkpoint store (absent = in-memory only)
    pub database: Option<DatabaseConfig>,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// External stage commands
    pub stages: StagesConfig,
    /// Client-facing settings
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Wall-clock budget per workflow, measured from its start
    pub max_duration_secs: u64,
    /// Ceiling on node executions per workflow
    pub max_node_executions: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 24 * 60 * 60,
            max_node_executions: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Workflow starts allowed per client per window
    pub requests_per_window: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
    /// Serialized file maps larger than this go to the side table
    pub blob_threshold_bytes: usize,
    /// Drop old checkpoints once a thread reaches a terminal state
    pub prune_on_completion: bool,
    /// Checkpoints kept per thread when pruning
    pub keep_last: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: ".codeflow/checkpoints.db".to_string(),
            max_connections: 10,
            auto_migrate: true,
            blob_threshold_bytes: 64 * 1024,
            prune_on_completion: false,
            keep_last: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable text
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StagesConfig {
    /// argv of the planning program
    pub plan_command: Option<Vec<String>>,
    /// argv of the code generation program
    pub generate_command: Option<Vec<String>>,
    /// argv of the debugging program
    pub debug_command: Option<Vec<String>>,
    /// Per-invocation timeout for stage programs
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: u64,
}

fn default_stage_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend base address advertised to clients
    pub base_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
        }
    }
}

impl Default for CodeflowConfig {
    fn default() -> Self {
        Self {
            governance: GovernanceConfig::default(),
            rate_limit: RateLimitConfig::default(),
            database: None, // Durable storage is opt-in via config or DATABASE_URL
            observability: ObservabilityConfig::default(),
            stages: StagesConfig {
                timeout_secs: default_stage_timeout(),
                ..StagesConfig::default()
            },
            client: ClientConfig::default(),
        }
    }
}

impl CodeflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (codeflow.toml, .codeflow-rc)
    /// 3. Environment variables (prefixed with CODEFLOW_, nested with `__`)
    /// 4. DATABASE_URL, which enables the durable checkpoint store
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&CodeflowConfig::default())?);

        if Path::new("codeflow.toml").exists() {
            builder = builder.add_source(File::with_name("codeflow"));
        }

        if Path::new(".codeflow-rc").exists() {
            builder = builder.add_source(File::with_name(".codeflow-rc").format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("CODEFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut codeflow_config: CodeflowConfig = config.try_deserialize()?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            codeflow_config.apply_database_url(url);
        }

        Ok(codeflow_config)
    }

    /// Point the durable store at `url`, keeping any other database settings
    pub fn apply_database_url(&mut self, url: String) {
        if url.trim().is_empty() {
            return;
        }
        let database = self.database.get_or_insert_with(DatabaseConfig::default);
        database.url = url;
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Self::load_env_file_from(".env")? {
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Load a dotenv file; `Ok(false)` when there is none
    pub fn load_env_file_from<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        dotenvy::from_path(path).with_context(|| format!("Malformed env file {}", path.display()))?;
        Ok(true)
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<CodeflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first; a broken one must not hide the rest of the config
        if let Err(e) = CodeflowConfig::load_env_file() {
            tracing::warn!(error = %e, "Ignoring .env file");
        }
        CodeflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static CodeflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_malformed_env_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "CODEFLOW_TEST_UNTERMINATED='oops\n").unwrap();

        let err = CodeflowConfig::load_env_file_from(&path).unwrap_err();
        assert!(err.to_string().contains("Malformed env file"));
        assert!(!CodeflowConfig::load_env_file_from(dir.path().join("missing.env")).unwrap());
    }

    #[test]
    fn test_defaults_have_no_durable_store() {
        let config = CodeflowConfig::default();

        assert!(config.database.is_none());
        assert_eq!(config.governance.max_node_executions, 50);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert_eq!(config.stages.timeout_secs, 600);
    }

    #[test]
    fn test_database_url_enables_durable_store() {
        let mut config = CodeflowConfig::default();
        config.apply_database_url("sqlite://data/checkpoints.db".to_string());

        let database = config.database.expect("database configured");
        assert_eq!(database.url, "sqlite://data/checkpoints.db");
        assert!(database.auto_migrate);

        let mut untouched = CodeflowConfig::default();
        untouched.apply_database_url("   ".to_string());
        assert!(untouched.database.is_none());
    }

    #[test]
    fn test_save_and_reload_round_trip_through_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("codeflow.toml");

        let mut config = CodeflowConfig::default();
        config.governance.max_node_executions = 7;
        config.stages.plan_command = Some(vec!["python".into(), "plan.py".into()]);
        config.save_to_file(&path).unwrap();

        let loaded: CodeflowConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.governance.max_node_executions, 7);
        assert_eq!(
            loaded.stages.plan_command,
            Some(vec!["python".to_string(), "plan.py".to_string()])
        );
    }
}
