//! Application Configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file
//! (with `${VAR}` / `${VAR:default}` placeholders resolved from the
//! environment), then a handful of well-known environment overrides.

use crate::error::{RagError, Result};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

lazy_static! {
    static ref ENV_PLACEHOLDER: Regex = Regex::new(r"\$\{([^}:]+)(?::([^}]*))?\}").unwrap();
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Database engine family, selected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Sqlite,
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mssql")]
    SqlServer,
}

impl EngineKind {
    pub fn default_port(&self) -> u16 {
        match self {
            EngineKind::Sqlite => 0,
            EngineKind::Postgres => 5432,
            EngineKind::SqlServer => 1433,
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(EngineKind::Sqlite),
            "postgres" | "postgresql" => Ok(EngineKind::Postgres),
            "sqlserver" | "mssql" => Ok(EngineKind::SqlServer),
            other => Err(RagError::Configuration(format!(
                "Unsupported database engine '{}' (expected sqlite, postgres or sqlserver)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: EngineKind,
    /// Database file for the sqlite engine
    pub path: PathBuf,
    pub host: String,
    /// Defaults to the engine's standard port
    pub port: Option<u16>,
    pub name: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed SQL Server certificates
    pub trust_server_certificate: bool,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Sqlite,
            path: PathBuf::from("data/demo.db"),
            host: "localhost".to_string(),
            port: None,
            name: "medical".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            trust_server_certificate: false,
            max_connections: 5,
            acquire_timeout_secs: 30,
            query_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port(),
            self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    /// Transport-level attempts per generation call
    pub retry_attempts: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_period_secs: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "gemma:2b".to_string(),
            timeout_secs: 45,
            temperature: 0.1,
            max_tokens: 512,
            top_p: 0.9,
            retry_attempts: 3,
            rate_limit_requests: 60,
            rate_limit_period_secs: 60.0,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// JSON schema export used instead of live introspection
    pub schema_file: Option<PathBuf>,
    pub top_k: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            schema_file: None,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Shared budget for generation failures and validation failures
    pub max_retries: u32,
    pub history_window: usize,
    pub max_joins: usize,
    pub max_subqueries: usize,
    pub check_columns: bool,
    pub no_sql_sentinel: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            history_window: 5,
            max_joins: 5,
            max_subqueries: 3,
            check_columns: false,
            no_sql_sentinel: "NO_SQL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::load`] with an explicit variable lookup
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    RagError::Configuration(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_yaml_str(&raw, &lookup)?
            }
            Some(path) => {
                debug!("Config file {} not found, using defaults", path.display());
                AppConfig::default()
            }
            None => AppConfig::default(),
        };

        config.apply_env_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str<F>(raw: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolved = substitute_env_vars(raw, lookup);
        if resolved.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        serde_yaml::from_str(&resolved)
            .map_err(|e| RagError::Configuration(format!("Invalid configuration file: {}", e)))
    }

    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup("DB_TYPE") {
            self.database.engine = engine.parse()?;
        }
        if let Some(path) = lookup("DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(host) = lookup("DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            self.database.port = Some(
                port.parse()
                    .map_err(|_| RagError::Configuration(format!("DB_PORT is not a valid port: {}", port)))?,
            );
        }
        if let Some(name) = lookup("DB_NAME") {
            self.database.name = name;
        }
        if let Some(user) = lookup("DB_USER") {
            self.database.username = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.database.password = password;
        }
        if let Some(base_url) = lookup("OLLAMA_BASE_URL") {
            self.llm.base_url = base_url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.llm.model = model;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.engine != EngineKind::Sqlite && self.database.password.is_empty() {
            return Err(RagError::Configuration(
                "Database password is required (DB_PASSWORD env var or config file)".to_string(),
            ));
        }
        if self.pipeline.max_retries == 0 {
            return Err(RagError::Configuration(
                "pipeline.max_retries must be at least 1".to_string(),
            ));
        }
        if self.llm.rate_limit_requests == 0 {
            return Err(RagError::Configuration(
                "llm.rate_limit_requests must be at least 1".to_string(),
            ));
        }
        if self.llm.rate_limit_period_secs <= 0.0 {
            return Err(RagError::Configuration(
                "llm.rate_limit_period_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replace `${VAR}` and `${VAR:default}` placeholders.
/// Unset variables without a default become empty strings.
pub fn substitute_env_vars<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_PLACEHOLDER
        .replace_all(raw, |caps: &Captures| {
            let name = &caps[1];
            lookup(name)
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}
