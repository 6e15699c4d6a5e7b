//! Execution Layer
//!
//! Runs validated SQL against the configured database and returns rows as
//! JSON maps. One engine is selected at startup from [`EngineKind`].

pub mod postgres;
pub mod result;
pub mod sqlite;
pub mod sqlserver;

pub use postgres::PostgresRunner;
pub use result::*;
pub use sqlite::SqliteRunner;
pub use sqlserver::SqlServerRunner;

use crate::config::{DatabaseConfig, EngineKind};
use crate::error::Result;
use crate::llm::Dialect;
use crate::schema::{ElementKind, SchemaElement, SchemaSource};
use async_trait::async_trait;
use std::time::Duration;

/// Executes read-only SQL. `timeout` overrides the engine default.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        timeout: Option<Duration>,
    ) -> Result<QueryResult>;
}

#[derive(Debug, Clone)]
enum Backend {
    Sqlite(SqliteRunner),
    Postgres(PostgresRunner),
    SqlServer(SqlServerRunner),
}

/// The configured database engine
#[derive(Debug, Clone)]
pub struct DatabaseEngine {
    backend: Backend,
    default_timeout: Duration,
}

impl DatabaseEngine {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let backend = match config.engine {
            EngineKind::Sqlite => Backend::Sqlite(SqliteRunner::new(config.path.clone())),
            EngineKind::Postgres => Backend::Postgres(PostgresRunner::connect(config).await?),
            EngineKind::SqlServer => Backend::SqlServer(SqlServerRunner::new(config)),
        };
        Ok(Self {
            backend,
            default_timeout: config.query_timeout(),
        })
    }

    pub fn sqlite(runner: SqliteRunner, default_timeout: Duration) -> Self {
        Self {
            backend: Backend::Sqlite(runner),
            default_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::Postgres(_) => "postgres",
            Backend::SqlServer(_) => "sqlserver",
        }
    }

    /// Prompt dialect matching this engine
    pub fn dialect(&self) -> Dialect {
        match self.backend {
            Backend::Sqlite(_) => Dialect::Sqlite,
            Backend::Postgres(_) => Dialect::Postgres,
            Backend::SqlServer(_) => Dialect::TSql,
        }
    }

    pub async fn validate_connection(&self) -> bool {
        match &self.backend {
            Backend::Sqlite(runner) => runner.validate_connection().await,
            Backend::Postgres(runner) => runner.validate_connection().await,
            Backend::SqlServer(runner) => runner.validate_connection().await,
        }
    }
}

#[async_trait]
impl QueryRunner for DatabaseEngine {
    async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match &self.backend {
            Backend::Sqlite(runner) => runner.execute(sql, params, timeout).await,
            Backend::Postgres(runner) => runner.execute(sql, params, timeout).await,
            Backend::SqlServer(runner) => runner.execute(sql, params, timeout).await,
        }
    }
}

#[async_trait]
impl SchemaSource for DatabaseEngine {
    async fn load_schema(&self) -> Result<Vec<SchemaElement>> {
        match &self.backend {
            Backend::Sqlite(runner) => runner.load_schema().await,
            Backend::Postgres(runner) => runner.load_schema().await,
            Backend::SqlServer(runner) => runner.load_schema().await,
        }
    }
}

/// Build table and column elements from `(table, column, dtype, is_view)`
/// rows that arrive grouped by table.
pub(crate) fn group_columns(
    rows: impl IntoIterator<Item = (String, String, String, bool)>,
) -> Vec<SchemaElement> {
    let mut elements = Vec::new();
    let mut current: Option<String> = None;
    for (table, column, dtype, is_view) in rows {
        if current.as_deref() != Some(table.as_str()) {
            let mut element = SchemaElement::table(&table);
            if is_view {
                element.kind = ElementKind::View;
                element.description = Some(format!("View: {}", table));
            }
            elements.push(element);
            current = Some(table.clone());
        }
        elements.push(SchemaElement::column(&table, &column, &dtype));
    }
    elements
}
