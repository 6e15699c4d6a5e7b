//! PostgreSQL engine backed by a sqlx connection pool.

use crate::config::DatabaseConfig;
use crate::error::{RagError, Result};
use crate::execution::group_columns;
use crate::execution::result::{decimal_to_json, float_to_json, QueryResult, Row};
use crate::schema::SchemaElement;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Executor, Postgres, Row as SqlxRow, Statement, TypeInfo, ValueRef};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ENGINE_NAME: &str = "postgres";

const SCHEMA_QUERY: &str = r#"
    SELECT c.table_name::text, c.column_name::text, c.data_type::text, t.table_type::text
    FROM information_schema.columns c
    JOIN information_schema.tables t
      ON t.table_schema = c.table_schema AND t.table_name = c.table_name
    WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
    ORDER BY c.table_name, c.ordinal_position
"#;

#[derive(Debug, Clone)]
pub struct PostgresRunner {
    pool: PgPool,
}

impl PostgresRunner {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.postgres_url())
            .await
            .map_err(|e| {
                RagError::Database(format!(
                    "Failed to connect to {}:{}/{}: {}",
                    config.host,
                    config.port(),
                    config.name,
                    e
                ))
            })?;
        info!("Connected to PostgreSQL at {}:{}", config.host, config.port());
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn execute(&self, sql: &str, params: &[Value], timeout: Duration) -> Result<QueryResult> {
        let start = Instant::now();
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }

        let rows = tokio::time::timeout(timeout, query.fetch_all(&self.pool))
            .await
            .map_err(|_| {
                RagError::Database(format!("Query timed out after {}s", timeout.as_secs_f64()))
            })??;

        let columns: Vec<String> = match rows.first() {
            Some(row) => column_names(row.columns()),
            // no rows to read names from; ask the server to describe the statement
            None => column_names(self.pool.prepare(sql).await?.columns()),
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                record.insert(name.clone(), pg_value(row, idx)?);
            }
            records.push(record);
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!("PostgreSQL returned {} rows in {}ms", records.len(), elapsed);
        Ok(QueryResult::new(columns, records, ENGINE_NAME, elapsed))
    }

    pub async fn validate_connection(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn load_schema(&self) -> Result<Vec<SchemaElement>> {
        let rows: Vec<(String, String, String, String)> =
            sqlx::query_as(SCHEMA_QUERY).fetch_all(&self.pool).await?;

        let elements = group_columns(
            rows.into_iter()
                .map(|(table, column, dtype, table_type)| (table, column, dtype, table_type == "VIEW")),
        );

        info!("Loaded {} schema elements from PostgreSQL", elements.len());
        Ok(elements)
    }
}

fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

fn bind_json<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn pg_value(row: &PgRow, idx: usize) -> Result<Value> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }

    let type_name = row.columns()[idx].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => Value::Bool(row.try_get(idx)?),
        "INT2" => Value::from(row.try_get::<i16, _>(idx)?),
        "INT4" => Value::from(row.try_get::<i32, _>(idx)?),
        "INT8" => Value::from(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => float_to_json(f64::from(row.try_get::<f32, _>(idx)?)),
        "FLOAT8" => float_to_json(row.try_get::<f64, _>(idx)?),
        "NUMERIC" => decimal_to_json(row.try_get::<Decimal, _>(idx)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::String(row.try_get(idx)?),
        "DATE" => Value::String(row.try_get::<chrono::NaiveDate, _>(idx)?.to_string()),
        "TIME" => Value::String(row.try_get::<chrono::NaiveTime, _>(idx)?.to_string()),
        "TIMESTAMP" => Value::String(row.try_get::<chrono::NaiveDateTime, _>(idx)?.to_string()),
        "TIMESTAMPTZ" => Value::String(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)?
                .to_rfc3339(),
        ),
        "UUID" => Value::String(row.try_get::<uuid::Uuid, _>(idx)?.to_string()),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx)?,
        other => Value::String(format!("<{}>", other.to_lowercase())),
    };
    Ok(value)
}
