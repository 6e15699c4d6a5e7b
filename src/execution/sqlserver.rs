//! SQL Server engine backed by tiberius.
//!
//! The tiberius client needs `&mut self` for every query, so each call opens
//! its own TDS connection. Dropping the call on timeout closes it.

use crate::config::DatabaseConfig;
use crate::error::{RagError, Result};
use crate::execution::result::{decimal_to_json, float_to_json, QueryResult, Row};
use crate::execution::group_columns;
use crate::schema::SchemaElement;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde_json::Value;
use std::borrow::Cow;
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

const ENGINE_NAME: &str = "sqlserver";

const SCHEMA_QUERY: &str = "
    SELECT c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, t.TABLE_TYPE
    FROM INFORMATION_SCHEMA.COLUMNS c
    JOIN INFORMATION_SCHEMA.TABLES t
      ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
    ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
";

type TdsClient = Client<Compat<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SqlServerRunner {
    config: Config,
    address: String,
}

impl SqlServerRunner {
    pub fn new(config: &DatabaseConfig) -> Self {
        let mut tds = Config::new();
        tds.host(&config.host);
        tds.port(config.port());
        tds.database(&config.name);
        tds.authentication(AuthMethod::sql_server(&config.username, &config.password));
        if config.trust_server_certificate {
            tds.trust_cert();
        }
        Self {
            address: tds.get_addr(),
            config: tds,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TdsClient> {
        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|e| RagError::Database(format!("Failed to connect to {}: {}", self.address, e)))?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(self.config.clone(), tcp.compat_write()).await?;
        debug!("Opened SQL Server connection to {}", self.address);
        Ok(client)
    }

    pub async fn execute(&self, sql: &str, params: &[Value], timeout: Duration) -> Result<QueryResult> {
        let start = Instant::now();
        let (columns, rows) = tokio::time::timeout(timeout, self.run_query(sql, params))
            .await
            .map_err(|_| {
                RagError::Database(format!("Query timed out after {}s", timeout.as_secs_f64()))
            })??;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!("SQL Server returned {} rows in {}ms", rows.len(), elapsed);
        Ok(QueryResult::new(columns, rows, ENGINE_NAME, elapsed))
    }

    async fn run_query(&self, sql: &str, params: &[Value]) -> Result<(Vec<String>, Vec<Row>)> {
        let mut client = self.connect().await?;
        let values: Vec<SqlParam> = params.iter().map(SqlParam::from).collect();
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();

        let mut stream = client.query(sql, &refs).await?;
        // metadata arrives before the first row, so names survive an empty result
        let columns: Vec<String> = stream
            .columns()
            .await?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut records = Vec::new();
        for row in stream.into_first_result().await? {
            let mut record = Row::new();
            for (name, data) in columns.iter().zip(row) {
                record.insert(name.clone(), tds_value(data)?);
            }
            records.push(record);
        }
        Ok((columns, records))
    }

    pub async fn validate_connection(&self) -> bool {
        match self.connect().await {
            Ok(mut client) => match client.simple_query("SELECT 1").await {
                Ok(stream) => stream.into_results().await.is_ok(),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    pub async fn load_schema(&self) -> Result<Vec<SchemaElement>> {
        let mut client = self.connect().await?;
        let rows = client.simple_query(SCHEMA_QUERY).await?.into_first_result().await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let text = |idx: usize| -> Result<String> {
                Ok(row.try_get::<&str, _>(idx)?.unwrap_or_default().to_string())
            };
            columns.push((text(0)?, text(1)?, text(2)?, text(3)? == "VIEW"));
        }

        let elements = group_columns(columns);
        info!("Loaded {} schema elements from SQL Server", elements.len());
        Ok(elements)
    }
}

/// JSON parameter bound as `@P1`, `@P2`, ...
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for SqlParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Int(i),
                None => SqlParam::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Text(other.to_string()),
        }
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlParam::Null => ColumnData::String(None),
            SqlParam::Bool(b) => ColumnData::Bit(Some(*b)),
            SqlParam::Int(i) => ColumnData::I64(Some(*i)),
            SqlParam::Float(f) => ColumnData::F64(Some(*f)),
            SqlParam::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}

fn tds_value(data: ColumnData<'static>) -> Result<Value> {
    let value = match &data {
        ColumnData::U8(Some(v)) => Value::from(*v),
        ColumnData::I16(Some(v)) => Value::from(*v),
        ColumnData::I32(Some(v)) => Value::from(*v),
        ColumnData::I64(Some(v)) => Value::from(*v),
        ColumnData::F32(Some(v)) => float_to_json(f64::from(*v)),
        ColumnData::F64(Some(v)) => float_to_json(*v),
        ColumnData::Bit(Some(v)) => Value::Bool(*v),
        ColumnData::String(Some(v)) => Value::String(v.to_string()),
        ColumnData::Guid(Some(v)) => Value::String(v.to_string()),
        ColumnData::Binary(Some(v)) => Value::String(format!("<blob {} bytes>", v.len())),
        ColumnData::Numeric(Some(n)) => numeric_to_json(n.value(), n.scale()),
        ColumnData::Xml(Some(xml)) => Value::String(xml.clone().into_owned().into_string()),
        ColumnData::DateTime(Some(_))
        | ColumnData::SmallDateTime(Some(_))
        | ColumnData::DateTime2(Some(_)) => temporal::<NaiveDateTime>(&data)?,
        ColumnData::Date(Some(_)) => temporal::<NaiveDate>(&data)?,
        ColumnData::Time(Some(_)) => temporal::<NaiveTime>(&data)?,
        ColumnData::DateTimeOffset(Some(_)) => DateTime::<FixedOffset>::from_sql(&data)?
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    };
    Ok(value)
}

fn temporal<'a, T>(data: &'a ColumnData<'static>) -> Result<Value>
where
    T: FromSql<'a> + ToString,
{
    Ok(T::from_sql(data)?
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null))
}

fn numeric_to_json(value: i128, scale: u8) -> Value {
    match Decimal::try_from_i128_with_scale(value, u32::from(scale)) {
        Ok(decimal) => decimal_to_json(decimal),
        Err(_) => float_to_json(value as f64 / 10f64.powi(i32::from(scale))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;
    use serde_json::json;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            engine: EngineKind::SqlServer,
            host: "127.0.0.1".to_string(),
            port: Some(9),
            name: "medical".to_string(),
            username: "sa".to_string(),
            password: "pw".to_string(),
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_address_uses_engine_default_port() {
        let runner = SqlServerRunner::new(&DatabaseConfig {
            port: None,
            ..config()
        });
        assert_eq!(runner.address(), "127.0.0.1:1433");
    }

    #[test]
    fn test_params_map_to_tds_types() {
        let params = [json!(null), json!(true), json!(7), json!(2.5), json!("Ada")];
        let mapped: Vec<SqlParam> = params.iter().map(SqlParam::from).collect();
        assert_eq!(
            mapped,
            vec![
                SqlParam::Null,
                SqlParam::Bool(true),
                SqlParam::Int(7),
                SqlParam::Float(2.5),
                SqlParam::Text("Ada".to_string()),
            ]
        );
        assert!(matches!(mapped[2].to_sql(), ColumnData::I64(Some(7))));
        assert!(matches!(mapped[0].to_sql(), ColumnData::String(None)));
    }

    #[test]
    fn test_column_data_to_json() {
        assert_eq!(tds_value(ColumnData::I32(Some(42))).unwrap(), json!(42));
        assert_eq!(tds_value(ColumnData::Bit(Some(false))).unwrap(), json!(false));
        assert_eq!(
            tds_value(ColumnData::String(Some(Cow::Owned("John Doe".to_string())))).unwrap(),
            json!("John Doe")
        );
        assert_eq!(tds_value(ColumnData::I64(None)).unwrap(), Value::Null);
        assert_eq!(
            tds_value(ColumnData::Binary(Some(Cow::Owned(vec![1, 2, 3])))).unwrap(),
            json!("<blob 3 bytes>")
        );
    }

    #[test]
    fn test_numeric_to_json() {
        // AVG(CAST(x AS DECIMAL(10, 4)))
        assert_eq!(numeric_to_json(25_000, 4), json!(2.5));
        assert_eq!(numeric_to_json(1_200, 2), json!(12));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let runner = SqlServerRunner::new(&config());
        assert!(!runner.validate_connection().await);

        let err = runner
            .execute("SELECT TOP 1 * FROM patients", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Database(_)));
    }
}
