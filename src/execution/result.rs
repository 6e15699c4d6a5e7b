//! Query Result - Standardized result format from execution engines

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Standardized query result from any execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names, in select order
    pub columns: Vec<String>,

    pub rows: Vec<Row>,

    /// Number of rows returned
    pub row_count: usize,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,

    /// Engine that executed the query
    pub engine_name: String,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>, engine_name: &str, execution_time_ms: u64) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
            engine_name: engine_name.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

/// Non-finite floats have no JSON form and become null
pub(crate) fn float_to_json(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Whole decimals become integers when they fit, the rest become floats
pub(crate) fn decimal_to_json(value: Decimal) -> serde_json::Value {
    if value.fract().is_zero() {
        if let Some(i) = value.to_i64() {
            return serde_json::Value::from(i);
        }
    }
    match value.to_f64() {
        Some(f) => float_to_json(f),
        None => serde_json::Value::String(value.to_string()),
    }
}
