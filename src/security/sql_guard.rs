//! SQL Guard
//!
//! Stateless, schema-aware rule chain for generated SQL. Every check is a
//! regular-expression scan over the raw text, not a parse: keywords and
//! identifiers inside string literals or comments are seen like any other
//! token.
//!
//! Chain order (first failure wins):
//! 1. non-empty
//! 2. prohibited operations (DDL, DML, DCL, dangerous procedures)
//! 3. table existence for identifiers after FROM / JOIN
//! 4. column existence for `table.column` references (opt-in)
//! 5. complexity ceiling (JOIN count, SELECT count)
//! 6. result-size guard (TOP / LIMIT or an aggregate call)

use crate::config::PipelineConfig;
use crate::error::{RagError, Result, ValidationRule};
use crate::schema::{JsonSchemaSource, SchemaSnapshot};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Keywords that are never allowed as whole words, in reporting order
pub const PROHIBITED_KEYWORDS: &[&str] = &[
    "DROP",
    "ALTER",
    "CREATE",
    "TRUNCATE",
    "INSERT",
    "UPDATE",
    "DELETE",
    "MERGE",
    "GRANT",
    "REVOKE",
    "XP_CMDSHELL",
    "SP_EXECUTESQL",
];

lazy_static! {
    static ref PROHIBITED: Regex =
        Regex::new(&format!(r"(?i)\b({})\b", PROHIBITED_KEYWORDS.join("|"))).unwrap();
    static ref TABLE_REF: Regex =
        Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_\["`][\w.\]\["`$#]*)"#).unwrap();
    static ref COLUMN_REF: Regex = Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\b").unwrap();
    static ref JOIN: Regex = Regex::new(r"(?i)\bJOIN\b").unwrap();
    static ref SELECT: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref ROW_LIMIT: Regex = Regex::new(r"(?i)\bTOP\s*\(?\s*\d+|\bLIMIT\s+\d+").unwrap();
    static ref AGGREGATE: Regex = Regex::new(r"(?i)\b(?:COUNT|SUM|AVG|MIN|MAX)\s*\(").unwrap();
}

/// Tunable limits of the rule chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub max_joins: usize,
    /// Ceiling on SELECT keywords, a proxy for subquery nesting
    pub max_subqueries: usize,
    /// Include the column-existence rule in [`SqlValidator::validate`]
    pub check_columns: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_joins: 5,
            max_subqueries: 3,
            check_columns: false,
        }
    }
}

impl From<&PipelineConfig> for GuardConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_joins: config.max_joins,
            max_subqueries: config.max_subqueries,
            check_columns: config.check_columns,
        }
    }
}

/// Outcome of running the chain without raising
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Pass,
    Fail { rule: ValidationRule, reason: String },
}

impl ValidationOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, ValidationOutcome::Pass)
    }
}

/// Schema-aware SQL validator
#[derive(Debug, Clone)]
pub struct SqlValidator {
    schema: Arc<SchemaSnapshot>,
    config: GuardConfig,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new(Arc::new(SchemaSnapshot::empty()))
    }
}

impl SqlValidator {
    pub fn new(schema: Arc<SchemaSnapshot>) -> Self {
        Self::with_config(schema, GuardConfig::default())
    }

    pub fn with_config(schema: Arc<SchemaSnapshot>, config: GuardConfig) -> Self {
        Self { schema, config }
    }

    /// Build from a JSON schema description on disk
    pub fn from_schema_file(path: impl AsRef<Path>, config: GuardConfig) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RagError::Configuration(format!("Failed to read schema file {}: {}", path.display(), e))
        })?;
        let elements = JsonSchemaSource::parse(&raw)?;
        Ok(Self::with_config(
            Arc::new(SchemaSnapshot::from_elements(&elements)),
            config,
        ))
    }

    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Run the full chain, raising the first violation
    pub fn validate(&self, sql: &str) -> Result<()> {
        self.validate_not_empty(sql)?;
        self.validate_prohibited_operations(sql)?;
        self.validate_schema(sql)?;
        if self.config.check_columns {
            self.validate_columns(sql)?;
        }
        self.validate_complexity(sql)?;
        self.enforce_result_limit(sql)?;
        debug!("SQL passed validation");
        Ok(())
    }

    /// Run the full chain and report a rule violation instead of raising.
    /// Errors other than a violation are still returned as errors.
    pub fn check(&self, sql: &str) -> Result<ValidationOutcome> {
        match self.validate(sql) {
            Ok(()) => Ok(ValidationOutcome::Pass),
            Err(RagError::SecurityViolation { rule, reason }) => {
                Ok(ValidationOutcome::Fail { rule, reason })
            }
            Err(other) => Err(other),
        }
    }

    pub fn validate_not_empty(&self, sql: &str) -> Result<()> {
        if sql.trim().is_empty() {
            return Err(RagError::security(
                ValidationRule::NonEmpty,
                "Query cannot be empty.",
            ));
        }
        Ok(())
    }

    /// Whole-word, case-insensitive match against [`PROHIBITED_KEYWORDS`].
    /// `update_date` does not match `UPDATE`.
    pub fn validate_prohibited_operations(&self, sql: &str) -> Result<()> {
        if let Some(found) = PROHIBITED.find(sql) {
            return Err(RagError::security(
                ValidationRule::ProhibitedOperation,
                format!(
                    "Query contains prohibited keyword: {}",
                    found.as_str().to_uppercase()
                ),
            ));
        }
        Ok(())
    }

    /// Identifiers after FROM / JOIN must be known tables.
    /// Always passes when the snapshot is empty.
    pub fn validate_schema(&self, sql: &str) -> Result<()> {
        if self.schema.is_empty() {
            return Ok(());
        }

        for table in referenced_tables(sql) {
            if !self.is_known_table(&table) {
                return Err(RagError::security(
                    ValidationRule::SchemaExistence,
                    format!("Query references unknown table: {}", table),
                ));
            }
        }
        Ok(())
    }

    /// `table.column` references must name a known column when the table is
    /// known. Aliases and schema prefixes are not resolved and are skipped.
    pub fn validate_columns(&self, sql: &str) -> Result<()> {
        if self.schema.is_empty() {
            return Ok(());
        }

        for caps in COLUMN_REF.captures_iter(sql) {
            let table = &caps[1];
            let column = &caps[2];
            if self.schema.has_table(table) && !self.schema.has_column(table, column) {
                return Err(RagError::security(
                    ValidationRule::ColumnExistence,
                    format!("Column '{}' does not exist in table '{}'", column, table),
                ));
            }
        }
        Ok(())
    }

    pub fn validate_complexity(&self, sql: &str) -> Result<()> {
        let joins = JOIN.find_iter(sql).count();
        if joins > self.config.max_joins {
            return Err(RagError::security(
                ValidationRule::Complexity,
                format!(
                    "Query has too many JOINs: {} (max: {})",
                    joins, self.config.max_joins
                ),
            ));
        }

        let selects = SELECT.find_iter(sql).count();
        if selects > self.config.max_subqueries {
            return Err(RagError::security(
                ValidationRule::Complexity,
                format!(
                    "Query nests too many SELECTs: {} (max: {})",
                    selects, self.config.max_subqueries
                ),
            ));
        }
        Ok(())
    }

    /// Require TOP / LIMIT or an aggregate so the result set stays bounded
    pub fn enforce_result_limit(&self, sql: &str) -> Result<()> {
        if ROW_LIMIT.is_match(sql) || AGGREGATE.is_match(sql) {
            return Ok(());
        }
        Err(RagError::security(
            ValidationRule::ResultLimit,
            "Query must include a row limit (TOP or LIMIT) or an aggregate function; unbounded scans are not allowed.",
        ))
    }

    fn is_known_table(&self, table: &str) -> bool {
        if self.schema.has_table(table) {
            return true;
        }
        // schema-qualified names such as dbo.patients or main.patients
        table
            .rsplit('.')
            .next()
            .map(|name| self.schema.has_table(name))
            .unwrap_or(false)
    }
}

/// Table identifiers following FROM / JOIN, with quoting stripped
pub fn referenced_tables(sql: &str) -> Vec<String> {
    TABLE_REF
        .captures_iter(sql)
        .map(|caps| {
            caps[1]
                .chars()
                .filter(|c| !matches!(c, '[' | ']' | '"' | '`'))
                .collect::<String>()
        })
        .map(|name| name.trim_end_matches('.').to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
