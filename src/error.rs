use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rule in the validator chain that rejected a candidate query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    NonEmpty,
    ProhibitedOperation,
    SchemaExistence,
    ColumnExistence,
    Complexity,
    ResultLimit,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationRule::NonEmpty => write!(f, "non_empty"),
            ValidationRule::ProhibitedOperation => write!(f, "prohibited_operation"),
            ValidationRule::SchemaExistence => write!(f, "schema_existence"),
            ValidationRule::ColumnExistence => write!(f, "column_existence"),
            ValidationRule::Complexity => write!(f, "complexity"),
            ValidationRule::ResultLimit => write!(f, "result_limit"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Security violation ({rule}): {reason}")]
    SecurityViolation { rule: ValidationRule, reason: String },

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RagError {
    pub fn security(rule: ValidationRule, reason: impl Into<String>) -> Self {
        RagError::SecurityViolation {
            rule,
            reason: reason.into(),
        }
    }

    /// Errors that are folded back into the next generation prompt
    /// instead of ending the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RagError::SecurityViolation { .. } | RagError::Generation(_)
        )
    }

    /// The validator rule behind a security violation, if any.
    pub fn violated_rule(&self) -> Option<ValidationRule> {
        match self {
            RagError::SecurityViolation { rule, .. } => Some(*rule),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for RagError {
    fn from(err: rusqlite::Error) -> Self {
        RagError::Database(err.to_string())
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::Database(err.to_string())
    }
}

impl From<tiberius::error::Error> for RagError {
    fn from(err: tiberius::error::Error) -> Self {
        RagError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        RagError::Generation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
