//! Pipeline Result - what one run hands back to its caller

use crate::execution::QueryResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    NoSqlGenerated,
    Error,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Success => write!(f, "success"),
            PipelineStatus::NoSqlGenerated => write!(f, "no_sql_generated"),
            PipelineStatus::Error => write!(f, "error"),
        }
    }
}

/// One phase of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Parsed generator output for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub sql: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub question: String,
    pub status: PipelineStatus,
    /// Last parsed candidate, whether or not it was executed
    pub generated_sql: Option<String>,
    pub data: Option<QueryResult>,
    pub error: Option<String>,
    pub steps: Vec<StepTrace>,
    /// Generation attempts made
    pub attempts: u32,
    pub total_duration_ms: u64,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    pub fn step(&self, name: &str) -> Option<&StepTrace> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Times one phase and turns into a [`StepTrace`] when it ends
pub(crate) struct StepTimer {
    name: String,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl StepTimer {
    pub(crate) fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    pub(crate) fn finish(self) -> StepTrace {
        self.into_trace(None)
    }

    pub(crate) fn fail(self, error: impl Into<String>) -> StepTrace {
        self.into_trace(Some(error.into()))
    }

    fn into_trace(self, error: Option<String>) -> StepTrace {
        StepTrace {
            name: self.name,
            started_at: self.started_at,
            duration_ms: self.start.elapsed().as_millis() as u64,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&PipelineStatus::NoSqlGenerated).unwrap();
        assert_eq!(json, "\"no_sql_generated\"");
        assert_eq!(PipelineStatus::NoSqlGenerated.to_string(), "no_sql_generated");
    }

    #[test]
    fn test_step_timer() {
        let ok = StepTimer::start("retrieval").finish();
        assert_eq!(ok.name, "retrieval");
        assert!(ok.error.is_none());

        let failed = StepTimer::start("execution").fail("no such table: x");
        assert_eq!(failed.error.as_deref(), Some("no such table: x"));
    }
}
