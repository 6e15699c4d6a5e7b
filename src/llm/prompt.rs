//! Prompt assembly for SQL generation.

use crate::error::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL dialect the generator is asked to write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    TSql,
}

impl Dialect {
    pub fn display_name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SQLite",
            Dialect::Postgres => "PostgreSQL",
            Dialect::TSql => "T-SQL (SQL Server)",
        }
    }

    /// How this dialect bounds a result set
    pub fn row_limit_hint(&self) -> &'static str {
        match self {
            Dialect::Sqlite | Dialect::Postgres => "LIMIT n at the end of the query",
            Dialect::TSql => "SELECT TOP n",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::User => write!(f, "User"),
            ChatRole::Assistant => write!(f, "Assistant"),
        }
    }
}

/// One prior conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Everything one generation attempt needs
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub question: &'a str,
    pub context: &'a str,
    pub history: &'a [ChatTurn],
    /// Violation or generation error from the previous attempt
    pub previous_error: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    dialect: Dialect,
    history_window: usize,
    sentinel: String,
}

impl PromptBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            history_window: 5,
            sentinel: "NO_SQL".to_string(),
        }
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns;
        self
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn build(&self, request: &PromptRequest<'_>) -> Result<String> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(RagError::Validation("Question cannot be empty".to_string()));
        }

        let mut parts = Vec::new();
        parts.push(format!(
            "You are an expert SQL developer. Write a correct and efficient {} query that answers the user's question.",
            self.dialect
        ));

        parts.push("\n### Database Schema".to_string());
        if request.context.trim().is_empty() {
            parts.push("(no schema context available)".to_string());
        } else {
            parts.push(request.context.trim().to_string());
        }

        let recent = self.recent_history(request.history);
        if !recent.is_empty() {
            parts.push("\n### Conversation History".to_string());
            for turn in recent {
                parts.push(format!("{}: {}", turn.role, turn.content.trim()));
            }
        }

        parts.push("\n### Instructions".to_string());
        parts.push("1. Return ONLY the SQL query, without explanations.".to_string());
        parts.push(format!("2. Use {} syntax.", self.dialect));
        parts.push("3. Only read data: never modify tables, schema or permissions.".to_string());
        parts.push(format!(
            "4. Bound the result with {} unless the query aggregates.",
            self.dialect.row_limit_hint()
        ));
        parts.push(format!(
            "5. If the question cannot be answered with the given schema, return \"{}\".",
            self.sentinel
        ));

        if let Some(previous_error) = request.previous_error {
            parts.push("\n### Previous Attempt Failed".to_string());
            parts.push(format!("Error: {}", previous_error));
            parts.push("Fix the problem and return a corrected query.".to_string());
        }

        parts.push("\n### User Question".to_string());
        parts.push(question.to_string());
        parts.push("\n### SQL Query".to_string());

        Ok(parts.join("\n"))
    }

    fn recent_history<'h>(&self, history: &'h [ChatTurn]) -> &'h [ChatTurn] {
        let start = history.len().saturating_sub(self.history_window);
        &history[start..]
    }
}
