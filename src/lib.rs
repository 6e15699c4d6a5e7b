pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod rag;
pub mod schema;
pub mod security;

pub use config::AppConfig;
pub use error::{RagError, Result, ValidationRule};
pub use execution::{DatabaseEngine, QueryResult, QueryRunner};
pub use llm::{ChatTurn, Dialect, OllamaClient, SqlGenerator};
pub use pipeline::{Orchestrator, PipelineResult, PipelineStatus};
pub use rag::{ContextProvider, SchemaContextProvider};
pub use schema::{JsonSchemaSource, SchemaElement, SchemaSnapshot, SchemaSource};
pub use security::SqlValidator;
