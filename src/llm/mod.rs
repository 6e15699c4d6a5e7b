//! Text-generation side of the pipeline: the generator contract and its
//! Ollama transport, the shared rate limiter, prompt assembly and SQL
//! extraction from raw responses.

pub mod client;
pub mod prompt;
pub mod rate_limiter;
pub mod retry;
pub mod sql_parser;

pub use client::{GenerationResponse, OllamaClient, SqlGenerator, TokenUsage};
pub use prompt::{ChatRole, ChatTurn, Dialect, PromptBuilder, PromptRequest};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use sql_parser::SqlParser;
