use crate::config::LlmConfig;
use crate::error::{RagError, Result};
use crate::llm::rate_limiter::RateLimiter;
use crate::llm::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Text returned by one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub model: String,
    pub token_usage: Option<TokenUsage>,
    /// Backend-reported duration in nanoseconds
    pub total_duration_ns: Option<u64>,
}

impl GenerationResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            token_usage: None,
            total_duration_ns: None,
        }
    }
}

/// Text-generation backend. Implementations do their own transport retries
/// and report exhaustion as [`RagError::Generation`].
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<GenerationResponse>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
    model: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    total_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsReply {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Ollama HTTP client
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    config: LlmConfig,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
}

impl OllamaClient {
    /// Client with its own rate limiter built from the config
    pub fn new(config: LlmConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            Duration::from_secs_f64(config.rate_limit_period_secs),
        ));
        Self::with_rate_limiter(config, limiter)
    }

    /// Client sharing a process-wide rate limiter
    pub fn with_rate_limiter(config: LlmConfig, rate_limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RagError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        let retry_policy = RetryPolicy::exponential(config.retry_attempts);
        Ok(Self {
            http,
            config,
            rate_limiter,
            retry_policy,
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Names of the models installed on the server
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.config.base_url.trim_end_matches('/'));
        let reply: TagsReply = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate_once(&self, prompt: &str) -> Result<GenerationResponse> {
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));
        let body = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
                top_p: self.config.top_p,
            },
        };

        let reply: GenerateReply = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(self.to_response(reply))
    }

    fn to_response(&self, reply: GenerateReply) -> GenerationResponse {
        let token_usage = match (reply.prompt_eval_count, reply.eval_count) {
            (None, None) => None,
            (prompt_tokens, completion_tokens) => Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
            }),
        };
        GenerationResponse {
            content: reply.response,
            model: reply.model.unwrap_or_else(|| self.config.model.clone()),
            token_usage,
            total_duration_ns: reply.total_duration,
        }
    }
}

#[async_trait]
impl SqlGenerator for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<GenerationResponse> {
        if !self.rate_limiter.acquire(Some(self.config.timeout())).await {
            warn!("Rate limiter timed out waiting for a token");
            return Err(RagError::Generation("Rate limit exceeded".to_string()));
        }

        debug!("Prompt sent to {}:\n{}", self.config.model, prompt);
        let response = self
            .retry_policy
            .retry_with_backoff(
                || self.generate_once(prompt),
                |e| matches!(e, RagError::Generation(_)),
            )
            .await
            .map_err(|e| match e {
                RagError::Generation(detail) => RagError::Generation(format!(
                    "Failed to generate response from Ollama after {} attempts: {}",
                    self.retry_policy.max_attempts.max(1),
                    detail
                )),
                other => other,
            })?;

        info!(
            "🤖 Generated {} chars with {}",
            response.content.len(),
            response.model
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OllamaClient {
        OllamaClient::new(LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 1,
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_reply_mapping() {
        let reply: GenerateReply = serde_json::from_str(
            r#"{"model":"gemma:2b","response":"SELECT 1","prompt_eval_count":12,"eval_count":4,"total_duration":1500}"#,
        )
        .unwrap();
        let response = client().to_response(reply);
        assert_eq!(response.content, "SELECT 1");
        assert_eq!(response.model, "gemma:2b");
        assert_eq!(
            response.token_usage,
            Some(TokenUsage {
                prompt_tokens: Some(12),
                completion_tokens: Some(4)
            })
        );
        assert_eq!(response.total_duration_ns, Some(1500));
    }

    #[test]
    fn test_reply_without_metadata_uses_configured_model() {
        let reply: GenerateReply = serde_json::from_str(r#"{"response":"NO_SQL"}"#).unwrap();
        let response = client().to_response(reply);
        assert_eq!(response.model, "gemma:2b");
        assert!(response.token_usage.is_none());
    }

    #[test]
    fn test_request_body_shape() {
        let body = GenerateRequest {
            model: "gemma:2b",
            prompt: "hi",
            stream: false,
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: 512,
                top_p: 0.9,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 512);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_generation_failure() {
        let client = client().with_retry_policy(RetryPolicy::immediate(2));
        let err = client.generate("SELECT 1").await.unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
        let message = err.to_string();
        assert!(message.contains("after 2 attempts"));
        assert_eq!(message.matches("Generation error").count(), 1);
        assert_eq!(message.matches("attempts").count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_timeout_is_generation_failure() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(3600)));
        assert!(limiter.try_acquire());

        let client = OllamaClient::with_rate_limiter(
            LlmConfig {
                timeout_secs: 0,
                ..LlmConfig::default()
            },
            limiter,
        )
        .unwrap();
        let err = client.generate("prompt").await.unwrap_err();
        assert_eq!(err.to_string(), "Generation error: Rate limit exceeded");
    }
}
