use async_trait::async_trait;
use sql_rag::config::PipelineConfig;
use sql_rag::error::{RagError, Result};
use sql_rag::execution::{QueryResult, QueryRunner, Row};
use sql_rag::llm::{ChatTurn, Dialect, GenerationResponse, SqlGenerator};
use sql_rag::pipeline::{Orchestrator, PipelineStatus};
use sql_rag::rag::{ContextProvider, ContextSnippet};
use sql_rag::schema::SchemaSnapshot;
use sql_rag::security::SqlValidator;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct EmptyContext;

#[async_trait]
impl ContextProvider for EmptyContext {
    async fn retrieve(&self, _question: &str) -> Result<Vec<ContextSnippet>> {
        Ok(Vec::new())
    }
}

struct FailingContext;

#[async_trait]
impl ContextProvider for FailingContext {
    async fn retrieve(&self, _question: &str) -> Result<Vec<ContextSnippet>> {
        Err(RagError::Retrieval("vector index unavailable".to_string()))
    }
}

/// Replays scripted replies in order, then fails
struct MockGenerator {
    replies: Mutex<VecDeque<Result<String>>>,
    calls: AtomicUsize,
}

impl MockGenerator {
    fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn always(reply: &str) -> Self {
        Self::new((0..10).map(|_| Ok(reply.to_string())).collect())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlGenerator for MockGenerator {
    async fn generate(&self, _prompt: &str) -> Result<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Ok(content)) => Ok(GenerationResponse::new(content, "mock-model")),
            Some(Err(e)) => Err(e),
            None => Err(RagError::Generation("connection refused".to_string())),
        }
    }
}

#[derive(Default)]
struct MockRunner {
    calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
    fail_with: Option<String>,
    /// Simulated query duration, bounded by the requested timeout
    delay: Option<Duration>,
}

impl MockRunner {
    fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryRunner for MockRunner {
    async fn execute(
        &self,
        sql: &str,
        _params: &[serde_json::Value],
        timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());
        if let Some(message) = &self.fail_with {
            return Err(RagError::Database(message.clone()));
        }
        if let Some(delay) = self.delay {
            let limit = timeout.unwrap_or(Duration::from_secs(30));
            if tokio::time::timeout(limit, tokio::time::sleep(delay)).await.is_err() {
                return Err(RagError::Database(format!(
                    "Query timed out after {}s",
                    limit.as_secs_f64()
                )));
            }
        }
        let mut row = Row::new();
        row.insert("id".to_string(), serde_json::json!(1));
        row.insert("name".to_string(), serde_json::json!("John Doe"));
        Ok(QueryResult::new(
            vec!["id".to_string(), "name".to_string()],
            vec![row],
            "mock",
            1,
        ))
    }
}

fn snapshot() -> Arc<SchemaSnapshot> {
    Arc::new(SchemaSnapshot::from_tables(vec![
        ("patients", vec!["id", "name"]),
        ("visits", vec!["id", "patient_id", "visit_date"]),
    ]))
}

fn build(
    context: Arc<dyn ContextProvider>,
    generator: Arc<MockGenerator>,
    runner: Arc<MockRunner>,
) -> Orchestrator {
    Orchestrator::new(
        context,
        generator,
        runner,
        SqlValidator::new(snapshot()),
        Dialect::Sqlite,
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn test_rejected_query_is_regenerated() {
    let generator = Arc::new(MockGenerator::new(vec![
        Ok("DROP TABLE patients".to_string()),
        Ok("SELECT * FROM patients LIMIT 10".to_string()),
    ]));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = build(Arc::new(EmptyContext), generator.clone(), runner.clone());

    let result = orchestrator.process("Show me the patients", &[]).await;

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(
        result.generated_sql.as_deref(),
        Some("SELECT * FROM patients LIMIT 10")
    );
    assert_eq!(generator.calls(), 2);
    assert_eq!(runner.calls(), 1);
    assert_eq!(result.data.as_ref().unwrap().row_count, 1);
    assert!(result
        .step("validation_try_1")
        .and_then(|s| s.error.as_deref())
        .unwrap()
        .contains("DROP"));
}

#[tokio::test]
async fn test_sentinel_skips_validation_and_execution() {
    let generator = Arc::new(MockGenerator::always("NO_SQL"));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = build(Arc::new(EmptyContext), generator.clone(), runner.clone());

    let result = orchestrator.process("What is the weather today?", &[]).await;

    assert_eq!(result.status, PipelineStatus::NoSqlGenerated);
    assert!(result.data.is_none());
    assert!(result.error.is_none());
    assert_eq!(runner.calls(), 0);
    assert_eq!(generator.calls(), 1);
    assert!(result.steps.iter().all(|s| !s.name.starts_with("validation")));
}

#[tokio::test]
async fn test_sentinel_match_is_case_insensitive() {
    let generator = Arc::new(MockGenerator::always("```sql\nno_sql\n```"));
    let runner = Arc::new(MockRunner::default());
    let result = build(Arc::new(EmptyContext), generator, runner.clone())
        .process("Who won the match?", &[])
        .await;

    assert_eq!(result.status, PipelineStatus::NoSqlGenerated);
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn test_generation_failures_exhaust_budget() {
    let generator = Arc::new(MockGenerator::new(vec![
        Err(RagError::Generation("timeout".to_string())),
        Err(RagError::Generation("timeout".to_string())),
        Err(RagError::Generation("timeout".to_string())),
    ]));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = build(Arc::new(EmptyContext), generator.clone(), runner.clone());

    let result = orchestrator.process("How many patients?", &[]).await;

    assert_eq!(result.status, PipelineStatus::Error);
    let error = result.error.unwrap();
    assert!(error.contains("3 attempts"), "unexpected error: {}", error);
    assert!(error.contains("timeout"));
    assert_eq!(result.attempts, 3);
    assert_eq!(generator.calls(), 3);
    assert_eq!(runner.calls(), 0);
    assert!(result.generated_sql.is_none());
}

#[tokio::test]
async fn test_budget_is_shared_between_generation_and_validation() {
    let generator = Arc::new(MockGenerator::new(vec![
        Err(RagError::Generation("rate limit exceeded".to_string())),
        Ok("SELECT * FROM hackers LIMIT 5".to_string()),
        Err(RagError::Generation("timeout".to_string())),
        Ok("SELECT * FROM patients LIMIT 5".to_string()),
    ]));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = build(Arc::new(EmptyContext), generator.clone(), runner.clone());

    let result = orchestrator.process("Show patients", &[]).await;

    assert_eq!(result.status, PipelineStatus::Error);
    assert_eq!(generator.calls(), 3);
    assert_eq!(runner.calls(), 0);
    assert_eq!(result.generated_sql.as_deref(), Some("SELECT * FROM hackers LIMIT 5"));
}

#[tokio::test]
async fn test_execution_failure_is_terminal() {
    let generator = Arc::new(MockGenerator::always("SELECT COUNT(*) FROM visits"));
    let runner = Arc::new(MockRunner::failing("no such column: visit_date"));
    let orchestrator = build(Arc::new(EmptyContext), generator.clone(), runner.clone());

    let result = orchestrator.process("How many visits?", &[]).await;

    assert_eq!(result.status, PipelineStatus::Error);
    assert_eq!(
        result.error.as_deref(),
        Some("Database error: no such column: visit_date")
    );
    assert_eq!(generator.calls(), 1);
    assert_eq!(runner.calls(), 1);
    assert!(result.step("execution").unwrap().error.is_some());
}

#[tokio::test]
async fn test_execution_timeout_is_terminal_and_not_retried() {
    let generator = Arc::new(MockGenerator::always("SELECT COUNT(*) FROM visits"));
    let runner = Arc::new(MockRunner::slow(Duration::from_secs(10)));
    let orchestrator = build(Arc::new(EmptyContext), generator.clone(), runner.clone())
        .with_execution_timeout(Duration::from_millis(50));

    let result = orchestrator.process("How many visits?", &[]).await;

    assert_eq!(result.status, PipelineStatus::Error);
    assert!(result.error.as_ref().unwrap().contains("timed out"));
    assert_eq!(generator.calls(), 1);
    assert_eq!(runner.calls(), 1);
    assert_eq!(result.attempts, 1);
    assert!(result.step("execution").unwrap().error.is_some());
}

#[tokio::test]
async fn test_query_within_timeout_succeeds() {
    let generator = Arc::new(MockGenerator::always("SELECT COUNT(*) FROM visits"));
    let runner = Arc::new(MockRunner::slow(Duration::from_millis(10)));
    let orchestrator = build(Arc::new(EmptyContext), generator, runner.clone())
        .with_execution_timeout(Duration::from_secs(5));

    let result = orchestrator.process("How many visits?", &[]).await;

    assert_eq!(result.status, PipelineStatus::Success);
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn test_retrieval_failure_is_terminal() {
    let generator = Arc::new(MockGenerator::always("SELECT COUNT(*) FROM visits"));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = build(Arc::new(FailingContext), generator.clone(), runner.clone());

    let result = orchestrator.process("How many visits?", &[]).await;

    assert_eq!(result.status, PipelineStatus::Error);
    assert!(result.error.unwrap().contains("vector index unavailable"));
    assert_eq!(generator.calls(), 0);
    assert_eq!(runner.calls(), 0);
    assert_eq!(result.steps.len(), 1);
}

#[tokio::test]
async fn test_identical_runs_agree() {
    let generator = Arc::new(MockGenerator::always(
        "SQL Query: SELECT name FROM patients WHERE id = 1 LIMIT 1",
    ));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = build(Arc::new(EmptyContext), generator, runner.clone());
    let history = vec![
        ChatTurn::user("Show me patient 1"),
        ChatTurn::assistant("SELECT * FROM patients WHERE id = 1 LIMIT 1"),
    ];

    let first = orchestrator.process("What is their name?", &history).await;
    let second = orchestrator.process("What is their name?", &history).await;

    assert_eq!(first.status, second.status);
    assert_eq!(first.generated_sql, second.generated_sql);
    assert_eq!(
        first.generated_sql.as_deref(),
        Some("SELECT name FROM patients WHERE id = 1 LIMIT 1")
    );
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(runner.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_runs_share_one_orchestrator() {
    let generator = Arc::new(MockGenerator::always("SELECT COUNT(*) FROM patients"));
    let runner = Arc::new(MockRunner::default());
    let orchestrator = Arc::new(build(Arc::new(EmptyContext), generator, runner.clone()));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .process(&format!("How many patients? ({})", i), &[])
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().status, PipelineStatus::Success);
    }
    assert_eq!(runner.calls(), 4);
}
