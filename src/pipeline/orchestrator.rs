//! Orchestrator
//!
//! Bounded retry loop: retrieve context once, then generate, parse and
//! validate until a candidate passes or the retry budget runs out, then
//! execute the passing candidate exactly once.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::execution::{QueryResult, QueryRunner};
use crate::llm::{ChatTurn, Dialect, PromptBuilder, PromptRequest, SqlGenerator, SqlParser};
use crate::pipeline::result::{
    CandidateQuery, PipelineResult, PipelineStatus, StepTimer, StepTrace,
};
use crate::rag::ContextProvider;
use crate::schema::{SchemaSnapshot, SchemaSource};
use crate::security::{GuardConfig, SqlValidator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Drives one question through the pipeline. Holds no per-run state, so a
/// single instance can serve concurrent runs.
pub struct Orchestrator {
    retriever: Arc<dyn ContextProvider>,
    generator: Arc<dyn SqlGenerator>,
    runner: Arc<dyn QueryRunner>,
    validator: SqlValidator,
    prompt_builder: PromptBuilder,
    parser: SqlParser,
    config: PipelineConfig,
    execution_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<dyn ContextProvider>,
        generator: Arc<dyn SqlGenerator>,
        runner: Arc<dyn QueryRunner>,
        validator: SqlValidator,
        dialect: Dialect,
        mut config: PipelineConfig,
    ) -> Self {
        // at least one generation attempt per run
        config.max_retries = config.max_retries.max(1);
        let prompt_builder = PromptBuilder::new(dialect)
            .with_history_window(config.history_window)
            .with_sentinel(config.no_sql_sentinel.clone());
        Self {
            retriever,
            generator,
            runner,
            validator,
            prompt_builder,
            parser: SqlParser::new(),
            config,
            execution_timeout: None,
        }
    }

    /// Load the schema snapshot once and build the validator from it
    pub async fn from_schema_source(
        source: &dyn SchemaSource,
        retriever: Arc<dyn ContextProvider>,
        generator: Arc<dyn SqlGenerator>,
        runner: Arc<dyn QueryRunner>,
        dialect: Dialect,
        config: PipelineConfig,
    ) -> Result<Self> {
        let elements = source.load_schema().await?;
        let snapshot = SchemaSnapshot::from_elements(&elements);
        info!("Schema snapshot holds {} tables", snapshot.table_count());
        let validator = SqlValidator::with_config(Arc::new(snapshot), GuardConfig::from(&config));
        Ok(Self::new(retriever, generator, runner, validator, dialect, config))
    }

    /// Timeout passed to the runner; `None` uses the engine default
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn validator(&self) -> &SqlValidator {
        &self.validator
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer one question. Never fails: every outcome is a [`PipelineResult`].
    pub async fn process(&self, question: &str, history: &[ChatTurn]) -> PipelineResult {
        let run = RunState::new(question);
        let span = info_span!("pipeline", run_id = %run.run_id);
        self.run(run, history).instrument(span).await
    }

    async fn run(&self, mut run: RunState, history: &[ChatTurn]) -> PipelineResult {
        info!("Processing question: {}", run.question);

        // Retrieving
        let timer = StepTimer::start("retrieval");
        let context = match self.retriever.retrieve(&run.question).await {
            Ok(snippets) => {
                run.steps.push(timer.finish());
                debug!("Retrieved {} context snippets", snippets.len());
                self.retriever.format(&snippets)
            }
            Err(e) => {
                let message = format!("Unexpected error during retrieval: {}", e);
                run.steps.push(timer.fail(e.to_string()));
                error!("{}", message);
                return run.fail(message);
            }
        };

        let mut last_error: Option<String> = None;
        let mut validated: Option<CandidateQuery> = None;

        for attempt in 1..=self.config.max_retries {
            info!("Generation attempt {} of {}", attempt, self.config.max_retries);

            // Prompting
            let request = PromptRequest {
                question: &run.question,
                context: &context,
                history,
                previous_error: last_error.as_deref(),
            };
            let timer = StepTimer::start(format!("prompt_try_{}", attempt));
            let prompt = match self.prompt_builder.build(&request) {
                Ok(prompt) => {
                    run.steps.push(timer.finish());
                    prompt
                }
                Err(e) => {
                    let message = format!("Unexpected error during prompt assembly: {}", e);
                    run.steps.push(timer.fail(e.to_string()));
                    error!("{}", message);
                    return run.fail(message);
                }
            };

            // Generating
            run.attempts = attempt;
            let timer = StepTimer::start(format!("generation_try_{}", attempt));
            let response = match self.generator.generate(&prompt).await {
                Ok(response) => {
                    run.steps.push(timer.finish());
                    response
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Generation attempt {} failed: {}", attempt, e);
                    run.steps.push(timer.fail(e.to_string()));
                    last_error = Some(e.to_string());
                    continue;
                }
                Err(e) => {
                    let message = format!("Unexpected error during generation: {}", e);
                    run.steps.push(timer.fail(e.to_string()));
                    error!("{}", message);
                    return run.fail(message);
                }
            };

            // Parsing
            let timer = StepTimer::start(format!("parsing_try_{}", attempt));
            let candidate = CandidateQuery {
                sql: self.parser.parse(&response.content),
                attempt,
            };
            debug!("Candidate SQL (attempt {}): {}", attempt, candidate.sql);
            run.generated_sql = Some(candidate.sql.clone());
            let unanswerable = self
                .parser
                .is_sentinel(&candidate.sql, &self.config.no_sql_sentinel);
            run.steps.push(timer.finish());

            if unanswerable {
                info!("Generator reported the question as unanswerable");
                return run.finish(PipelineStatus::NoSqlGenerated, None, None);
            }

            // Validating
            let timer = StepTimer::start(format!("validation_try_{}", attempt));
            match self.validator.validate(&candidate.sql) {
                Ok(()) => {
                    run.steps.push(timer.finish());
                    validated = Some(candidate);
                    break;
                }
                Err(e) => {
                    warn!("Attempt {} rejected: {}", attempt, e);
                    run.steps.push(timer.fail(e.to_string()));
                    last_error = Some(e.to_string());
                }
            }
        }

        let candidate = match validated {
            Some(candidate) => candidate,
            None => {
                let message = format!(
                    "Failed to produce a valid SQL query after {} attempts. Last error: {}",
                    run.attempts,
                    last_error.as_deref().unwrap_or("none")
                );
                error!("{}", message);
                return run.fail(message);
            }
        };

        // Executing
        let timer = StepTimer::start("execution");
        match self
            .runner
            .execute(&candidate.sql, &[], self.execution_timeout)
            .await
        {
            Ok(result) => {
                run.steps.push(timer.finish());
                info!(
                    "✅ Query succeeded on attempt {} with {} rows",
                    candidate.attempt, result.row_count
                );
                run.finish(PipelineStatus::Success, Some(result), None)
            }
            Err(e) => {
                run.steps.push(timer.fail(e.to_string()));
                error!("Execution failed: {}", e);
                run.fail(e.to_string())
            }
        }
    }
}

/// Per-run bookkeeping, consumed into the final result
struct RunState {
    run_id: Uuid,
    question: String,
    started: Instant,
    steps: Vec<StepTrace>,
    attempts: u32,
    generated_sql: Option<String>,
}

impl RunState {
    fn new(question: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            question: question.to_string(),
            started: Instant::now(),
            steps: Vec::new(),
            attempts: 0,
            generated_sql: None,
        }
    }

    fn fail(self, error: String) -> PipelineResult {
        self.finish(PipelineStatus::Error, None, Some(error))
    }

    fn finish(
        self,
        status: PipelineStatus,
        data: Option<QueryResult>,
        error: Option<String>,
    ) -> PipelineResult {
        PipelineResult {
            run_id: self.run_id,
            question: self.question,
            status,
            generated_sql: self.generated_sql,
            data,
            error,
            steps: self.steps,
            attempts: self.attempts,
            total_duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
