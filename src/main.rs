use anyhow::{Context, Result};
use clap::Parser;
use sql_rag::config::AppConfig;
use sql_rag::execution::DatabaseEngine;
use sql_rag::llm::{ChatTurn, OllamaClient};
use sql_rag::pipeline::{Orchestrator, PipelineResult, PipelineStatus};
use sql_rag::rag::SchemaContextProvider;
use sql_rag::schema::{JsonSchemaSource, SchemaSnapshot, SchemaSource};
use sql_rag::security::{GuardConfig, SqlValidator};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sql-rag")]
#[command(about = "Ask questions of a SQL database in natural language")]
struct Args {
    /// Answer a single question and exit instead of starting the prompt loop
    question: Option<String>,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// JSON schema export to use instead of introspecting the database
    #[arg(short, long)]
    schema: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::load(Some(args.config.as_path()))?;
    if let Some(schema) = args.schema {
        config.rag.schema_file = Some(schema);
    }
    sql_rag::logging::init(&config.logging)?;

    info!("Initializing SQL RAG...");
    let engine = DatabaseEngine::connect(&config.database)
        .await
        .context("Failed to set up the database engine")?;
    if !engine.validate_connection().await {
        warn!("Database connection check failed; queries will likely error");
    }

    let elements = match &config.rag.schema_file {
        Some(path) => JsonSchemaSource::new(path).load_schema().await?,
        None => engine.load_schema().await?,
    };
    let snapshot = SchemaSnapshot::from_elements(&elements);
    info!(
        "Schema loaded: {} tables, {} elements",
        snapshot.table_count(),
        elements.len()
    );

    let retriever = SchemaContextProvider::new(&elements, config.rag.top_k);
    let validator = SqlValidator::with_config(
        Arc::new(snapshot),
        GuardConfig::from(&config.pipeline),
    );
    let generator = OllamaClient::new(config.llm.clone())?;
    match generator.list_models().await {
        Ok(models) if !models.iter().any(|m| m == generator.model()) => {
            warn!("Model {} is not installed on the Ollama server", generator.model())
        }
        Ok(_) => {}
        Err(e) => warn!("Could not reach Ollama: {}", e),
    }

    let dialect = engine.dialect();
    let orchestrator = Orchestrator::new(
        Arc::new(retriever),
        Arc::new(generator),
        Arc::new(engine),
        validator,
        dialect,
        config.pipeline.clone(),
    );

    if let Some(question) = args.question {
        let result = orchestrator.process(&question, &[]).await;
        print_result(&result);
        return Ok(());
    }

    println!("\nInitialization Complete!");
    println!("Enter your question (or 'exit' to quit):");

    let mut history: Vec<ChatTurn> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }
        if question.is_empty() {
            continue;
        }

        println!("Processing...");
        let result = orchestrator.process(question, &history).await;
        print_result(&result);

        history.push(ChatTurn::user(question));
        history.push(ChatTurn::assistant(
            result.generated_sql.clone().unwrap_or_default(),
        ));
    }

    println!("\nGoodbye!");
    Ok(())
}

fn print_result(result: &PipelineResult) {
    println!("\n--- Result ---");
    match result.status {
        PipelineStatus::Success => {
            if let Some(data) = &result.data {
                println!("Row Count: {}", data.row_count);
                println!("Columns: {}", data.columns.join(", "));
                println!("Rows:");
                for row in &data.rows {
                    println!("{}", serde_json::Value::Object(row.clone()));
                }
            }
        }
        PipelineStatus::NoSqlGenerated => {
            println!("Could not generate a SQL query for this question.");
        }
        PipelineStatus::Error => {
            println!("Error: {}", result.error.as_deref().unwrap_or("unknown error"));
        }
    }

    println!(
        "\nGenerated SQL: {}",
        result.generated_sql.as_deref().unwrap_or("(none)")
    );
    println!("\nSteps:");
    for step in &result.steps {
        match &step.error {
            Some(error) => println!("- {}: {}ms ({})", step.name, step.duration_ms, error),
            None => println!("- {}: {}ms", step.name, step.duration_ms),
        }
    }
    println!("Total: {}ms over {} attempt(s)", result.total_duration_ms, result.attempts);
}
