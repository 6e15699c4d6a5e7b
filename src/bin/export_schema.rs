//! Export the database schema to a JSON file readable by `--schema`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sql_rag::config::AppConfig;
use sql_rag::execution::DatabaseEngine;
use sql_rag::schema::SchemaSource;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "export_schema")]
#[command(about = "Export the database schema to JSON")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Output JSON file
    #[arg(short, long, default_value = "schema_export.json")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::load(Some(args.config.as_path()))?;
    sql_rag::logging::init(&config.logging)?;

    info!("Connecting to database ({:?})...", config.database.engine);
    let engine = DatabaseEngine::connect(&config.database).await?;
    if !engine.validate_connection().await {
        bail!("Could not connect to the database");
    }

    let elements = engine.load_schema().await?;
    info!("Found {} schema elements", elements.len());

    let json = serde_json::to_string_pretty(&elements)?;
    tokio::fs::write(&args.output, json)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!("Exported {} schema elements to {}", elements.len(), args.output.display());
    Ok(())
}
