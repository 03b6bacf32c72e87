//! Mailpipe - delivery pipeline entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailpipe_api::AppState;
use mailpipe_common::config::{Config, LoggingConfig};
use mailpipe_common::SystemClock;
use mailpipe_core::{build_provider, Pipeline};
use mailpipe_storage::{DatabasePool, MemoryStore, Repositories};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mailpipe")]
#[command(about = "Email delivery and automation pipeline")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve,
    /// Run every orchestrator job once and print the report as JSON
    Cron,
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging);

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Cron => run_cron(config).await,
        Commands::Migrate => migrate(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so `mailpipe cron` keeps stdout for the report
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailpipe=debug", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn connect(config: &Config) -> Result<(Repositories, Option<DatabasePool>)> {
    match config.database.backend.as_str() {
        "memory" => {
            warn!("Using the in-memory store; nothing survives a restart");
            Ok((Repositories::memory(MemoryStore::new()), None))
        }
        "postgres" => {
            let pool = DatabasePool::new(&config.database)
                .await
                .context("connecting to the database")?;
            info!("Database connection established");
            Ok((Repositories::postgres(pool.clone()), Some(pool)))
        }
        other => anyhow::bail!("Unknown database backend: {}", other),
    }
}

async fn build_pipeline(config: Config) -> Result<(Pipeline, Option<DatabasePool>)> {
    let (repos, pool) = connect(&config).await?;
    let provider = build_provider(&config.provider);
    info!(provider = provider.name(), "Provider configured");

    let pipeline = Pipeline::new(config, repos, provider, Arc::new(SystemClock))?;
    Ok((pipeline, pool))
}

async fn serve(config: Config) -> Result<ExitCode> {
    info!("Starting Mailpipe...");
    let bind_address = config.server.bind_address.clone();
    let (pipeline, pool) = build_pipeline(config).await?;

    let app = mailpipe_api::create_router(AppState::new(pipeline, pool));
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("serving HTTP")?;

    info!("Mailpipe shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn run_cron(config: Config) -> Result<ExitCode> {
    let (pipeline, _pool) = build_pipeline(config).await?;
    let report = pipeline.orchestrator().run().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_critical() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn migrate(config: Config) -> Result<ExitCode> {
    if config.database.backend != "postgres" {
        anyhow::bail!("Migrations need the postgres backend");
    }
    let pool = DatabasePool::new(&config.database).await?;
    pool.migrate().await?;
    info!("Database migrations completed");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cron_with_config() {
        let cli = Cli::parse_from(["mailpipe", "cron", "--config", "/etc/mailpipe/mailpipe.toml"]);
        assert!(matches!(cli.command, Commands::Cron));
        assert_eq!(
            cli.config,
            Some(PathBuf::from("/etc/mailpipe/mailpipe.toml"))
        );
    }

    #[tokio::test]
    async fn test_memory_backend_connects() {
        let mut config = Config::default();
        config.database.backend = "memory".into();
        let (_, pool) = connect(&config).await.unwrap();
        assert!(pool.is_none());

        config.database.backend = "sqlite".into();
        assert!(connect(&config).await.is_err());
    }
}
