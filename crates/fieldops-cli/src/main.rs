use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fieldops_reports::{ReportDispatcher, ReportPipeline, ReportScheduler, SmtpMailer};
use fieldops_storage::{MemoryStore, PgStore, Store};
use fieldops_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{AppConfig, StoreBackend};

#[derive(Debug, Parser)]
#[command(name = "fieldops")]
#[command(about = "Field operations tracker: HTTP API, report scheduler and admin tasks")]
struct Cli {
    /// YAML config file; missing means built-in defaults.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and, when enabled, the report scheduler.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Run one report pipeline now (daily, weekly or monthly).
    Report { kind: String },
    /// Issue a bearer token for the API.
    Token {
        user_id: String,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldops=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            config.validate()?;
            match config.store.backend {
                StoreBackend::Postgres => serve(connect_pg(&config).await?, &config).await?,
                StoreBackend::Memory => {
                    warn!("using in-memory store; data is lost on exit");
                    serve(Arc::new(MemoryStore::new()), &config).await?
                }
            }
        }
        Commands::Migrate => {
            connect_pg(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Report { kind } => {
            config.validate_report()?;
            run_report(connect_pg(&config).await?, &config, &kind).await?;
        }
        Commands::Token { user_id, ttl_secs } => {
            if config.auth.jwt_secret.trim().is_empty() {
                anyhow::bail!("auth.jwt_secret is empty (set FIELDOPS_JWT_SECRET)");
            }
            let ttl = ttl_secs.unwrap_or(config.auth.token_ttl_secs);
            let token = fieldops_web::create_token(&config.auth.jwt_secret, &user_id, ttl)
                .context("signing token")?;
            println!("{token}");
        }
    }

    Ok(())
}

async fn connect_pg(config: &AppConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.store.postgres)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

fn build_dispatcher(config: &AppConfig) -> Result<ReportDispatcher> {
    if !config.mail_configured() {
        warn!("report mail is not configured; reports will be stored but not mailed");
        return Ok(ReportDispatcher::disabled());
    }
    let mailer = SmtpMailer::new(&config.smtp, &config.mail.from).context("building smtp mailer")?;
    Ok(ReportDispatcher::new(Arc::new(mailer), config.mail.clone()))
}

async fn serve<S: Store + 'static>(store: Arc<S>, config: &AppConfig) -> Result<()> {
    let pipeline = Arc::new(ReportPipeline::from_store(store.clone(), build_dispatcher(config)?));

    let scheduler = if config.schedule.enabled {
        let scheduler = ReportScheduler::start(pipeline.clone(), &config.schedule)
            .await
            .context("starting report scheduler")?;
        Some(scheduler)
    } else {
        info!("report scheduler disabled");
        None
    };

    let state = AppState::new(store, pipeline, config.auth.clone());
    let served = fieldops_web::serve(&config.server, state, shutdown_signal()).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await.context("stopping report scheduler")?;
    }
    served
}

async fn run_report<S: Store + 'static>(
    store: Arc<S>,
    config: &AppConfig,
    kind: &str,
) -> Result<()> {
    let pipeline = ReportPipeline::from_store(store, build_dispatcher(config)?);
    let report = pipeline
        .run_named(kind, Utc::now())
        .await
        .with_context(|| format!("running {kind} report"))?;
    println!(
        "report complete: id={} kind={} window={}..{} agents={}",
        report.id,
        report.report_type,
        report.start_date.format("%Y-%m-%d"),
        report.end_date.format("%Y-%m-%d"),
        report.cce_reports.len()
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for ctrl-c failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
