use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use justice_core::collab::{Evaluator, Reasoner};
use justice_judge::{JudgeConfig, RandomCoin};
use justice_llm::{
    EchoReasoner, HttpBackend, HttpEvaluator, HttpReasoner, LexicalEvaluator, Reliable,
};
use justice_server::{ServerConfig, ServerDeps};
use justice_store::Database;
use justice_telemetry::{init_telemetry, TelemetryConfig};

/// Case argumentation server: chat rooms and judged adversarial sessions.
#[derive(Debug, Parser)]
#[command(name = "justice", version)]
struct Cli {
    #[arg(long, env = "JUSTICE_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, env = "JUSTICE_PORT", default_value_t = 8000)]
    port: u16,

    /// SQLite file for cases and messages. Defaults to ~/.justice/database/justice.db.
    #[arg(long, env = "JUSTICE_DATABASE")]
    database: Option<PathBuf>,

    /// Base URL of the reasoning/scoring service. Offline collaborators are
    /// used when unset.
    #[arg(long, env = "JUSTICE_REASONER_URL")]
    reasoner_url: Option<String>,

    #[arg(long, env = "JUSTICE_REASONER_API_KEY", hide_env_values = true)]
    reasoner_api_key: Option<String>,

    /// Score difference at which a session closes.
    #[arg(
        long,
        env = "JUSTICE_THRESHOLD",
        default_value_t = justice_judge::config::DEFAULT_TERMINATION_THRESHOLD
    )]
    threshold: f64,

    #[arg(long, env = "JUSTICE_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    #[arg(long, env = "JUSTICE_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    idle_timeout_secs: u64,

    #[arg(long, env = "JUSTICE_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    #[arg(long, env = "JUSTICE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let home = justice_home();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        log_db_path: home.join("database").join("logs.db"),
        ..Default::default()
    });

    let db_path = cli
        .database
        .clone()
        .unwrap_or_else(|| home.join("database").join("justice.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let (reasoner, evaluator) = collaborators(&cli)?;

    let config = ServerConfig {
        bind_addr: cli.bind.clone(),
        port: cli.port,
        idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
        judge: JudgeConfig {
            termination_threshold: cli.threshold,
            call_timeout: Duration::from_secs(cli.call_timeout_secs),
        },
        ..Default::default()
    };
    let deps = ServerDeps {
        db,
        reasoner,
        evaluator,
        coin: Arc::new(RandomCoin),
        telemetry: Some(Arc::new(telemetry)),
    };

    let handle = justice_server::start(config, deps)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "justice server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn collaborators(cli: &Cli) -> anyhow::Result<(Arc<dyn Reasoner>, Arc<dyn Evaluator>)> {
    match &cli.reasoner_url {
        Some(url) => {
            let key = cli.reasoner_api_key.clone().map(SecretString::from);
            let backend = HttpBackend::new(url.as_str(), key)
                .context("failed to build reasoning service client")?;
            tracing::info!(url = %backend.base_url(), "using remote reasoning service");
            Ok((
                Arc::new(Reliable::with_defaults(HttpReasoner::new(backend.clone()))),
                Arc::new(Reliable::with_defaults(HttpEvaluator::new(backend))),
            ))
        }
        None => {
            tracing::warn!("no reasoning service configured, using offline collaborators");
            Ok((
                Arc::new(EchoReasoner),
                Arc::new(LexicalEvaluator::default()),
            ))
        }
    }
}

fn justice_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".justice")
}
