use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use legal_qa_service::{AppConfig, LegalAssistant, build_router, run_checks};

/// Legal question answering over a quantized, LoRA-adapted language model.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load the model and serve the HTTP API (default).
    Serve {
        /// Skip the pre-flight artifact checks.
        #[arg(long)]
        skip_check: bool,
    },
    /// Verify the inference backend and model files, then exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::from_env()?);

    match cli.command.unwrap_or(Command::Serve { skip_check: false }) {
        Command::Check => Ok(check(&config)),
        Command::Serve { skip_check } => {
            if !skip_check {
                let report = run_checks(&config);
                report.log();
                if !report.model_files_present() {
                    tracing::warn!(
                        "model files not found; the API will start but cannot answer questions"
                    );
                }
            }
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn check(config: &AppConfig) -> ExitCode {
    let report = run_checks(config);
    report.log();
    if !report.backend_available() {
        tracing::error!("inference backend unavailable");
        return ExitCode::FAILURE;
    }
    if report.model_files_present() {
        tracing::info!("all model files present");
    }
    ExitCode::SUCCESS
}

async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
    tracing::info!(?config.listen_addr, "loading model artifacts");

    let assistant = Arc::new(LegalAssistant::initialize(config.as_ref()));
    let router = build_router(config.clone(), assistant);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
