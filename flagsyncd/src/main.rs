use clap::{Args, Parser};
use flagsync::{ClientError, SyncClient};
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::{Config, LoggingConfig, MetricsConfig};

const READY_WARNING_AFTER: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "flagsyncd", about = "Keeps feature-flag targeting rules in sync")]
enum CliCommand {
    /// Synchronize until interrupted.
    Run(ConfigArgs),
    /// Load and validate the configuration, then exit.
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::CheckConfig(args) => match Config::from_file(&args.config) {
            Ok(_) => {
                println!("{}: ok", args.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", args.config.display());
                ExitCode::FAILURE
            }
        },
        CliCommand::Run(args) => {
            let config = match Config::from_file(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{}: {e}", args.config.display());
                    return ExitCode::FAILURE;
                }
            };

            let _sentry = init_logging(config.common.logging.as_ref());
            if let Err(e) = run(config) {
                tracing::error!(error = %e, "flagsyncd failed");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
    }
}

/// Installs the fmt subscriber, plus Sentry when a DSN is configured. The
/// returned guard flushes Sentry events on drop.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| EnvFilter::try_new(logging.map_or("info", |l| l.filter.as_str())).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let guard = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), RunError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(&metrics.prefix))
        .map_err(|e| RunError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| RunError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe(flagsync::metrics_defs::ALL_METRICS);
    Ok(())
}

#[tokio::main]
async fn run(config: Config) -> Result<(), RunError> {
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let client = SyncClient::new(config.sync)?;
    client.start()?;
    tracing::info!("synchronization started");

    if let Some(listener) = config.admin_listener {
        let ready_client = client.clone();
        let status_client = client.clone();
        let service = AdminService::<_, _, std::io::Error>::new(
            move || ready_client.is_ready(),
            move || {
                status_client
                    .streaming_status()
                    .map_or("STREAMING_DISABLED", |s| s.as_str())
                    .to_string()
            },
        );
        tokio::spawn(async move {
            if let Err(e) = run_http_service(&listener.host, listener.port, service).await {
                tracing::error!(error = %e, "admin listener stopped");
            }
        });
    }

    let watched = client.clone();
    tokio::spawn(async move {
        if watched.ready(READY_WARNING_AFTER).await {
            tracing::info!("rules ready");
        } else {
            tracing::warn!(
                timeout_secs = READY_WARNING_AFTER.as_secs(),
                "rules not ready yet, still synchronizing"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    client.destroy().await;
    Ok(())
}
