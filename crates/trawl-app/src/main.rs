//! Trawl - per-session capture proxy controller.
//!
//! Serves the HTTP API that starts, stops and queries capture proxies, and
//! stops every proxy it launched before exiting.

use std::panic;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trawl_core::TrawlConfig;
use trawl_proxy::ProxyManager;
use trawl_server::{Server, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};

/// Crates whose logs follow `--log-level`; everything else is held at `warn`.
const LOG_TARGETS: &[&str] = &[
    "trawl",
    "trawl_core",
    "trawl_storage",
    "trawl_proxy",
    "trawl_server",
];

/// Trawl - capture proxy controller for device test sessions
#[derive(Parser, Debug)]
#[command(name = "trawl", version, about)]
struct Args {
    /// API host to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// API port to bind to
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory (overrides TRAWL_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Shared sessions directory (overrides TRAWL_SESSIONS_DIR)
    #[arg(long)]
    sessions_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Loads the environment configuration and applies flag overrides.
fn load_config(args: &Args) -> anyhow::Result<TrawlConfig> {
    let mut config = match &args.data_dir {
        // Derived paths follow the data directory unless overridden separately.
        Some(dir) => {
            let dir = dir.to_string_lossy().into_owned();
            TrawlConfig::from_lookup(|key| {
                if key == "TRAWL_DATA_DIR" {
                    Some(dir.clone())
                } else {
                    std::env::var(key).ok()
                }
            })
        }
        None => TrawlConfig::from_env(),
    };

    if let Some(dir) = &args.sessions_dir {
        config = config.with_sessions_dir(dir);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Initialize logging with file rotation.
fn init_logging(
    args: &Args,
    config: &TrawlConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { args.log_level.as_str() };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives: Vec<String> = LOG_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, log_level))
            .collect();
        EnvFilter::new(format!("{},warn", directives.join(",")))
    });

    let log_dir = config.logs_dir();
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("trawl")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown requested, stopping capture sessions");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Keep guard alive for the lifetime of the application
    let _log_guard = init_logging(&args, &config);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sessions_dir = %config.sessions_dir.display(),
        capture_bin = %config.capture_bin.display(),
        "Starting Trawl"
    );

    let manager = ProxyManager::new(config);
    let server_config = ServerConfig::default()
        .with_host(&args.host)
        .with_port(args.port);
    let server = Server::new(server_config, manager.clone())?;

    let served = server.run_until(shutdown_signal()).await;

    manager.cleanup().await;
    tracing::info!("Trawl stopped");

    served.map_err(Into::into)
}
