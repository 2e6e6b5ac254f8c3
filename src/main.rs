//! someipd — SOME/IP routing host daemon.
//!
//! Loads the configuration, binds the configured endpoints, starts
//! service discovery, and routes until SIGINT/SIGTERM.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal
//! endpoint/bind error.

use clap::Parser;
use someip::config::{Config, DEFAULT_CONFIG_PATH, ENV_CONFIGURATION};
use someip::host::RoutingHost;
use someip::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "someipd", version, about = "SOME/IP routing host")]
struct Args {
    /// Configuration file (overrides SOMEIP_CONFIGURATION)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Act as routing host regardless of the configured election
    #[arg(long)]
    routing_host: bool,

    /// Application name this daemon runs as (for client-id lookup)
    #[arg(short, long)]
    name: Option<String>,
}

fn config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    if let Ok(path) = std::env::var(ENV_CONFIGURATION) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

fn init_logging(config: &Config) {
    let logging = config.logging();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("someip={}", logging.level)));

    if logging.file {
        if let Some(path) = &logging.file_path {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::sync::Arc::new(file))
                        .with_ansi(false)
                        .init();
                    return;
                }
                Err(e) => eprintln!("cannot open log file {path}: {e}, logging to console"),
            }
        }
    }
    if logging.dlt {
        eprintln!("dlt logging not supported, using console");
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let path = config_path(&args);
    let config = match Config::load_file(&path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("someipd: {e}");
            return ExitCode::from(1);
        }
    };
    init_logging(&config);

    let name = args.name.clone().unwrap_or_else(|| config.routing_host().to_owned());
    if !args.routing_host && !name.is_empty() && !config.is_routing_host(&name) {
        error!(app = %name, "not elected as routing host");
        return ExitCode::from(1);
    }
    let client = config.client_id(&name).unwrap_or(0x0001);
    info!(config = %path.display(), app = %name,
        client = format_args!("{client:#06x}"), "starting");

    let (host, handle) = match RoutingHost::start(Arc::clone(&config)).await {
        Ok(started) => started,
        Err(e @ Error::Bind { .. }) => {
            error!(error = %e, "fatal bind error");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };
    host.offer_configured(client).await;

    let host_task = tokio::spawn(host.run());

    shutdown_signal().await;
    info!("shutdown requested");
    handle.shutdown();

    match host_task.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!(error = %e, "routing host failed");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "routing host panicked");
            ExitCode::from(2)
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
