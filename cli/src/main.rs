//! Command line entry point for the proxy daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lanproxy_core::arp::NullArpResolver;
use lanproxy_core::{Configuration, Daemon};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Multi-interface HTTP/HTTPS forwarding proxy daemon")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "LANPROXY_CONFIG", default_value = "lanproxy.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = match Configuration::load(&args.config).await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration at {}: {err}", args.config.display());
            return Err(err.into());
        }
    };

    let _file_guard = init_logging(&config.logging);

    let mut daemon = Daemon::new(config, Arc::new(NullArpResolver));
    lanproxy_core::daemon::start_or_unwind(&mut daemon).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    daemon.stop().await;

    Ok(())
}

/// Builds the global tracing subscriber from the loaded `LoggingConfig`:
/// `RUST_LOG` wins if set, otherwise the configured level; output goes to
/// stdout, plus a rolling file appender when `logging.file` is set. Returns
/// the appender's worker guard, which must stay alive for the process's
/// lifetime for buffered file writes to flush.
fn init_logging(config: &lanproxy_core::config::LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("lanproxy.log"));
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
