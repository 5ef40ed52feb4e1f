//! devmux daemon entry point.
//!
//! Serves the multiplexed WebSocket endpoint and the saved-device REST API.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use devmux_daemon::{Config, Directories};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// devmux daemon - track and control devices over a multiplexed WebSocket
#[derive(Parser, Debug)]
#[command(name = "devmux-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file (defaults to `config.json` in the config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Saved devices file (overrides config)
    #[arg(long, value_name = "PATH")]
    devices_file: Option<PathBuf>,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("devmux={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("devmux-daemon-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("devmux-daemon.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging();

    let dirs = Directories::new();
    let config_path = args.config.unwrap_or_else(|| dirs.config_file.clone());
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(devices_file) = args.devices_file {
        config.devices_file = Some(devices_file);
    }

    info!("Starting devmux daemon...");
    devmux_daemon::run(config, &dirs).await?;
    info!("devmux daemon stopped");
    Ok(())
}
