//! kestrel-tftpd: standalone TFTP server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kestrel_tftp::config::{self, LogFormat, TftpConfig};
use kestrel_tftp::TftpServer;

#[derive(Parser, Debug)]
#[command(name = "kestrel-tftpd", about = "Concurrent TFTP server")]
struct Cli {
    /// Root directory to serve files from
    root_dir: Option<PathBuf>,

    /// UDP port to listen on (default 69)
    port: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a default configuration file to --config and exit
    #[arg(long, requires = "config")]
    init_config: bool,

    /// Bind address (overrides the port argument)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level filter (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Per-transfer payload cap in bytes
    #[arg(long)]
    max_transfer_size: Option<usize>,

    /// Per-block timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Session worker count (0 = hardware parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Disable the path-safety containment check (not recommended)
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) if path.exists() => config::load_config(path)?,
        _ => TftpConfig::default(),
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(port) = cli.port {
        config.bind_addr.set_port(port);
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(file) = cli.log_file {
        config.logging.file = Some(file);
    }
    if let Some(size) = cli.max_transfer_size {
        config.max_transfer_size = size;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_seconds = timeout;
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if cli.insecure {
        config.secure_mode = false;
    }

    if cli.init_config {
        let path = cli.config.context("--init-config requires --config")?;
        config::write_config(&path, &config)?;
        println!("Wrote config to {}", path.display());
        return Ok(());
    }

    config::validate_config(&config).context("invalid configuration")?;

    let _log_guard = init_logging(&config)?;

    let mut server = TftpServer::from_config(&config);
    server.start().await.context("failed to start TFTP server")?;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    server.stop().await;

    Ok(())
}

fn init_logging(
    config: &TftpConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::new(config.logging.level.clone());

    if let Some(ref log_file) = config.logging.file {
        let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .context("log file must include a file name")?;
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
        }
        Ok(Some(guard))
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
        Ok(None)
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
