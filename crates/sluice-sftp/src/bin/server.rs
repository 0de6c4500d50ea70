//! SFTP server over stdin/stdout
//!
//! Intended to be launched as an SSH subsystem (e.g. `Subsystem sftp
//! /usr/local/bin/sluice-sftp-server --root /srv/sftp`). stdout carries the
//! protocol, so logs go to stderr or a file.
//!
//! Run with: cargo run --bin sluice-sftp-server -- --root .

use anyhow::Context;
use clap::Parser;
use sluice_sftp::{Config, LocalFsHandler, LogFormat, Session, SymlinkOrder};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory exposed to the client as "/"
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Largest accepted message in bytes
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Directory entries per READDIR response
    #[arg(long)]
    page_size: Option<usize>,

    /// Argument order of SYMLINK requests
    #[arg(long)]
    symlink_order: Option<SymlinkOrder>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Load the file (if any), then let flags override it
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(root) = self.root {
            config.root_dir = root;
        }
        if let Some(size) = self.max_message_size {
            config.session.max_message_size = size;
        }
        if let Some(page_size) = self.page_size {
            config.session.page_size = page_size;
        }
        if let Some(order) = self.symlink_order {
            config.session.symlink_order = order;
        }
        if let Some(log_format) = self.log_format {
            config.logging.format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.logging.file = Some(log_file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }

        Ok(config)
    }
}

/// Install the global subscriber; the guard must outlive the session
fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("invalid log level {:?}", config.logging.level))?;

    if let Some(log_file) = &config.logging.file {
        let directory = log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .context("log file path has no file name")?;

        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating log directory {}", directory.display()))?;

        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        match config.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init(),
        }

        return Ok(Some(guard));
    }

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    Ok(None)
}

/// Cancel `token` on Ctrl-C or SIGTERM
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(event = "signal_handler_failed", error = %e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!(event = "shutdown_requested");
        token.cancel();
    });
}

#[tokio::main]
async fn main() {
    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            std::process::exit(1);
        }
    };

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        root_dir = ?config.root_dir,
        max_message_size = config.session.max_message_size,
        page_size = config.session.page_size,
        symlink_order = ?config.session.symlink_order,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "Starting Sluice SFTP server"
    );

    if let Err(e) = config.validate() {
        error!(
            event = "configuration_validation_failed",
            error = %e,
            "Configuration validation failed"
        );
        std::process::exit(1);
    }

    let handler = match LocalFsHandler::new(&config.root_dir) {
        Ok(handler) => handler,
        Err(e) => {
            error!(event = "handler_creation_failed", error = %e);
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    let session = Session::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.session,
        handler,
    );

    if let Err(e) = session.run(token).await {
        error!(event = "session_error", error = %e, "Session ended with an error");
        std::process::exit(1);
    }

    info!(event = "server_shutdown", "SFTP server shutdown complete");
}
