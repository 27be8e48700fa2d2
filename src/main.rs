//! tarxfer - push a file or directory tree to a peer as a checksummed tar stream

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tarxfer::cli::{Args, Mode};
use tarxfer::error::ServeError;
use tarxfer::logger::{Logger, NoopLogger, TextLogger};
use tarxfer::progress::{NoProgress, ProgressFactory, TerminalProgress};
use tarxfer::sender::Sender;
use tarxfer::server::Server;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.mode()? {
        Mode::Serve {
            port,
            destination,
            log_file,
        } => server_main(port, &destination, log_file.as_deref()),
        Mode::Send {
            source,
            address,
            compress,
            show_progress,
        } => client_main(&source, &address, compress, show_progress),
    }
}

fn server_main(port: u16, destination: &Path, log_file: Option<&Path>) -> Result<()> {
    if !destination.is_dir() {
        anyhow::bail!(
            "destination is not an existing directory: {}",
            destination.display()
        );
    }
    let root = std::fs::canonicalize(destination)
        .with_context(|| format!("failed to canonicalize {}", destination.display()))?;

    // Choose logger once; NoopLogger keeps the hot path free
    let logger: Arc<dyn Logger> = match log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("cannot open log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    tracing::info!(port, destination = %root.display(), "starting in server mode");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("failed to set Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let server = Server::new(root).with_logger(logger);
    match rt.block_on(server.serve(port, cancel)) {
        Err(ServeError::Cancelled) => {
            tracing::info!("server stopped");
            Ok(())
        }
        other => other.context("server failed"),
    }
}

fn client_main(source: &Path, address: &str, compress: bool, show_progress: bool) -> Result<()> {
    let progress: Arc<dyn ProgressFactory> = if show_progress {
        Arc::new(TerminalProgress)
    } else {
        Arc::new(NoProgress)
    };

    tracing::info!(source = %source.display(), address, compress, "starting transfer");
    let summary = Sender::new(progress).send(source, address, compress)?;
    tracing::info!(files = summary.files, bytes = summary.bytes, "done!");
    Ok(())
}
