use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

use sb_explorer::client::RestConnector;
use sb_explorer::commands::{serve, CommandHandler};
use sb_explorer::config::AppConfig;
use sb_explorer::session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args
                .get(i + 1)
                .map(PathBuf::from)
                .context("--config flag requires a path")?;
            AppConfig::load_from(&path)?
        }
        None => AppConfig::load()?,
    };

    let _log_guard = init_logging(&config)?;
    info!(version = env!("CARGO_PKG_VERSION"), "sb-explorer starting");

    let session = Session::new(Arc::new(RestConnector::new()), config.settings);
    let mut handler = CommandHandler::new(session);

    // stdout carries responses only; logs go to stderr or the log file
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    if let Err(e) = serve(&mut handler, stdin, stdout).await {
        error!("command loop failed: {:#}", e);
        return Err(e);
    }
    info!("input closed, exiting");
    Ok(())
}

/// Log to a daily file under the config directory when `log_to_file` is
/// set, otherwise to stderr. The returned guard flushes the file writer.
fn init_logging(config: &AppConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.settings.log_to_file {
        let dir = AppConfig::config_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, "sb-explorer.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init();
        Ok(None)
    }
}
