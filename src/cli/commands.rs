use crate::cli::args::{Args, Command, OutputFormat, RemoteArgs, ServeArgs};
use crate::cli::output::{ConsoleWriter, OutputWriter};
use crate::core::server::{Server, ServerOptions};
use crate::domain::config::SerialdConfig;
use crate::infrastructure::config::ConfigManager;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::net::{run_remote, Listener};
use crate::infrastructure::serial::{SerialDriver, SystemSerialDriver};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

/// Execute CLI command
pub async fn execute_command(args: Args) -> Result<()> {
    let config = ConfigManager::new(args.config.clone())
        .load_config()
        .context("Failed to load configuration")?;

    init_logging(args.log_level(&config.logging.level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match args.command {
        None => serve(ServeArgs::default(), &config, args.quiet).await,
        Some(Command::Serve(serve_args)) => serve(serve_args, &config, args.quiet).await,
        Some(Command::Remote(remote_args)) => remote(remote_args, &config).await,
        Some(Command::Ports { output }) => ports(&config, output, args.quiet),
    }
}

async fn serve(args: ServeArgs, config: &SerialdConfig, quiet: bool) -> Result<()> {
    let writer = ConsoleWriter::new(OutputFormat::Text, quiet);
    let addr = args.addr.unwrap_or_else(|| config.server.addr.clone());

    let driver = SystemSerialDriver::new(config.server.read_timeout());
    let server = Server::new(Arc::new(driver), ServerOptions::from(&config.server));
    let listener = Listener::bind(&addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    writer.write_message(&format!("Listening on {}", listener.local_addr()))?;

    let handle = server.start(listener);
    shutdown_signal().await;
    info!("shutting down");

    let result = server.close().await;
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            error!(error = %e, "accept loop failed");
        }
    }
    result.context("Failed to close sessions")?;
    Ok(())
}

async fn remote(args: RemoteArgs, config: &SerialdConfig) -> Result<()> {
    let addr = args.addr.unwrap_or_else(|| config.server.addr.clone());
    run_remote(&addr, &args.command, args.exit)
        .await
        .with_context(|| format!("Remote session with {} failed", addr))
}

fn ports(config: &SerialdConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    let driver = SystemSerialDriver::new(config.server.read_timeout());
    let ports = driver.list_paths().context("Failed to list serial ports")?;
    ConsoleWriter::new(format, quiet).write_ports(&ports)?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Signal interrupt"),
        _ = terminate => info!("Signal terminate"),
    }
}
