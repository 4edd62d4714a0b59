use anyhow::{Context, Result};
use bookshelf::{logging, migrate, AppConfig, BookDaemon};
use bookshelf_core::run_daemon;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "bookshelf", version, about = "Book catalogue service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the book API until interrupted
    Book {
        #[command(subcommand)]
        action: Option<BookAction>,
    },
}

#[derive(Debug, Subcommand)]
enum BookAction {
    /// Apply pending schema migrations and exit
    DbMigrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().context("invalid configuration")?;
    logging::init_tracing(&config.log_level)?;

    match cli.command {
        Command::Book {
            action: Some(BookAction::DbMigrate),
        } => migrate::run(&config.database).await,
        Command::Book { action: None } => {
            let mut daemon = BookDaemon::new(config);
            run_daemon(&mut daemon, shutdown_signal())
                .await
                .context("book service failed")?;
            info!("book service stopped");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
