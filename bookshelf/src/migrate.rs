//! Embedded schema migrations, applied by `bookshelf book db-migrate`.

use anyhow::{Context, Result};
use bookshelf_tokio_postgres::PgConfig;
use tokio_postgres::NoTls;
use tracing::{info, warn};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Apply every pending migration over a dedicated connection, outside the supervisor.
pub async fn run(config: &PgConfig) -> Result<()> {
    config.validate()?;
    let (mut client, connection) = config
        .to_pg_config()
        .connect(NoTls)
        .await
        .with_context(|| format!("connecting to {}", config.redacted()))?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "migration connection error");
        }
    });

    let report = embedded::migrations::runner()
        .run_async(&mut client)
        .await
        .context("applying migrations")?;
    let applied = report.applied_migrations();
    if applied.is_empty() {
        info!("schema is up to date");
    }
    for migration in applied {
        info!(%migration, "applied migration");
    }

    drop(client);
    let _ = driver.await;
    Ok(())
}
