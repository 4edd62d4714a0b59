use std::error::Error as _;

use async_trait::async_trait;
use bookshelf_core::{BoxError, Connector, LossMonitor, Session};
use tokio::task::AbortHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::PgConfig;

/// One physical Postgres connection. The driver task runs until the server goes away or the
/// session is closed.
pub struct PgSession {
    client: Client,
    driver: AbortHandle,
}

impl PgSession {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Session for PgSession {
    type Error = tokio_postgres::Error;

    async fn batch_execute(&self, sql: &str) -> Result<(), Self::Error> {
        self.client.batch_execute(sql).await
    }

    fn is_disconnect(error: &Self::Error) -> bool {
        error.is_closed()
            || error
                .source()
                .map_or(false, |source| source.is::<std::io::Error>())
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn close(&self) {
        self.driver.abort();
    }
}

/// Opens [`PgSession`]s with a fixed configuration.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: PgConfig,
    pg: tokio_postgres::Config,
}

impl PgConnector {
    pub fn new(config: PgConfig) -> Self {
        let pg = config.to_pg_config();
        Self { config, pg }
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self, monitor: LossMonitor) -> Result<PgSession, BoxError> {
        let (client, connection) = self.pg.connect(NoTls).await?;
        let generation = monitor.generation();
        // The connection object must be spawned to process network events.
        let driver = tokio::spawn(async move {
            match connection.await {
                Ok(()) => {
                    debug!(generation, "postgres connection closed");
                    monitor.report("connection closed");
                }
                Err(e) => {
                    warn!(generation, error = %e, "postgres connection error");
                    monitor.report(e.to_string());
                }
            }
        });
        debug!(generation, target_db = %self.config.redacted(), "postgres session established");
        Ok(PgSession {
            client,
            driver: driver.abort_handle(),
        })
    }

    fn describe(&self) -> String {
        self.config.redacted()
    }
}
