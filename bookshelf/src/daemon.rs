use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bookshelf_core::{BrokerError, ConnectionSupervisor, Daemon};
use bookshelf_tokio_postgres::{PgConnector, PgSession};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::book::{BookRowAdapter, BookServiceImpl, PgBookRepository};
use crate::http::{self, AppState};
use crate::AppConfig;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to bind API port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server failed")]
    Server(#[source] std::io::Error),
    #[error("HTTP server task ended abnormally")]
    Join(#[from] tokio::task::JoinError),
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// The `book` service: the connection supervisor plus the HTTP API on top of it.
pub struct BookDaemon {
    config: AppConfig,
    supervisor: ConnectionSupervisor<PgConnector>,
    server: Option<RunningServer>,
}

impl BookDaemon {
    pub fn new(config: AppConfig) -> Self {
        let connector = PgConnector::new(config.database.clone());
        let supervisor = ConnectionSupervisor::new(connector, config.reconnect.clone());
        Self {
            config,
            supervisor,
            server: None,
        }
    }

    /// Address the API is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }
}

#[async_trait]
impl Daemon for BookDaemon {
    type Error = DaemonError;

    fn name(&self) -> &str {
        "book"
    }

    async fn start(&mut self) -> Result<(), DaemonError> {
        if self.server.is_some() {
            return Ok(());
        }
        let handle = self.supervisor.start().await?;
        let repo = PgBookRepository::new(handle.clone(), BookRowAdapter);
        let state = AppState {
            books: Arc::new(BookServiceImpl::<_, PgSession>::new(repo)),
            db_state: handle.subscribe(),
        };

        let port = self.config.api_port;
        let listener = match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
            Ok(listener) => listener,
            Err(source) => {
                self.supervisor.stop().await?;
                return Err(DaemonError::Bind { port, source });
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.supervisor.stop().await?;
                return Err(DaemonError::Server(e));
            }
        };

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(http::serve(listener, state, async move {
            let _ = signal.await;
        }));
        info!(%addr, "API service listening");
        self.server = Some(RunningServer {
            addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        let served = match self.server.take() {
            Some(server) => {
                if server.shutdown.send(()).is_err() {
                    warn!("HTTP server already gone");
                }
                server.task.await
            }
            None => Ok(Ok(())),
        };
        // Release the connection even when the server failed.
        self.supervisor.stop().await?;
        served?.map_err(DaemonError::Server)
    }
}
