#![forbid(unsafe_code)]
//! PostgreSQL backend (tokio-postgres) for the bookshelf connection broker: the connector the
//! supervisor drives, the session it hands out, and a generic repository on top of it.

mod config;
mod repository;
mod session;

pub use config::{PgConfig, SslMode};
pub use repository::PgRepository;
pub use session::{PgConnector, PgSession};
