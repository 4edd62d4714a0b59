//! The book domain: entity, service and the Postgres-backed repository.

mod model;
mod service;

pub use model::{Book, BookRowAdapter};
pub use service::{BookService, BookServiceImpl};

use bookshelf_core::BrokerError;

/// Repository over the supervised Postgres session.
pub type PgBookRepository = bookshelf_tokio_postgres::PgRepository<Book, BookRowAdapter>;

#[derive(Debug, thiserror::Error)]
pub enum BookError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("book #{0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl BookError {
    /// The display message together with the underlying driver error, if any.
    pub fn describe(&self) -> String {
        match self {
            BookError::Broker(e) => e.describe(),
            other => other.to_string(),
        }
    }
}
