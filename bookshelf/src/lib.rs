#![forbid(unsafe_code)]
//! The bookshelf service: book CRUD over HTTP, backed by a single supervised Postgres session.
//!
//! The binary (`bookshelf book`) wires [`AppConfig`] into a [`BookDaemon`]; the library half
//! exists so the HTTP layer and service can be exercised against in-memory fakes.

pub mod book;
pub mod config;
pub mod daemon;
pub mod http;
pub mod logging;
pub mod migrate;

pub use config::AppConfig;
pub use daemon::{BookDaemon, DaemonError};
