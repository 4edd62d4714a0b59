#![forbid(unsafe_code)]
//! Core of the bookshelf service: the supervised connection broker, request-scoped
//! transactions and the backend-agnostic repository traits.
//! This crate is database-agnostic and should not contain any backend-specific logic.

// Re-export for downstream repository implementations.
pub use async_trait::async_trait;

pub mod daemon;
pub mod supervisor;
pub mod transactions;

pub use daemon::{run_daemon, Daemon};
pub use supervisor::{
    BackoffStrategy, ConnectionHandle, ConnectionSupervisor, Connector, LossMonitor,
    ReconnectPolicy, Session, SessionLease, SupervisorState,
};
pub use transactions::{
    Executor, FinalizeAction, Isolation, Outcome, RequestContext, ScopeState, ScopeTicket,
    TransactionDefinition,
};

/// Boxed error used as the `source` of every [`BrokerError`] variant that wraps a driver error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Compile-time table metadata used by the SQL builder.
pub trait Fetchable {
    const TABLE: &'static str;
    const SELECT_COLUMNS: &'static [&'static str];
}

/// A backend-agnostic representation of a database parameter value.
/// Entities hand these to backend adapters, which bind them as statement parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Null,
}

/// Trait for entities that have an identifiable key.
pub trait Identifiable {
    /// The type of the primary key (e.g., `i64`).
    type Key;

    /// The name of the primary key column in the database.
    const ID_COLUMN: &'static str;

    /// Returns a copy of the entity's ID, if it has one.
    fn id(&self) -> Option<Self::Key>;
}

/// Trait for types whose fields can be extracted for an INSERT statement.
pub trait Insertable {
    /// The columns to be used in an INSERT statement, excluding auto-generated keys.
    const INSERT_COLUMNS: &'static [&'static str];

    /// The values of the fields corresponding to `INSERT_COLUMNS`.
    fn insert_values(&self) -> Vec<ParamValue>;
}

/// Trait for types whose fields can be extracted for an UPDATE statement.
pub trait Updatable {
    /// The columns to be used in an UPDATE statement's SET clause.
    const UPDATE_COLUMNS: &'static [&'static str];

    /// Columns stamped with the database clock on every update (e.g. `updated_at`).
    const TOUCH_COLUMNS: &'static [&'static str] = &[];

    /// The values of the fields corresponding to `UPDATE_COLUMNS`.
    fn update_values(&self) -> Vec<ParamValue>;
}

/// Error type shared by the supervisor, transaction scopes and repositories.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Missing or invalid connection parameters. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The initial handshake failed.
    #[error("connection error")]
    Connection {
        #[source]
        source: BoxError,
    },
    /// No session is installed (the supervisor is reconnecting) or the session died mid-statement.
    #[error("connection unavailable")]
    ConnectionUnavailable {
        #[source]
        source: Option<BoxError>,
    },
    /// `BEGIN` failed against the current session.
    #[error("failed to open transaction")]
    TransactionOpen {
        #[source]
        source: BoxError,
    },
    /// `COMMIT` or `ROLLBACK` failed; the transaction's effects are unknown to the caller.
    #[error("failed to {action} transaction")]
    TransactionFinalize {
        action: FinalizeAction,
        #[source]
        source: BoxError,
    },
    /// The database rejected a statement (constraint violation, syntax error, ...).
    #[error("statement error")]
    Statement {
        #[source]
        source: BoxError,
    },
    /// The entity was not found.
    #[error("entity not found")]
    NotFound,
    /// Error while mapping a backend row into an entity.
    #[error("mapping error")]
    Mapping {
        #[source]
        source: BoxError,
    },
    /// A transaction scope was released out of order or after it closed.
    #[error("transaction scope misuse: {0}")]
    ScopeMisuse(&'static str),
}

impl BrokerError {
    pub fn connection<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::Connection {
            source: Box::new(e),
        }
    }

    pub fn unavailable() -> Self {
        BrokerError::ConnectionUnavailable { source: None }
    }

    pub fn unavailable_with<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::ConnectionUnavailable {
            source: Some(Box::new(e)),
        }
    }

    pub fn transaction_open<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::TransactionOpen {
            source: Box::new(e),
        }
    }

    pub fn finalize<E>(action: FinalizeAction, e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::TransactionFinalize {
            action,
            source: Box::new(e),
        }
    }

    /// Wrap a driver error raised by a statement.
    pub fn statement<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::Statement {
            source: Box::new(e),
        }
    }

    /// Wrap a row-mapping error.
    pub fn mapping<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BrokerError::Mapping {
            source: Box::new(e),
        }
    }

    /// True for errors caused by a missing or dead session.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::ConnectionUnavailable { .. })
    }

    /// The display message followed by every source in the chain, separated by `: `.
    pub fn describe(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(s) = source {
            out.push_str(": ");
            out.push_str(&s.to_string());
            source = s.source();
        }
        out
    }
}

/// Convenience alias for results returned by broker and repository methods.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Minimal asynchronous repository interface for an entity `T` stored through sessions of type `S`.
///
/// Every method receives the caller's [`RequestContext`]; when the context carries a transaction
/// scope the statement runs inside it, otherwise it runs in auto-commit mode.
#[async_trait]
pub trait Repository<T, S>: Send + Sync
where
    T: Identifiable + Send + Sync + 'static,
    T::Key: Send + Sync,
    S: Session,
{
    /// Fetch every entity, ordered by primary key.
    async fn list(&self, ctx: &mut RequestContext<S>) -> BrokerResult<Vec<T>>;

    /// Fetch an entity by its primary key. Returns Ok(None) if not found.
    async fn find_by_id(&self, ctx: &mut RequestContext<S>, id: &T::Key)
        -> BrokerResult<Option<T>>;

    /// Insert a new entity and return it with its database-generated key.
    async fn insert(&self, ctx: &mut RequestContext<S>, entity: &T) -> BrokerResult<T>;

    /// Update an existing entity. Fails with [`BrokerError::NotFound`] if no row matched.
    async fn update(&self, ctx: &mut RequestContext<S>, entity: &T) -> BrokerResult<T>;

    /// Delete an entity by key. Returns true if a row was affected.
    async fn delete_by_id(&self, ctx: &mut RequestContext<S>, id: &T::Key) -> BrokerResult<bool>;
}

/// A tiny adapter for mapping a backend-specific row type into an entity `T`.
#[allow(clippy::wrong_self_convention)]
pub trait RowAdapter<T> {
    type Row;
    fn from_row(&self, row: &Self::Row) -> BrokerResult<T>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_display_messages() {
        let e1 = BrokerError::NotFound;
        assert_eq!(format!("{}", e1), "entity not found");

        let e2 = BrokerError::mapping(std::io::Error::new(std::io::ErrorKind::Other, "bad row"));
        assert_eq!(format!("{}", e2), "mapping error");

        let e3 = BrokerError::finalize(
            FinalizeAction::Rollback,
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        );
        assert_eq!(format!("{}", e3), "failed to rollback transaction");
    }

    #[test]
    fn describe_walks_the_source_chain() {
        let e = BrokerError::statement(std::io::Error::new(
            std::io::ErrorKind::Other,
            "duplicate key value violates unique constraint",
        ));
        assert_eq!(
            e.describe(),
            "statement error: duplicate key value violates unique constraint"
        );
        assert_eq!(BrokerError::unavailable().describe(), "connection unavailable");
    }

    #[test]
    fn only_unavailable_counts_as_connection_loss() {
        assert!(BrokerError::unavailable().is_connection_loss());
        assert!(BrokerError::unavailable_with(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "closed"
        ))
        .is_connection_loss());
        assert!(!BrokerError::NotFound.is_connection_loss());
        assert!(!BrokerError::Configuration("DB_HOST".into()).is_connection_loss());
    }

    // A tiny entity and RowAdapter example to exercise trait wiring
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct MiniEntity {
        id: Option<i64>,
    }

    impl Identifiable for MiniEntity {
        type Key = i64;
        const ID_COLUMN: &'static str = "id";
        fn id(&self) -> Option<Self::Key> {
            self.id
        }
    }

    impl Updatable for MiniEntity {
        const UPDATE_COLUMNS: &'static [&'static str] = &["id"];
        fn update_values(&self) -> Vec<ParamValue> {
            vec![self.id.map(ParamValue::I64).unwrap_or(ParamValue::Null)]
        }
    }

    struct MiniAdapter;
    impl RowAdapter<MiniEntity> for MiniAdapter {
        type Row = i64; // pretend a row is just an i64 id
        fn from_row(&self, row: &Self::Row) -> BrokerResult<MiniEntity> {
            Ok(MiniEntity { id: Some(*row) })
        }
    }

    #[test]
    fn row_adapter_from_row_works() {
        let a = MiniAdapter;
        let ent = a.from_row(&7).unwrap();
        assert_eq!(ent, MiniEntity { id: Some(7) });
        assert_eq!(ent.id(), Some(7));
    }

    #[test]
    fn touch_columns_default_to_empty() {
        assert!(MiniEntity::TOUCH_COLUMNS.is_empty());
        assert_eq!(
            MiniEntity { id: None }.update_values(),
            vec![ParamValue::Null]
        );
    }
}
