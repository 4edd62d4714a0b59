//! Request-scoped transactions.
//!
//! A service operation calls [`RequestContext::begin`] before touching any repository and
//! [`RequestContext::release`] (or [`RequestContext::finish`]) afterwards. Repositories call
//! [`RequestContext::use_connection`] for every statement. The first such call inside a scope
//! leases the current session and issues `BEGIN`; later calls, including those from nested
//! `begin`s, reuse the same transaction. The outermost release commits or rolls back.
//!
//! ```ignore
//! let mut ctx = RequestContext::new();
//! let ticket = ctx.begin();
//! let result = repo.insert(&mut ctx, &book).await;
//! let book = ctx.finish(ticket, result).await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::supervisor::{ConnectionHandle, Session, SessionLease};
use crate::{BrokerError, BrokerResult};

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction definition describing desired semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub isolation: Isolation,
    pub read_only: bool,
    /// Applied as `SET LOCAL statement_timeout`.
    pub timeout: Option<Duration>,
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self {
            isolation: Isolation::Default,
            read_only: false,
            timeout: None,
        }
    }
}

fn isolation_level(isolation: Isolation) -> Option<&'static str> {
    match isolation {
        Isolation::Default => None,
        Isolation::ReadCommitted => Some("READ COMMITTED"),
        Isolation::RepeatableRead => Some("REPEATABLE READ"),
        Isolation::Serializable => Some("SERIALIZABLE"),
    }
}

/// The statement batch that opens a transaction for `def`.
pub fn begin_sql(def: &TransactionDefinition) -> String {
    let mut sql = String::from("BEGIN");
    if let Some(level) = isolation_level(def.isolation) {
        sql.push_str(" ISOLATION LEVEL ");
        sql.push_str(level);
    }
    if def.read_only {
        sql.push_str(" READ ONLY");
    }
    if let Some(timeout) = def.timeout {
        sql.push_str(&format!(
            "; SET LOCAL statement_timeout = {}",
            timeout.as_millis()
        ));
    }
    sql
}

/// The success/failure signal a service operation hands to [`RequestContext::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unset,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Unopened,
    /// `BEGIN` has been issued and not yet acknowledged.
    Opening,
    Opened,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeAction {
    Commit,
    Rollback,
}

impl FinalizeAction {
    fn sql(self) -> &'static str {
        match self {
            FinalizeAction::Commit => "COMMIT",
            FinalizeAction::Rollback => "ROLLBACK",
        }
    }

    fn terminal_state(self) -> ScopeState {
        match self {
            FinalizeAction::Commit => ScopeState::Committed,
            FinalizeAction::Rollback => ScopeState::RolledBack,
        }
    }
}

impl fmt::Display for FinalizeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FinalizeAction::Commit => "commit",
            FinalizeAction::Rollback => "rollback",
        })
    }
}

/// Proof of one `begin`. Must be handed back to `release` in LIFO order.
#[must_use = "a scope ticket must be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct ScopeTicket {
    scope: u64,
    depth: usize,
}

/// The unit of work of one service operation.
pub struct TransactionScope<S: Session> {
    id: u64,
    definition: TransactionDefinition,
    state: ScopeState,
    outcome: Outcome,
    error: Option<String>,
    depth: usize,
    opened: usize,
    lease: Option<SessionLease<S>>,
    handle: Option<ConnectionHandle<S>>,
}

impl<S: Session> TransactionScope<S> {
    fn new(definition: TransactionDefinition) -> Self {
        Self {
            id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            definition,
            state: ScopeState::Unopened,
            outcome: Outcome::Unset,
            error: None,
            depth: 1,
            opened: 0,
            lease: None,
            handle: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of physical transactions this scope opened. Never more than one.
    pub fn opened(&self) -> usize {
        self.opened
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    async fn open(&mut self, handle: &ConnectionHandle<S>, cid: &str) -> BrokerResult<()> {
        // The lease lives on the scope before `BEGIN` is sent, so a cancelled open still rolls
        // back on drop.
        self.lease = Some(handle.lease().await?);
        self.handle = Some(handle.clone());
        self.state = ScopeState::Opening;

        let sql = begin_sql(&self.definition);
        let result = match &self.lease {
            Some(lease) => lease.batch_execute(&sql).await,
            None => return Err(BrokerError::ScopeMisuse("opening scope has no session")),
        };
        if let Err(e) = result {
            if S::is_disconnect(&e) {
                handle.report_loss(self.generation(), e.to_string());
            } else if let Some(lease) = &self.lease {
                // A partially applied batch leaves the session inside an aborted transaction.
                let _ = lease.batch_execute("ROLLBACK").await;
            }
            self.lease = None;
            self.state = ScopeState::Unopened;
            warn!(cid, scope = self.id, error = %e, "failed to open transaction");
            return Err(BrokerError::transaction_open(e));
        }
        debug!(cid, scope = self.id, generation = self.generation(), "transaction opened");
        self.opened += 1;
        self.state = ScopeState::Opened;
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.lease.as_ref().map_or(0, |lease| lease.generation())
    }

    async fn finalize(mut self, cid: &str) -> BrokerResult<ScopeState> {
        let action = if self.outcome == Outcome::Failed || self.error.is_some() {
            FinalizeAction::Rollback
        } else {
            FinalizeAction::Commit
        };
        // The lease stays on `self` until the server answers; dropping this future mid-way
        // leaves `Drop` to roll back.
        let result = match &self.lease {
            Some(lease) => lease.batch_execute(action.sql()).await,
            None => {
                self.state = ScopeState::Committed;
                debug!(cid, scope = self.id, "closing unopened scope as a no-op commit");
                return Ok(self.state);
            }
        };
        let generation = self.generation();
        drop(self.lease.take());

        match result {
            Ok(()) => {
                self.state = action.terminal_state();
                debug!(cid, scope = self.id, %action, "transaction finalized");
                Ok(self.state)
            }
            Err(e) => {
                if S::is_disconnect(&e) {
                    if let Some(handle) = &self.handle {
                        handle.report_loss(generation, e.to_string());
                    }
                }
                self.state = ScopeState::RolledBack;
                error!(
                    cid,
                    scope = self.id,
                    %action,
                    error = %e,
                    operation_error = self.error.as_deref().unwrap_or("none"),
                    "failed to finalize transaction"
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("broker_finalize_failures_total", 1, "action" => action.to_string());
                Err(BrokerError::finalize(action, e))
            }
        }
    }
}

impl<S: Session> Drop for TransactionScope<S> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        warn!(
            scope = self.id,
            state = ?self.state,
            "transaction scope dropped without release; rolling back"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let scope = self.id;
                let handle = self.handle.clone();
                runtime.spawn(async move {
                    if let Err(e) = lease.batch_execute("ROLLBACK").await {
                        error!(scope, error = %e, "rollback of abandoned scope failed");
                        // The session may still be inside the transaction.
                        if let Some(handle) = handle {
                            handle.report_loss(lease.generation(), e.to_string());
                        }
                    }
                });
            }
            Err(_) => {
                // No runtime to roll back on; recycle the session instead.
                if let Some(handle) = &self.handle {
                    handle.report_loss(lease.generation(), "transaction scope abandoned");
                }
            }
        }
    }
}

struct ScopeFlags<'a> {
    outcome: &'a mut Outcome,
    error: &'a mut Option<String>,
}

enum LeaseRef<'a, S> {
    Borrowed(&'a SessionLease<S>),
    Owned(SessionLease<S>),
}

/// What a repository runs its statements on: the scope's open transaction, or a per-statement
/// lease of the current session when the context carries no scope.
pub struct Executor<'a, S: Session> {
    lease: LeaseRef<'a, S>,
    scope: Option<ScopeFlags<'a>>,
    handle: &'a ConnectionHandle<S>,
}

impl<'a, S: Session> Executor<'a, S> {
    fn lease(&self) -> &SessionLease<S> {
        match &self.lease {
            LeaseRef::Borrowed(lease) => lease,
            LeaseRef::Owned(lease) => lease,
        }
    }

    pub fn session(&self) -> &S {
        self.lease()
    }

    pub fn generation(&self) -> u64 {
        self.lease().generation()
    }

    pub fn in_transaction(&self) -> bool {
        self.scope.is_some()
    }

    /// Record a failed statement: the scope will roll back, and a lost session is reported to
    /// the supervisor.
    pub fn record(&mut self, err: &BrokerError) {
        if err.is_connection_loss() {
            self.handle.report_loss(self.generation(), err.describe());
        }
        if let Some(flags) = self.scope.as_mut() {
            *flags.outcome = Outcome::Failed;
            if flags.error.is_none() {
                *flags.error = Some(err.describe());
            }
        }
    }

    /// Classify and record a driver error.
    pub fn fail(&mut self, err: S::Error) -> BrokerError {
        let err = if S::is_disconnect(&err) {
            BrokerError::unavailable_with(err)
        } else {
            BrokerError::statement(err)
        };
        self.record(&err);
        err
    }

    /// Pass `result` through, recording it if it is an error.
    pub fn observe<T>(&mut self, result: BrokerResult<T>) -> BrokerResult<T> {
        if let Err(e) = &result {
            self.record(e);
        }
        result
    }
}

/// Per-request state passed explicitly through the service and repository layers.
pub struct RequestContext<S: Session> {
    cid: String,
    scope: Option<TransactionScope<S>>,
}

impl<S: Session> Default for RequestContext<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session> RequestContext<S> {
    /// A context with a generated correlation id.
    pub fn new() -> Self {
        Self::with_cid(format!(
            "req-{}",
            NEXT_REQUEST.fetch_add(1, Ordering::Relaxed)
        ))
    }

    pub fn with_cid(cid: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            scope: None,
        }
    }

    /// Correlation id used in every log line of this request.
    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("request", cid = %self.cid)
    }

    pub fn scope(&self) -> Option<&TransactionScope<S>> {
        self.scope.as_ref()
    }

    /// Begin a scope with the default definition, or join the one already carried.
    pub fn begin(&mut self) -> ScopeTicket {
        self.begin_with(TransactionDefinition::default())
    }

    /// Begin a scope with `definition`. When a scope is already carried it is joined and
    /// `definition` is ignored.
    pub fn begin_with(&mut self, definition: TransactionDefinition) -> ScopeTicket {
        match self.scope.as_mut() {
            Some(scope) => {
                scope.depth += 1;
                debug!(cid = %self.cid, scope = scope.id, depth = scope.depth, "joining transaction scope");
                ScopeTicket {
                    scope: scope.id,
                    depth: scope.depth,
                }
            }
            None => {
                let scope = TransactionScope::new(definition);
                debug!(cid = %self.cid, scope = scope.id, "transaction scope created");
                let ticket = ScopeTicket {
                    scope: scope.id,
                    depth: scope.depth,
                };
                self.scope = Some(scope);
                ticket
            }
        }
    }

    /// Bind the next statement(s) to this context. Opens the scope's transaction on first use.
    pub async fn use_connection<'a>(
        &'a mut self,
        handle: &'a ConnectionHandle<S>,
    ) -> BrokerResult<Executor<'a, S>> {
        let Some(scope) = self.scope.as_mut() else {
            let lease = handle.lease().await?;
            return Ok(Executor {
                lease: LeaseRef::Owned(lease),
                scope: None,
                handle,
            });
        };
        if scope.lease.is_none() {
            scope.open(handle, &self.cid).await?;
        }
        let TransactionScope {
            lease: Some(lease),
            outcome,
            error,
            ..
        } = scope
        else {
            return Err(BrokerError::ScopeMisuse("opened scope has no session"));
        };
        Ok(Executor {
            lease: LeaseRef::Borrowed(lease),
            scope: Some(ScopeFlags { outcome, error }),
            handle,
        })
    }

    /// Record that the operation failed. The scope will roll back on release.
    pub fn set_error(&mut self, err: impl fmt::Display) {
        match self.scope.as_mut() {
            Some(scope) => {
                scope.outcome = Outcome::Failed;
                if scope.error.is_none() {
                    scope.error = Some(err.to_string());
                }
            }
            None => debug!(cid = %self.cid, error = %err, "error recorded outside a transaction scope"),
        }
    }

    /// The first error recorded in the carried scope.
    pub fn error(&self) -> Option<&str> {
        self.scope.as_ref().and_then(|scope| scope.error.as_deref())
    }

    /// Hand back `ticket`. Inner releases only unwind the nesting; the outermost one commits
    /// unless the outcome or a recorded error says otherwise.
    pub async fn release(
        &mut self,
        ticket: ScopeTicket,
        outcome: Outcome,
    ) -> BrokerResult<ScopeState> {
        let Some(scope) = self.scope.as_mut() else {
            return Err(BrokerError::ScopeMisuse(
                "release without an active transaction scope",
            ));
        };
        if scope.id != ticket.scope || scope.depth != ticket.depth {
            return Err(BrokerError::ScopeMisuse("scope released out of order"));
        }
        match outcome {
            Outcome::Failed => scope.outcome = Outcome::Failed,
            Outcome::Success if scope.outcome == Outcome::Unset => {
                scope.outcome = Outcome::Success
            }
            _ => {}
        }
        if scope.depth > 1 {
            scope.depth -= 1;
            return Ok(scope.state);
        }

        match self.scope.take() {
            Some(scope) => scope.finalize(&self.cid).await,
            None => Err(BrokerError::ScopeMisuse("transaction scope vanished")),
        }
    }

    /// Release `ticket` with the outcome implied by `result`.
    ///
    /// When the operation failed its error is returned even if the rollback failed too (that
    /// failure is logged). When the operation succeeded but the commit failed, the commit error
    /// is returned.
    pub async fn finish<T>(
        &mut self,
        ticket: ScopeTicket,
        result: BrokerResult<T>,
    ) -> BrokerResult<T> {
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) => {
                self.set_error(e.describe());
                Outcome::Failed
            }
        };
        match self.release(ticket, outcome).await {
            Ok(_) => result,
            Err(finalize) => match result {
                Ok(_) => Err(finalize),
                Err(original) => {
                    warn!(
                        cid = %self.cid,
                        finalize_error = %finalize.describe(),
                        "returning the operation error; transaction finalize also failed"
                    );
                    Err(original)
                }
            },
        }
    }
}
