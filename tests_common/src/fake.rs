//! An in-process stand-in for the Postgres backend.
//!
//! [`FakeDatabase`] keeps committed rows plus a log of every statement that reached it.
//! [`FakeSession`] buffers writes between `BEGIN` and `COMMIT`/`ROLLBACK` the way a real server
//! does, so transaction scopes can be tested without Docker. [`FakeConnector`] can refuse or hang
//! connection attempts and sever the live session on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bookshelf::book::Book;
use bookshelf_core::{BoxError, Connector, LossMonitor, Session};
use chrono::Utc;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FakeError {
    #[error("connection closed")]
    Closed,
    #[error("connection refused")]
    Refused,
    #[error("duplicate key value violates unique constraint \"books_title_author_key\"")]
    UniqueViolation,
    #[error("statement rejected: {0}")]
    Rejected(String),
}

type Rows = BTreeMap<i64, Book>;

#[derive(Default)]
struct DbState {
    committed: Rows,
    next_id: i64,
    log: Vec<String>,
    fail_on: Vec<String>,
    latency: Duration,
}

/// Shared server-side state. Clones see the same data.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<DbState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows, ordered by id.
    pub fn rows(&self) -> Vec<Book> {
        lock(&self.state).committed.values().cloned().collect()
    }

    /// Every statement that reached the database, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    /// Number of logged statements starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.state)
            .log
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// Reject every later statement starting with `prefix`.
    pub fn fail_on(&self, prefix: impl Into<String>) {
        lock(&self.state).fail_on.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).fail_on.clear();
    }

    /// Delay applied before every statement, to keep statements in flight.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }
}

struct SessionInner {
    db: FakeDatabase,
    closed: AtomicBool,
    tx: Mutex<Option<Rows>>,
    monitor: LossMonitor,
}

/// One fake connection. Holds the uncommitted rows of its open transaction.
pub struct FakeSession {
    inner: Arc<SessionInner>,
}

fn working<'a>(db: &'a mut DbState, tx: &'a mut Option<Rows>) -> &'a mut Rows {
    match tx {
        Some(rows) => rows,
        None => &mut db.committed,
    }
}

fn duplicate(rows: &Rows, book: &Book) -> bool {
    rows.values()
        .any(|b| b.id != book.id && b.title == book.title && b.author == book.author)
}

impl FakeSession {
    pub fn generation(&self) -> u64 {
        self.inner.monitor.generation()
    }

    async fn execute<R>(
        &self,
        sql: &str,
        op: impl FnOnce(&mut DbState, &mut Option<Rows>) -> Result<R, FakeError> + Send,
    ) -> Result<R, FakeError> {
        let latency = lock(&self.inner.db.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_closed() {
            return Err(FakeError::Closed);
        }
        let mut db = lock(&self.inner.db.state);
        db.log.push(sql.to_owned());
        if db.fail_on.iter().any(|prefix| sql.starts_with(prefix.as_str())) {
            return Err(FakeError::Rejected(sql.to_owned()));
        }
        let mut tx = lock(&self.inner.tx);
        op(&mut *db, &mut *tx)
    }

    pub async fn list_books(&self) -> Result<Vec<Book>, FakeError> {
        let sql = bookshelf_sql_builder::select_all::<Book>("id");
        self.execute(&sql, |db, tx| Ok(working(db, tx).values().cloned().collect()))
            .await
    }

    pub async fn get_book(&self, id: i64) -> Result<Option<Book>, FakeError> {
        let sql = bookshelf_sql_builder::select_by_id::<Book>("id");
        self.execute(&sql, move |db, tx| Ok(working(db, tx).get(&id).cloned()))
            .await
    }

    pub async fn insert_book(&self, book: &Book) -> Result<Book, FakeError> {
        let sql = bookshelf_sql_builder::insert::<Book>();
        let book = book.clone();
        self.execute(&sql, move |db, tx| {
            // Sequences are not transactional.
            db.next_id += 1;
            let id = db.next_id;
            let rows = working(db, tx);
            let now = Utc::now();
            let stored = Book {
                id: Some(id),
                updated_at: Some(now),
                created_at: Some(now),
                ..book
            };
            if duplicate(rows, &stored) {
                return Err(FakeError::UniqueViolation);
            }
            rows.insert(id, stored.clone());
            Ok(stored)
        })
        .await
    }

    pub async fn update_book(&self, book: &Book) -> Result<Option<Book>, FakeError> {
        let sql = bookshelf_sql_builder::update_by_id::<Book>("id");
        let book = book.clone();
        self.execute(&sql, move |db, tx| {
            let Some(id) = book.id else {
                return Ok(None);
            };
            let rows = working(db, tx);
            if duplicate(rows, &book) {
                return Err(FakeError::UniqueViolation);
            }
            Ok(rows.get_mut(&id).map(|row| {
                row.title = book.title;
                row.author = book.author;
                row.updated_at = Some(Utc::now());
                row.clone()
            }))
        })
        .await
    }

    pub async fn delete_book(&self, id: i64) -> Result<bool, FakeError> {
        let sql = bookshelf_sql_builder::delete_by_id::<Book>("id");
        self.execute(&sql, move |db, tx| Ok(working(db, tx).remove(&id).is_some()))
            .await
    }
}

#[async_trait]
impl Session for FakeSession {
    type Error = FakeError;

    async fn batch_execute(&self, sql: &str) -> Result<(), FakeError> {
        let keyword = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches(';')
            .to_ascii_uppercase();
        self.execute(sql, move |db, tx| {
            match keyword.as_str() {
                "BEGIN" => *tx = Some(db.committed.clone()),
                "COMMIT" => {
                    if let Some(rows) = tx.take() {
                        db.committed = rows;
                    }
                }
                "ROLLBACK" => *tx = None,
                _ => {}
            }
            Ok(())
        })
        .await
    }

    fn is_disconnect(error: &FakeError) -> bool {
        matches!(error, FakeError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Control {
    refuse: AtomicUsize,
    hang: AtomicBool,
    attempts: AtomicUsize,
    latest: Mutex<Option<Arc<SessionInner>>>,
}

/// Connects [`FakeSession`]s to one [`FakeDatabase`].
#[derive(Clone)]
pub struct FakeConnector {
    db: FakeDatabase,
    control: Arc<Control>,
}

impl FakeConnector {
    pub fn new(db: FakeDatabase) -> Self {
        Self {
            db,
            control: Arc::default(),
        }
    }

    pub fn database(&self) -> &FakeDatabase {
        &self.db
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.control.refuse.store(n, Ordering::SeqCst);
    }

    /// Make connection attempts never complete.
    pub fn set_hang(&self, hang: bool) {
        self.control.hang.store(hang, Ordering::SeqCst);
    }

    /// Connection attempts so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.control.attempts.load(Ordering::SeqCst)
    }

    /// Drop the latest session the way a reset TCP connection would: its statements start
    /// failing and the driver reports the loss.
    pub fn sever(&self) {
        if let Some(inner) = lock(&self.control.latest).as_ref() {
            inner.closed.store(true, Ordering::SeqCst);
            inner.monitor.report("connection reset by peer");
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, monitor: LossMonitor) -> Result<FakeSession, BoxError> {
        self.control.attempts.fetch_add(1, Ordering::SeqCst);
        if self.control.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let refused = self
            .control
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Box::new(FakeError::Refused));
        }
        let inner = Arc::new(SessionInner {
            db: self.db.clone(),
            closed: AtomicBool::new(false),
            tx: Mutex::new(None),
            monitor,
        });
        *lock(&self.control.latest) = Some(inner.clone());
        Ok(FakeSession { inner })
    }

    fn describe(&self) -> String {
        "fake://bookshelf".to_string()
    }
}
