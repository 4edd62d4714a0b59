//! Common integration testing utilities and generic tests reusable across backends.

pub mod fake;
mod repo;

use async_trait::async_trait;
use bookshelf::book::Book;
use bookshelf_core::{
    BrokerError, BrokerResult, ConnectionHandle, ConnectionSupervisor, ReconnectPolicy,
    Repository, RequestContext, ScopeState, Session,
};

pub use fake::{FakeConnector, FakeDatabase, FakeError, FakeSession};
pub use repo::FakeBookRepository;

/// Expose migration SQL via constants for harnesses.
pub mod migrations {
    pub const POSTGRES_BOOKS_SQL: &str =
        include_str!("../../bookshelf/migrations/V1__create_books.sql");
}

/// A started supervisor over a fresh fake database.
pub struct FakeStack {
    pub db: FakeDatabase,
    pub connector: FakeConnector,
    pub supervisor: ConnectionSupervisor<FakeConnector>,
    pub handle: ConnectionHandle<FakeSession>,
}

impl FakeStack {
    pub fn repository(&self) -> FakeBookRepository {
        FakeBookRepository::new(self.handle.clone())
    }
}

pub async fn start_fake(policy: ReconnectPolicy) -> BrokerResult<FakeStack> {
    let db = FakeDatabase::new();
    let connector = FakeConnector::new(db.clone());
    let mut supervisor = ConnectionSupervisor::new(connector.clone(), policy);
    let handle = supervisor.start().await?;
    Ok(FakeStack {
        db,
        connector,
        supervisor,
        handle,
    })
}

#[async_trait]
pub trait RepoFactory {
    type Session: Session;

    /// Construct a repository connected to a DB with the required schema.
    async fn new_book_repo(&self) -> BrokerResult<Box<dyn Repository<Book, Self::Session>>>;
}

/// Generic CRUD roundtrip test in auto-commit mode.
pub async fn test_crud_roundtrip<F: RepoFactory + Sync>(f: &F) -> BrokerResult<()> {
    let repo = f.new_book_repo().await?;
    let mut ctx = RequestContext::<F::Session>::new();

    let created = repo
        .insert(&mut ctx, &Book::new("Dune", "Frank Herbert"))
        .await?;
    let id = created.id.expect("insert assigns an id");
    assert!(created.created_at.is_some());

    let fetched = repo.find_by_id(&mut ctx, &id).await?;
    assert_eq!(fetched.as_ref().map(|b| b.title.as_str()), Some("Dune"));

    let mut changed = fetched.unwrap();
    changed.title = "Dune Messiah".into();
    let updated = repo.update(&mut ctx, &changed).await?;
    assert_eq!(updated.title, "Dune Messiah");
    assert_eq!(updated.created_at, created.created_at);

    let listed = repo.list(&mut ctx).await?;
    assert!(listed.iter().any(|b| b.id == Some(id)));
    assert!(listed.windows(2).all(|w| w[0].id < w[1].id));

    let missing = Book {
        id: Some(i64::MAX),
        ..Book::new("Nowhere", "Nobody")
    };
    assert!(matches!(
        repo.update(&mut ctx, &missing).await,
        Err(BrokerError::NotFound)
    ));

    assert!(repo.delete_by_id(&mut ctx, &id).await?);
    assert!(!repo.delete_by_id(&mut ctx, &id).await?);
    assert!(repo.find_by_id(&mut ctx, &id).await?.is_none());
    Ok(())
}

/// Writes made inside a failed scope are not visible afterwards.
pub async fn test_failed_scope_rolls_back<F: RepoFactory + Sync>(f: &F) -> BrokerResult<()> {
    let repo = f.new_book_repo().await?;
    let mut ctx = RequestContext::<F::Session>::new();

    let ticket = ctx.begin();
    let created = repo
        .insert(&mut ctx, &Book::new("Abandoned", "Nobody"))
        .await?;
    ctx.set_error("caller gave up");
    let state = ctx
        .release(ticket, bookshelf_core::Outcome::Failed)
        .await?;
    assert_eq!(state, ScopeState::RolledBack);

    let id = created.id.expect("insert assigns an id");
    let mut reader = RequestContext::<F::Session>::new();
    assert!(repo.find_by_id(&mut reader, &id).await?.is_none());
    Ok(())
}

/// A unique violation inside a scope rolls back the statements that preceded it.
pub async fn test_unique_violation_rolls_back<F: RepoFactory + Sync>(f: &F) -> BrokerResult<()> {
    let repo = f.new_book_repo().await?;
    let mut ctx = RequestContext::<F::Session>::new();
    repo.insert(&mut ctx, &Book::new("Emma", "Jane Austen"))
        .await?;

    let ticket = ctx.begin();
    let side = repo
        .insert(&mut ctx, &Book::new("Persuasion", "Jane Austen"))
        .await?;
    let dup = repo
        .insert(&mut ctx, &Book::new("Emma", "Jane Austen"))
        .await;
    let err = ctx.finish(ticket, dup).await.unwrap_err();
    assert!(matches!(err, BrokerError::Statement { .. }), "{err:?}");
    let msg = err.describe().to_lowercase();
    assert!(msg.contains("unique") || msg.contains("duplicate"), "{msg}");

    let mut reader = RequestContext::<F::Session>::new();
    let id = side.id.expect("insert assigns an id");
    assert!(repo.find_by_id(&mut reader, &id).await?.is_none());
    let emmas = repo
        .list(&mut reader)
        .await?
        .into_iter()
        .filter(|b| b.title == "Emma")
        .count();
    assert_eq!(emmas, 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_constants_non_empty() {
        let pg = migrations::POSTGRES_BOOKS_SQL;
        assert!(pg.contains("CREATE TABLE") && pg.contains("books"));
        assert!(pg.contains("UNIQUE"));
    }

    struct MemFactory;

    #[async_trait]
    impl RepoFactory for MemFactory {
        type Session = FakeSession;

        async fn new_book_repo(&self) -> BrokerResult<Box<dyn Repository<Book, FakeSession>>> {
            let stack = start_fake(ReconnectPolicy::default()).await?;
            Ok(Box::new(stack.repository()))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generic_helpers_run_with_fake_backend() -> BrokerResult<()> {
        let f = MemFactory;
        test_crud_roundtrip(&f).await?;
        test_failed_scope_rolls_back(&f).await?;
        test_unique_violation_rolls_back(&f).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fake_session_buffers_until_commit() -> BrokerResult<()> {
        let stack = start_fake(ReconnectPolicy::default()).await?;
        let repo = stack.repository();
        let mut ctx = RequestContext::new();

        let ticket = ctx.begin();
        repo.insert(&mut ctx, &Book::new("Ubik", "Philip K. Dick"))
            .await?;
        assert!(stack.db.rows().is_empty());
        assert_eq!(ctx.release(ticket, bookshelf_core::Outcome::Success).await?, ScopeState::Committed);
        assert_eq!(stack.db.rows().len(), 1);
        assert_eq!(stack.db.count("BEGIN"), 1);
        assert_eq!(stack.db.count("COMMIT"), 1);
        Ok(())
    }
}
