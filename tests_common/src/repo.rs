use async_trait::async_trait;
use bookshelf::book::Book;
use bookshelf_core::{BrokerError, BrokerResult, ConnectionHandle, Repository, RequestContext};

use crate::fake::FakeSession;

/// Book repository over the supervised fake session. Goes through the same
/// `RequestContext::use_connection` path as the Postgres repository.
#[derive(Clone)]
pub struct FakeBookRepository {
    handle: ConnectionHandle<FakeSession>,
}

impl FakeBookRepository {
    pub fn new(handle: ConnectionHandle<FakeSession>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Repository<Book, FakeSession> for FakeBookRepository {
    async fn list(&self, ctx: &mut RequestContext<FakeSession>) -> BrokerResult<Vec<Book>> {
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec.session().list_books().await;
        result.map_err(|e| exec.fail(e))
    }

    async fn find_by_id(
        &self,
        ctx: &mut RequestContext<FakeSession>,
        id: &i64,
    ) -> BrokerResult<Option<Book>> {
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec.session().get_book(*id).await;
        result.map_err(|e| exec.fail(e))
    }

    async fn insert(&self, ctx: &mut RequestContext<FakeSession>, entity: &Book) -> BrokerResult<Book> {
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec.session().insert_book(entity).await;
        result.map_err(|e| exec.fail(e))
    }

    async fn update(&self, ctx: &mut RequestContext<FakeSession>, entity: &Book) -> BrokerResult<Book> {
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec.session().update_book(entity).await;
        match result {
            Ok(Some(book)) => Ok(book),
            Ok(None) => exec.observe(Err(BrokerError::NotFound)),
            Err(e) => Err(exec.fail(e)),
        }
    }

    async fn delete_by_id(
        &self,
        ctx: &mut RequestContext<FakeSession>,
        id: &i64,
    ) -> BrokerResult<bool> {
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec.session().delete_book(*id).await;
        result.map_err(|e| exec.fail(e))
    }
}
