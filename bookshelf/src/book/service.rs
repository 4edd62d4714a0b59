use std::marker::PhantomData;

use async_trait::async_trait;
use bookshelf_core::{BrokerError, Repository, RequestContext, Session};
use tracing::Instrument;

use super::{Book, BookError};

/// Book use cases. Every write runs inside its own transaction scope; reads run in auto-commit.
#[async_trait]
pub trait BookService: Send + Sync {
    async fn list_books(&self) -> Result<Vec<Book>, BookError>;
    async fn get_book(&self, id: i64) -> Result<Book, BookError>;
    async fn create_book(&self, book: Book) -> Result<Book, BookError>;
    async fn update_book(&self, book: Book) -> Result<Book, BookError>;
    async fn delete_book(&self, id: i64) -> Result<(), BookError>;
}

pub struct BookServiceImpl<R, S> {
    repo: R,
    _session: PhantomData<fn() -> S>,
}

impl<R, S> BookServiceImpl<R, S>
where
    R: Repository<Book, S>,
    S: Session,
{
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            _session: PhantomData,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }
}

#[async_trait]
impl<R, S> BookService for BookServiceImpl<R, S>
where
    R: Repository<Book, S>,
    S: Session,
{
    async fn list_books(&self) -> Result<Vec<Book>, BookError> {
        let mut ctx = RequestContext::<S>::new();
        let span = ctx.span();
        async move { Ok(self.repo.list(&mut ctx).await?) }
            .instrument(span)
            .await
    }

    async fn get_book(&self, id: i64) -> Result<Book, BookError> {
        let mut ctx = RequestContext::<S>::new();
        let span = ctx.span();
        async move {
            self.repo
                .find_by_id(&mut ctx, &id)
                .await?
                .ok_or(BookError::NotFound(id))
        }
        .instrument(span)
        .await
    }

    async fn create_book(&self, book: Book) -> Result<Book, BookError> {
        book.validate()?;
        let mut ctx = RequestContext::<S>::new();
        let span = ctx.span();
        async move {
            let ticket = ctx.begin();
            let result = self.repo.insert(&mut ctx, &book).await;
            let created = ctx.finish(ticket, result).await?;
            tracing::info!(id = ?created.id, "book created");
            Ok(created)
        }
        .instrument(span)
        .await
    }

    async fn update_book(&self, book: Book) -> Result<Book, BookError> {
        let Some(id) = book.id else {
            return Err(BookError::Validation("id is required".into()));
        };
        book.validate()?;
        let mut ctx = RequestContext::<S>::new();
        let span = ctx.span();
        async move {
            let ticket = ctx.begin();
            let result = self.repo.update(&mut ctx, &book).await;
            match ctx.finish(ticket, result).await {
                Ok(updated) => Ok(updated),
                Err(BrokerError::NotFound) => Err(BookError::NotFound(id)),
                Err(e) => Err(e.into()),
            }
        }
        .instrument(span)
        .await
    }

    async fn delete_book(&self, id: i64) -> Result<(), BookError> {
        let mut ctx = RequestContext::<S>::new();
        let span = ctx.span();
        async move {
            let ticket = ctx.begin();
            let result = self.repo.delete_by_id(&mut ctx, &id).await;
            if ctx.finish(ticket, result).await? {
                Ok(())
            } else {
                Err(BookError::NotFound(id))
            }
        }
        .instrument(span)
        .await
    }
}
