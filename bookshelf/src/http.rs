//! JSON API over [`BookService`].
//!
//! Every response uses the envelope `{ "status": <code>, "message": <text>, "data": <payload?> }`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bookshelf_core::{BrokerError, SupervisorState};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::book::{Book, BookError, BookService};

#[derive(Clone)]
pub struct AppState {
    pub books: Arc<dyn BookService>,
    /// Published by the connection supervisor.
    pub db_state: watch::Receiver<SupervisorState>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn new(status: StatusCode, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: status.as_u16(),
            message: message.into(),
            data,
        }
    }

    fn success(data: T) -> Json<Self> {
        Json(Self::new(StatusCode::OK, "success", Some(data)))
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Book(BookError),
}

impl From<BookError> for ApiError {
    fn from(e: BookError) -> Self {
        ApiError::Book(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Book(BookError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Book(BookError::NotFound(_))
            | ApiError::Book(BookError::Broker(BrokerError::NotFound)) => StatusCode::NOT_FOUND,
            ApiError::Book(BookError::Broker(
                BrokerError::ConnectionUnavailable { .. } | BrokerError::Connection { .. },
            )) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Book(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::Book(e) => e.describe(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "request rejected");
        }
        (status, Json(ApiResponse::<()>::new(status, message, None))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid book id `{raw}`")))
}

fn json_body(payload: Result<Json<Book>, JsonRejection>) -> Result<Book, ApiError> {
    payload
        .map(|Json(book)| book)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

async fn list_books(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Book>>>, ApiError> {
    Ok(ApiResponse::success(state.books.list_books().await?))
}

async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Book>>, ApiError> {
    let id = parse_id(&id)?;
    Ok(ApiResponse::success(state.books.get_book(id).await?))
}

async fn create_book(
    State(state): State<AppState>,
    payload: Result<Json<Book>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Book>>), ApiError> {
    let created = state.books.create_book(json_body(payload)?).await?;
    let message = format!("Create book success #{}", created.id.unwrap_or_default());
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(StatusCode::CREATED, message, Some(created))),
    ))
}

async fn update_book(
    State(state): State<AppState>,
    payload: Result<Json<Book>, JsonRejection>,
) -> Result<Json<ApiResponse<Book>>, ApiError> {
    Ok(ApiResponse::success(
        state.books.update_book(json_body(payload)?).await?,
    ))
}

async fn delete_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.books.delete_book(parse_id(&id)?).await?;
    Ok(Json(ApiResponse::new(StatusCode::OK, "success", None)))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<()>>) {
    let db = *state.db_state.borrow();
    let status = if db == SupervisorState::Connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ApiResponse::new(status, db.to_string(), None)))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/book", get(list_books).post(create_book).put(update_book))
        .route("/book/:id", get(get_book).delete(delete_book))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
