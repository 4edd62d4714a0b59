use bookshelf_core::{BrokerError, Fetchable, Identifiable, Insertable, ParamValue, Updatable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BookError;

/// A row of the `books` table.
///
/// Timestamps are maintained by the database and never cross the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(skip)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Book {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            author: author.into(),
            updated_at: None,
            created_at: None,
        }
    }

    /// Title and author are required and must not be blank.
    pub fn validate(&self) -> Result<(), BookError> {
        let mut missing = Vec::new();
        if self.title.trim().is_empty() {
            missing.push("title is required");
        }
        if self.author.trim().is_empty() {
            missing.push("author is required");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BookError::Validation(missing.join("; ")))
        }
    }
}

impl Fetchable for Book {
    const TABLE: &'static str = "books";
    const SELECT_COLUMNS: &'static [&'static str] =
        &["id", "title", "author", "updated_at", "created_at"];
}

impl Identifiable for Book {
    type Key = i64;
    const ID_COLUMN: &'static str = "id";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

impl Insertable for Book {
    const INSERT_COLUMNS: &'static [&'static str] = &["title", "author"];

    fn insert_values(&self) -> Vec<ParamValue> {
        vec![
            ParamValue::String(self.title.clone()),
            ParamValue::String(self.author.clone()),
        ]
    }
}

impl Updatable for Book {
    const UPDATE_COLUMNS: &'static [&'static str] = &["title", "author"];
    const TOUCH_COLUMNS: &'static [&'static str] = &["updated_at"];

    fn update_values(&self) -> Vec<ParamValue> {
        self.insert_values()
    }
}

/// Maps `tokio_postgres` rows selected with [`Book::SELECT_COLUMNS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BookRowAdapter;

impl bookshelf_core::RowAdapter<Book> for BookRowAdapter {
    type Row = tokio_postgres::Row;

    fn from_row(&self, row: &Self::Row) -> Result<Book, BrokerError> {
        Ok(Book {
            id: Some(row.try_get("id").map_err(BrokerError::mapping)?),
            title: row.try_get("title").map_err(BrokerError::mapping)?,
            author: row.try_get("author").map_err(BrokerError::mapping)?,
            updated_at: row.try_get("updated_at").map_err(BrokerError::mapping)?,
            created_at: row.try_get("created_at").map_err(BrokerError::mapping)?,
        })
    }
}
