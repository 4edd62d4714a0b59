#![forbid(unsafe_code)]
//! SQL statement builders driven by the table metadata of `bookshelf_core` entities.
//!
//! Feature flags select placeholder style:
//! - `tokio_postgres`: $1, $2, ... and `INSERT ... RETURNING <id>`
//!
//! Default (no feature): ?
//!
//! Values are never interpolated; every builder emits placeholders only.

use bookshelf_core::{Fetchable, Insertable, Updatable};

/// Placeholder representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Dollar,   // $1, $2, ...
    Question, // ?
}

/// The placeholder style compiled into this build.
pub fn placeholder_style() -> Placeholder {
    #[cfg(feature = "tokio_postgres")]
    return Placeholder::Dollar;

    #[cfg(not(feature = "tokio_postgres"))]
    return Placeholder::Question;
}

fn placeholder_n(ph: Placeholder, n: usize) -> String {
    match ph {
        Placeholder::Dollar => format!("${}", n),
        Placeholder::Question => "?".to_string(),
    }
}

/// Build `SELECT <cols> FROM <table> ORDER BY <id> ASC`.
pub fn select_all<E>(id_column: &str) -> String
where
    E: Fetchable,
{
    format!(
        "SELECT {cols} FROM {table} ORDER BY {id} ASC",
        cols = E::SELECT_COLUMNS.join(", "),
        table = E::TABLE,
        id = id_column
    )
}

/// Build `SELECT <cols> FROM <table> WHERE <id> = <ph>`.
pub fn select_by_id<E>(id_column: &str) -> String
where
    E: Fetchable,
{
    format!(
        "SELECT {cols} FROM {table} WHERE {id} = {ph}",
        cols = E::SELECT_COLUMNS.join(", "),
        table = E::TABLE,
        id = id_column,
        ph = placeholder_n(placeholder_style(), 1)
    )
}

/// Build `DELETE FROM <table> WHERE <id> = <ph>`.
pub fn delete_by_id<E>(id_column: &str) -> String
where
    E: Fetchable,
{
    format!(
        "DELETE FROM {table} WHERE {id} = {ph}",
        table = E::TABLE,
        id = id_column,
        ph = placeholder_n(placeholder_style(), 1)
    )
}

/// Build `INSERT INTO <table> (<cols>) VALUES (<placeholders>)`.
/// With `tokio_postgres` the statement returns the selected columns of the new row.
pub fn insert<E>() -> String
where
    E: Fetchable + Insertable,
{
    let style = placeholder_style();
    let phs: Vec<String> = (1..=E::INSERT_COLUMNS.len())
        .map(|i| placeholder_n(style, i))
        .collect();
    let sql = format!(
        "INSERT INTO {table} ({cols}) VALUES ({vals})",
        table = E::TABLE,
        cols = E::INSERT_COLUMNS.join(", "),
        vals = phs.join(", ")
    );

    #[cfg(feature = "tokio_postgres")]
    {
        format!("{sql} RETURNING {}", E::SELECT_COLUMNS.join(", "))
    }

    #[cfg(not(feature = "tokio_postgres"))]
    {
        sql
    }
}

/// Build `UPDATE <table> SET <col1> = <ph1>, ..., <touch> = CURRENT_TIMESTAMP WHERE <id> = <phN>`.
/// With `tokio_postgres` the statement returns the selected columns of the updated row.
pub fn update_by_id<E>(id_column: &str) -> String
where
    E: Fetchable + Updatable,
{
    let style = placeholder_style();
    let mut assignments: Vec<String> = E::UPDATE_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = {ph}", ph = placeholder_n(style, i + 1)))
        .collect();
    assignments.extend(
        E::TOUCH_COLUMNS
            .iter()
            .map(|col| format!("{col} = CURRENT_TIMESTAMP")),
    );
    let sql = format!(
        "UPDATE {table} SET {set_clause} WHERE {id} = {where_ph}",
        table = E::TABLE,
        set_clause = assignments.join(", "),
        id = id_column,
        where_ph = placeholder_n(style, E::UPDATE_COLUMNS.len() + 1)
    );

    #[cfg(feature = "tokio_postgres")]
    {
        format!("{sql} RETURNING {}", E::SELECT_COLUMNS.join(", "))
    }

    #[cfg(not(feature = "tokio_postgres"))]
    {
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookshelf_core::ParamValue;

    struct Shelf;

    impl Fetchable for Shelf {
        const TABLE: &'static str = "shelves";
        const SELECT_COLUMNS: &'static [&'static str] = &["id", "label", "capacity", "updated_at"];
    }

    impl Insertable for Shelf {
        const INSERT_COLUMNS: &'static [&'static str] = &["label", "capacity"];
        fn insert_values(&self) -> Vec<ParamValue> {
            vec![ParamValue::String("a".into()), ParamValue::I32(3)]
        }
    }

    impl Updatable for Shelf {
        const UPDATE_COLUMNS: &'static [&'static str] = &["label", "capacity"];
        const TOUCH_COLUMNS: &'static [&'static str] = &["updated_at"];
        fn update_values(&self) -> Vec<ParamValue> {
            self.insert_values()
        }
    }

    #[test]
    fn select_all_is_ordered_by_key() {
        assert_eq!(
            select_all::<Shelf>("id"),
            "SELECT id, label, capacity, updated_at FROM shelves ORDER BY id ASC"
        );
    }

    #[cfg(feature = "tokio_postgres")]
    #[test]
    fn postgres_statements() {
        assert_eq!(placeholder_style(), Placeholder::Dollar);
        assert_eq!(
            select_by_id::<Shelf>("id"),
            "SELECT id, label, capacity, updated_at FROM shelves WHERE id = $1"
        );
        assert_eq!(delete_by_id::<Shelf>("id"), "DELETE FROM shelves WHERE id = $1");
        assert_eq!(
            insert::<Shelf>(),
            "INSERT INTO shelves (label, capacity) VALUES ($1, $2) RETURNING id, label, capacity, updated_at"
        );
        assert_eq!(
            update_by_id::<Shelf>("id"),
            "UPDATE shelves SET label = $1, capacity = $2, updated_at = CURRENT_TIMESTAMP WHERE id = $3 RETURNING id, label, capacity, updated_at"
        );
    }

    #[cfg(not(feature = "tokio_postgres"))]
    #[test]
    fn question_mark_statements() {
        assert_eq!(placeholder_style(), Placeholder::Question);
        assert_eq!(
            select_by_id::<Shelf>("id"),
            "SELECT id, label, capacity, updated_at FROM shelves WHERE id = ?"
        );
        assert_eq!(delete_by_id::<Shelf>("id"), "DELETE FROM shelves WHERE id = ?");
        assert_eq!(
            insert::<Shelf>(),
            "INSERT INTO shelves (label, capacity) VALUES (?, ?)"
        );
        assert_eq!(
            update_by_id::<Shelf>("id"),
            "UPDATE shelves SET label = ?, capacity = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?"
        );
    }
}
