use bookshelf_core::{Fetchable, Insertable, ParamValue, Updatable};
use bookshelf_sql_builder::{placeholder_style, Placeholder};
use proptest::prelude::*;

struct Ledger;

impl Fetchable for Ledger {
    const TABLE: &'static str = "ledgers";
    const SELECT_COLUMNS: &'static [&'static str] =
        &["id", "owner", "balance", "currency", "note", "updated_at"];
}

impl Insertable for Ledger {
    const INSERT_COLUMNS: &'static [&'static str] = &["owner", "balance", "currency", "note"];
    fn insert_values(&self) -> Vec<ParamValue> {
        vec![ParamValue::Null; Self::INSERT_COLUMNS.len()]
    }
}

impl Updatable for Ledger {
    const UPDATE_COLUMNS: &'static [&'static str] = &["owner", "balance", "currency", "note"];
    const TOUCH_COLUMNS: &'static [&'static str] = &["updated_at"];
    fn update_values(&self) -> Vec<ParamValue> {
        self.insert_values()
    }
}

fn placeholder_count(sql: &str, expected: usize) -> usize {
    match placeholder_style() {
        Placeholder::Question => sql.matches('?').count(),
        Placeholder::Dollar => (1..=expected)
            .filter(|i| sql.contains(&format!("${}", i)))
            .count(),
    }
}

#[test]
fn insert_and_update_bind_every_column() {
    let insert = bookshelf_sql_builder::insert::<Ledger>();
    assert_eq!(placeholder_count(&insert, 4), 4);

    // Touch columns are stamped by the database and take no parameter.
    let update = bookshelf_sql_builder::update_by_id::<Ledger>("id");
    assert_eq!(placeholder_count(&update, 5), 5);
    assert!(update.contains("updated_at = CURRENT_TIMESTAMP"));
}

proptest! {
    // Keyed statements carry exactly one placeholder, bound to the key column.
    #[test]
    fn keyed_statements_have_one_placeholder(id in "[a-z][a-z0-9_]{0,15}") {
        for sql in [
            bookshelf_sql_builder::select_by_id::<Ledger>(&id),
            bookshelf_sql_builder::delete_by_id::<Ledger>(&id),
        ] {
            let where_clause = format!("WHERE {} = ", id);
            prop_assert!(sql.contains(&where_clause));
            prop_assert_eq!(placeholder_count(&sql, 1), 1);
            prop_assert!(!sql.contains("$2"));
        }
    }

    #[test]
    fn update_key_placeholder_follows_the_set_clause(id in "[a-z][a-z0-9_]{0,15}") {
        let sql = bookshelf_sql_builder::update_by_id::<Ledger>(&id);
        let expected = match placeholder_style() {
            Placeholder::Dollar => format!("WHERE {} = $5", id),
            Placeholder::Question => format!("WHERE {} = ?", id),
        };
        prop_assert!(sql.contains(&expected));
    }
}
