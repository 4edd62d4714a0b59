use std::marker::PhantomData;
use std::time::Instant;

use async_trait::async_trait;
use bookshelf_core::{
    BrokerError, BrokerResult, ConnectionHandle, Fetchable, Identifiable, Insertable, ParamValue,
    Repository, RequestContext, RowAdapter, Updatable,
};
use tokio_postgres::{types::ToSql, Row};

use crate::PgSession;

fn obs_record(op: &str, table: &str, start: Instant, rows: usize, success: bool) {
    let elapsed = start.elapsed().as_millis() as u64;
    tracing::debug!(
        table = table,
        op = op,
        rows = rows,
        elapsed_ms = elapsed,
        success = success,
        "repo op"
    );
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("repo_ops_total", 1, "op" => op.to_string(), "table" => table.to_string(), "success" => success.to_string());
        metrics::histogram!("repo_op_duration_ms", elapsed as f64, "op" => op.to_string(), "table" => table.to_string());
    }
}

/// A helper to convert `ParamValue`s into a `Vec` of owned, boxed `ToSql` trait objects.
fn to_postgres_params(values: &[ParamValue]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    values
        .iter()
        .map(|v| -> Box<dyn ToSql + Sync + Send> {
            match v {
                ParamValue::String(s) => Box::new(s.clone()),
                ParamValue::I32(i) => Box::new(*i),
                ParamValue::I64(i) => Box::new(*i),
                ParamValue::F64(f) => Box::new(*f),
                ParamValue::Bool(b) => Box::new(*b),
                ParamValue::Null => Box::new(Option::<i32>::None),
            }
        })
        .collect()
}

fn as_params(owned: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    owned
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Prebuilt SQL strings, computed once per repository instance.
struct RepoSql<T> {
    select_all: String,
    select_by_id: String,
    insert: String,
    update_by_id: String,
    delete_by_id: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RepoSql<T>
where
    T: Fetchable + Identifiable + Insertable + Updatable,
{
    fn new() -> Self {
        Self {
            select_all: bookshelf_sql_builder::select_all::<T>(T::ID_COLUMN),
            select_by_id: bookshelf_sql_builder::select_by_id::<T>(T::ID_COLUMN),
            insert: bookshelf_sql_builder::insert::<T>(),
            update_by_id: bookshelf_sql_builder::update_by_id::<T>(T::ID_COLUMN),
            delete_by_id: bookshelf_sql_builder::delete_by_id::<T>(T::ID_COLUMN),
            _marker: PhantomData,
        }
    }
}

/// Repository for `T` over the supervised Postgres session.
///
/// Holds only the [`ConnectionHandle`]; every call resolves the current session through the
/// caller's [`RequestContext`], so reconnections are picked up transparently.
pub struct PgRepository<T, A> {
    handle: ConnectionHandle<PgSession>,
    adapter: A,
    sql: RepoSql<T>,
}

impl<T, A> PgRepository<T, A>
where
    T: Fetchable + Identifiable + Insertable + Updatable,
    A: RowAdapter<T, Row = Row>,
{
    pub fn new(handle: ConnectionHandle<PgSession>, adapter: A) -> Self {
        Self {
            handle,
            adapter,
            sql: RepoSql::new(),
        }
    }

    pub fn handle(&self) -> &ConnectionHandle<PgSession> {
        &self.handle
    }

    fn map_rows(&self, rows: &[Row]) -> BrokerResult<Vec<T>> {
        rows.iter().map(|row| self.adapter.from_row(row)).collect()
    }
}

#[async_trait]
impl<T, A> Repository<T, PgSession> for PgRepository<T, A>
where
    T: Fetchable + Identifiable + Insertable + Updatable + Send + Sync + 'static,
    A: RowAdapter<T, Row = Row> + Send + Sync + 'static,
    T::Key: ToSql + Clone + Send + Sync + 'static,
{
    async fn list(&self, ctx: &mut RequestContext<PgSession>) -> BrokerResult<Vec<T>> {
        let start = Instant::now();
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec.session().client().query(&self.sql.select_all, &[]).await;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                obs_record("list", T::TABLE, start, 0, false);
                return Err(exec.fail(e));
            }
        };
        let result = exec.observe(self.map_rows(&rows));
        obs_record("list", T::TABLE, start, rows.len(), result.is_ok());
        result
    }

    async fn find_by_id(
        &self,
        ctx: &mut RequestContext<PgSession>,
        id: &T::Key,
    ) -> BrokerResult<Option<T>> {
        let start = Instant::now();
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec
            .session()
            .client()
            .query_opt(&self.sql.select_by_id, &[id])
            .await;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                obs_record("find_by_id", T::TABLE, start, 0, false);
                return Err(exec.fail(e));
            }
        };
        let result = exec.observe(row.as_ref().map(|r| self.adapter.from_row(r)).transpose());
        obs_record("find_by_id", T::TABLE, start, usize::from(row.is_some()), result.is_ok());
        result
    }

    async fn insert(&self, ctx: &mut RequestContext<PgSession>, entity: &T) -> BrokerResult<T> {
        let start = Instant::now();
        let owned = to_postgres_params(&entity.insert_values());
        let params = as_params(&owned);
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec
            .session()
            .client()
            .query_one(&self.sql.insert, &params)
            .await;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                obs_record("insert", T::TABLE, start, 0, false);
                return Err(exec.fail(e));
            }
        };
        let result = exec.observe(self.adapter.from_row(&row));
        obs_record("insert", T::TABLE, start, 1, result.is_ok());
        result
    }

    async fn update(&self, ctx: &mut RequestContext<PgSession>, entity: &T) -> BrokerResult<T> {
        let start = Instant::now();
        let Some(id) = entity.id() else {
            return Err(BrokerError::NotFound);
        };
        let mut owned = to_postgres_params(&entity.update_values());
        owned.push(Box::new(id));
        let params = as_params(&owned);
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec
            .session()
            .client()
            .query_opt(&self.sql.update_by_id, &params)
            .await;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                obs_record("update", T::TABLE, start, 0, false);
                return Err(exec.fail(e));
            }
        };
        let result = match row {
            Some(row) => self.adapter.from_row(&row),
            None => Err(BrokerError::NotFound),
        };
        let result = exec.observe(result);
        obs_record("update", T::TABLE, start, usize::from(result.is_ok()), result.is_ok());
        result
    }

    async fn delete_by_id(
        &self,
        ctx: &mut RequestContext<PgSession>,
        id: &T::Key,
    ) -> BrokerResult<bool> {
        let start = Instant::now();
        let mut exec = ctx.use_connection(&self.handle).await?;
        let result = exec
            .session()
            .client()
            .execute(&self.sql.delete_by_id, &[id])
            .await;
        match result {
            Ok(n) => {
                obs_record("delete_by_id", T::TABLE, start, n as usize, true);
                Ok(n > 0)
            }
            Err(e) => {
                obs_record("delete_by_id", T::TABLE, start, 0, false);
                Err(exec.fail(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note;

    impl Fetchable for Note {
        const TABLE: &'static str = "notes";
        const SELECT_COLUMNS: &'static [&'static str] = &["id", "body", "updated_at"];
    }
    impl Identifiable for Note {
        type Key = i64;
        const ID_COLUMN: &'static str = "id";
        fn id(&self) -> Option<i64> {
            None
        }
    }
    impl Insertable for Note {
        const INSERT_COLUMNS: &'static [&'static str] = &["body"];
        fn insert_values(&self) -> Vec<ParamValue> {
            vec![ParamValue::String("x".into())]
        }
    }
    impl Updatable for Note {
        const UPDATE_COLUMNS: &'static [&'static str] = &["body"];
        const TOUCH_COLUMNS: &'static [&'static str] = &["updated_at"];
        fn update_values(&self) -> Vec<ParamValue> {
            self.insert_values()
        }
    }

    #[test]
    fn to_postgres_params_maps_all_variants() {
        let values = [
            ParamValue::String("s".to_string()),
            ParamValue::I32(1),
            ParamValue::I64(2),
            ParamValue::F64(3.5),
            ParamValue::Bool(true),
            ParamValue::Null,
        ];
        let boxed = to_postgres_params(&values);
        assert_eq!(boxed.len(), values.len());
        assert_eq!(as_params(&boxed).len(), values.len());
    }

    #[test]
    fn repo_sql_uses_dollar_placeholders_and_returning() {
        let sql = RepoSql::<Note>::new();
        assert_eq!(sql.select_all, "SELECT id, body, updated_at FROM notes ORDER BY id ASC");
        assert!(sql.select_by_id.ends_with("WHERE id = $1"));
        assert!(sql.delete_by_id.ends_with("WHERE id = $1"));
        assert!(sql.insert.contains("VALUES ($1) RETURNING id, body, updated_at"));
        assert!(sql
            .update_by_id
            .contains("SET body = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2"));
    }
}
