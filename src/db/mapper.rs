//! Generic entity mapper: translates condition trees into parameterised
//! MySQL statements with a single bind pass shared between SET and WHERE.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::mysql::MySqlRow;
use sqlx::Row;

use crate::db::condition::{bind_value, bind_value_as, Condition, SetValue, SqlValue};
use crate::db::pool::DbPool;
use crate::errors::PersistenceError;

/// Best-effort dynamic column decode for `query_fields_by_condition`, which
/// doesn't know column types at compile time. Tries narrower types first.
fn decode_column(row: &MySqlRow, idx: usize) -> SqlValue {
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return SqlValue::Int(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return SqlValue::Float(v);
    }
    if let Ok(v) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx) {
        return SqlValue::Timestamp(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return SqlValue::Str(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
        return SqlValue::Bytes(v);
    }
    SqlValue::Null
}

/// Sort direction for `find_all`/`query_*_by_condition`.
#[derive(Debug, Clone, Copy)]
pub enum Order {
    Asc(&'static str),
    Desc(&'static str),
}

impl Order {
    fn to_sql(self) -> String {
        match self {
            Order::Asc(f) => format!("{f} ASC"),
            Order::Desc(f) => format!("{f} DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Pagination {
    fn to_sql(self) -> String {
        let mut sql = String::new();
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }
}

const DUPLICATE_KEY_ERRNO: u16 = 1062;

/// MySQL reports duplicate-key violations with the native errno `1062`
/// (`ER_DUP_ENTRY`), not in `DatabaseError::code()` — that returns the
/// SQLSTATE (`"23000"`), which is shared by every integrity-constraint
/// violation and useless for distinguishing this one. The errno lives on
/// the driver-specific error type, so downcast to it.
fn map_insert_error(err: sqlx::Error) -> PersistenceError {
    if let sqlx::Error::Database(ref db_err) = err {
        if let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
            if mysql_err.number() == DUPLICATE_KEY_ERRNO {
                return PersistenceError::DataAlreadyExist;
            }
        }
    }
    PersistenceError::Database(err)
}

/// Per-entity mapper. `E` is the row type (usually `#[derive(sqlx::FromRow)]`);
/// `K` is the primary-key type.
#[async_trait]
pub trait Mapper<E, K>
where
    E: for<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> + Send + Unpin,
    K: Send + Sync,
{
    fn table_name() -> &'static str;
    fn pk_column() -> &'static str;

    fn pool(&self) -> &DbPool;

    /// DDL for this entity's table. Implementers supply the concrete
    /// `CREATE TABLE IF NOT EXISTS ...` statement.
    fn create_table_sql() -> &'static str;

    /// Insert one row. Implementers supply the column list and bind
    /// values; the default maps MySQL's duplicate-key error (1062) to
    /// [`PersistenceError::DataAlreadyExist`].
    async fn insert(&self, columns: &[&'static str], values: Vec<SqlValue>) -> Result<u64, PersistenceError> {
        let placeholders = std::iter::repeat("?").take(values.len()).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::table_name(),
            columns.join(", "),
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for v in values {
            query = bind_value(query, v);
        }
        query
            .execute(self.pool().raw())
            .await
            .map(|r| r.rows_affected())
            .map_err(map_insert_error)
    }

    async fn create_table(&self) -> Result<(), PersistenceError> {
        sqlx::query(Self::create_table_sql()).execute(self.pool().raw()).await?;
        Ok(())
    }

    /// Field projection: returns each matching row as a `field -> value`
    /// map rather than a typed `E`, for callers that only need a subset of
    /// columns.
    async fn query_fields_by_condition(
        &self,
        tree: Condition,
        fields: &[&'static str],
        order: Option<Order>,
        page: Pagination,
    ) -> Result<Vec<HashMap<String, SqlValue>>, PersistenceError> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            fields.join(", "),
            Self::table_name(),
            tree.to_sql()
        );
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.to_sql());
        }
        sql.push_str(&page.to_sql());

        let mut params = Vec::new();
        tree.bind_into(&mut params);

        let mut query = sqlx::query(&sql);
        for p in params {
            query = bind_value(query, p);
        }
        let rows = query.fetch_all(self.pool().raw()).await?;

        Ok(rows
            .iter()
            .map(|row| {
                fields
                    .iter()
                    .enumerate()
                    .map(|(idx, name)| (name.to_string(), decode_column(row, idx)))
                    .collect()
            })
            .collect())
    }

    async fn find_by_id(&self, id: K) -> Result<Option<E>, PersistenceError>
    where
        K: Into<SqlValue> + 'async_trait,
    {
        let sql = format!("SELECT * FROM {} WHERE {} = ?", Self::table_name(), Self::pk_column());
        let query = bind_value_as(sqlx::query_as::<_, E>(&sql), id.into());
        Ok(query.fetch_optional(self.pool().raw()).await?)
    }

    async fn find_all(&self, order: Option<Order>, page: Pagination) -> Result<Vec<E>, PersistenceError> {
        let mut sql = format!("SELECT * FROM {}", Self::table_name());
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.to_sql());
        }
        sql.push_str(&page.to_sql());
        Ok(sqlx::query_as::<_, E>(&sql).fetch_all(self.pool().raw()).await?)
    }

    async fn delete_by_id(&self, id: K) -> Result<u64, PersistenceError>
    where
        K: Into<SqlValue> + 'async_trait,
    {
        let sql = format!("DELETE FROM {} WHERE {} = ?", Self::table_name(), Self::pk_column());
        let query = bind_value(sqlx::query(&sql), id.into());
        Ok(query.execute(self.pool().raw()).await?.rows_affected())
    }

    async fn update_fields_by_id(&self, id: K, fields: Vec<(&'static str, SetValue)>) -> Result<u64, PersistenceError>
    where
        K: Into<SqlValue> + 'async_trait,
    {
        self.update_fields_by_condition(Condition::eq(Self::pk_column(), id.into()), fields)
            .await
    }

    /// Query entities matching `tree`. `to_sql`/`bind_into` traversal order
    /// must match — verified by construction since both walk the same tree.
    async fn query_entities_by_condition(
        &self,
        tree: Condition,
        order: Option<Order>,
        page: Pagination,
    ) -> Result<Vec<E>, PersistenceError> {
        let mut sql = format!("SELECT * FROM {} WHERE {}", Self::table_name(), tree.to_sql());
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.to_sql());
        }
        sql.push_str(&page.to_sql());

        let mut params = Vec::new();
        tree.bind_into(&mut params);

        let mut query = sqlx::query_as::<_, E>(&sql);
        for p in params {
            query = bind_value_as(query, p);
        }
        Ok(query.fetch_all(self.pool().raw()).await?)
    }

    async fn count_by_condition(&self, tree: Condition) -> Result<i64, PersistenceError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {} WHERE {}", Self::table_name(), tree.to_sql());
        let mut params = Vec::new();
        tree.bind_into(&mut params);

        let mut query = sqlx::query(&sql);
        for p in params {
            query = bind_value(query, p);
        }
        let row = query.fetch_one(self.pool().raw()).await?;
        Ok(row.try_get::<i64, _>("cnt")?)
    }

    /// Single bind pass shared between the SET clause and the WHERE tree:
    /// SET values bind first at indices `[0, set_bindables)`, then the
    /// condition tree's own parameters follow — one `execute()` call.
    async fn update_fields_by_condition(
        &self,
        tree: Condition,
        fields: Vec<(&'static str, SetValue)>,
    ) -> Result<u64, PersistenceError> {
        let mut set_clauses = Vec::with_capacity(fields.len());
        let mut set_binds = Vec::new();
        for (column, value) in fields {
            match value {
                SetValue::Bound(v) => {
                    set_clauses.push(format!("{column} = ?"));
                    set_binds.push(v);
                }
                SetValue::Raw(expr) => {
                    set_clauses.push(format!("{column} = {expr}"));
                }
            }
        }

        let mut where_binds = Vec::new();
        tree.bind_into(&mut where_binds);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            Self::table_name(),
            set_clauses.join(", "),
            tree.to_sql()
        );

        let mut query = sqlx::query(&sql);
        for v in set_binds.into_iter().chain(where_binds.into_iter()) {
            query = bind_value(query, v);
        }
        Ok(query.execute(self.pool().raw()).await?.rows_affected())
    }

    async fn delete_by_condition(&self, tree: Condition) -> Result<u64, PersistenceError> {
        let sql = format!("DELETE FROM {} WHERE {}", Self::table_name(), tree.to_sql());
        let mut params = Vec::new();
        tree.bind_into(&mut params);

        let mut query = sqlx::query(&sql);
        for p in params {
            query = bind_value(query, p);
        }
        Ok(query.execute(self.pool().raw()).await?.rows_affected())
    }

    /// Destructive; `confirm` must be `true` or the call is a no-op that
    /// returns `Ok(())` without touching the table.
    async fn truncate_table(&self, confirm: bool) -> Result<(), PersistenceError> {
        if !confirm {
            return Ok(());
        }
        let sql = format!("TRUNCATE TABLE {}", Self::table_name());
        sqlx::query(&sql).execute(self.pool().raw()).await?;
        Ok(())
    }

    async fn drop_table(&self, confirm: bool) -> Result<(), PersistenceError> {
        if !confirm {
            return Ok(());
        }
        let sql = format!("DROP TABLE IF EXISTS {}", Self::table_name());
        sqlx::query(&sql).execute(self.pool().raw()).await?;
        Ok(())
    }
}
