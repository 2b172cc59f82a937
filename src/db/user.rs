//! The `users` table and its mapper — the one concrete entity the gateway
//! needs from the persistence layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::condition::{Condition, SetValue, SqlValue};
use crate::db::mapper::Mapper;
use crate::db::pool::DbPool;
use crate::errors::PersistenceError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: u64,
    pub uuid: String,
    pub username: String,
    pub email: String,
    pub password_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct UserMapper {
    pool: DbPool,
}

impl UserMapper {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, PersistenceError> {
        self.query_entities_by_condition(Condition::eq("email", email), None, Default::default())
            .await
            .map(|mut rows| rows.pop())
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>, PersistenceError> {
        self.query_entities_by_condition(Condition::eq("username", username), None, Default::default())
            .await
            .map(|mut rows| rows.pop())
    }

    pub async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<User>, PersistenceError> {
        self.query_entities_by_condition(
            Condition::eq("uuid", uuid.to_string()),
            None,
            Default::default(),
        )
        .await
        .map(|mut rows| rows.pop())
    }

    pub async fn create(&self, username: &str, email: &str, password_digest: &str) -> Result<Uuid, PersistenceError> {
        let uuid = Uuid::new_v4();
        self.insert(
            &["uuid", "username", "email", "password_digest"],
            vec![
                SqlValue::Str(uuid.to_string()),
                SqlValue::Str(username.to_string()),
                SqlValue::Str(email.to_string()),
                SqlValue::Str(password_digest.to_string()),
            ],
        )
        .await?;
        Ok(uuid)
    }

    pub async fn update_password(&self, uuid: Uuid, new_digest: &str) -> Result<u64, PersistenceError> {
        self.update_fields_by_condition(
            Condition::eq("uuid", uuid.to_string()),
            vec![
                ("password_digest", SetValue::Bound(SqlValue::Str(new_digest.to_string()))),
                ("updated_at", SetValue::Raw("NOW(3)".to_string())),
            ],
        )
        .await
    }
}

#[async_trait]
impl Mapper<User, u64> for UserMapper {
    fn table_name() -> &'static str {
        "users"
    }

    fn pk_column() -> &'static str {
        "id"
    }

    fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn create_table_sql() -> &'static str {
        include_str!("../../migrations/001_init.sql")
    }
}
