use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::store::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub user_id: i64,
    pub name: String,
    pub last_name: String,
}

/// Read-only lookup of the people who own orders. Credentials live with the
/// authentication service and are never read here.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find(&self, user_id: i64) -> Result<Option<UserSummary>, StoreError>;
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: DashMap<i64, UserSummary>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserSummary) {
        self.users.insert(user.user_id, user);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find(&self, user_id: i64) -> Result<Option<UserSummary>, StoreError> {
        Ok(self.users.get(&user_id).map(|entry| entry.value().clone()))
    }
}

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find(&self, user_id: i64) -> Result<Option<UserSummary>, StoreError> {
        let row = sqlx::query("select user_id, name, last_name from users where user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(format!("select user failed: {err}")))?;

        row.map(|row| {
            Ok(UserSummary {
                user_id: row
                    .try_get("user_id")
                    .map_err(|err| StoreError::Backend(err.to_string()))?,
                name: row
                    .try_get("name")
                    .map_err(|err| StoreError::Backend(err.to_string()))?,
                last_name: row
                    .try_get("last_name")
                    .map_err(|err| StoreError::Backend(err.to_string()))?,
            })
        })
        .transpose()
    }
}
