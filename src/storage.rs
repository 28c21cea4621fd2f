//!
//! duit user store
//! ---------------
//! SQLite-backed persistence for user records. Only the `users` table lives
//! here; accounting tables belong to other collaborators.
//!
//! Password hashes are read and written by this module but never leave it in
//! serialized form: `User` skips the hash when serialized.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::security::{self, HashError};

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("user not found")]
    NotFound,

    #[error("username already taken: {0}")]
    Conflict(String),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub admin: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            name: row.try_get("name")?,
            password_hash: row.try_get("password")?,
            admin: row.try_get("admin")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Input for an administrative insert; the password is hashed before storage.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserUpdate {
    pub id: i64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub admin: bool,
}

const SELECT_USER: &str = "SELECT id, username, name, password, admin, created_at FROM users";

/// Cloneable handle over the connection pool.
#[derive(Clone, Debug)]
pub struct SharedStore {
    pool: SqlitePool,
}

impl SharedStore {
    /// Open (creating if needed) the database at `url` and install the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name TEXT NOT NULL,
                password TEXT NOT NULL,
                admin BOOLEAN NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seed `admin`/`admin` when no user exists. Returns true if it did.
    pub async fn ensure_default_admin(&self) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM users")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(false);
        }
        self.insert_user(&NewUser {
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            name: "Administrator".to_string(),
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
            admin: true,
        })
        .await?;
        warn!(
            user = DEFAULT_ADMIN_USERNAME,
            "created default admin account; change its password"
        );
        Ok(true)
    }

    /// Case-insensitive lookup by login name.
    pub async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE username = ?"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(User::from_row).transpose()?)
    }

    pub async fn get_user(&self, id: i64) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("{SELECT_USER} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(User::from_row).transpose()?)
    }

    pub async fn list_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query(&format!("{SELECT_USER} ORDER BY name, username"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(User::from_row).collect::<Result<_, _>>()?)
    }

    pub async fn insert_user(&self, new: &NewUser) -> StoreResult<User> {
        let hash = hash_blocking(new.password.clone()).await?;
        let id = sqlx::query(
            "INSERT INTO users (username, name, password, admin, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new.username.trim())
        .bind(new.name.trim())
        .bind(&hash)
        .bind(new.admin)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| unique_to_conflict(e, &new.username))?
        .last_insert_rowid();
        debug!(user = %new.username, id, "user inserted");
        self.get_user(id).await?.ok_or(StoreError::NotFound)
    }

    pub async fn update_user(&self, update: &UserUpdate) -> StoreResult<User> {
        let res = sqlx::query("UPDATE users SET username = ?, name = ?, admin = ? WHERE id = ?")
            .bind(update.username.trim())
            .bind(update.name.trim())
            .bind(update.admin)
            .bind(update.id)
            .execute(&self.pool)
            .await
            .map_err(|e| unique_to_conflict(e, &update.username))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_user(update.id).await?.ok_or(StoreError::NotFound)
    }

    /// Delete every listed user in one transaction; returns rows removed.
    pub async fn delete_users(&self, ids: &[i64]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM users WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Replace the stored secret hash for a user.
    pub async fn set_password_hash(&self, id: i64, hash: &str) -> StoreResult<()> {
        let res = sqlx::query("UPDATE users SET password = ? WHERE id = ?")
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Argon2 off the async worker threads.
pub async fn hash_blocking(password: String) -> StoreResult<String> {
    match tokio::task::spawn_blocking(move || security::hash_password(&password)).await {
        Ok(res) => Ok(res?),
        Err(e) => {
            error!(error = %e, "password hashing task failed");
            Err(StoreError::Task(e.to_string()))
        }
    }
}

fn unique_to_conflict(err: sqlx::Error, username: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(username.trim().to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, SharedStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("duit.db").display());
        let store = SharedStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn alice() -> NewUser {
        NewUser {
            username: "alice".into(),
            name: "Alice".into(),
            password: "correct".into(),
            admin: false,
        }
    }

    #[tokio::test]
    async fn insert_find_and_hash_is_not_plaintext() {
        let (_dir, store) = temp_store().await;
        let created = store.insert_user(&alice()).await.unwrap();
        let found = store.find_user("ALICE").await.unwrap().unwrap();
        assert_eq!(created, found);
        assert_ne!(found.password_hash, "correct");
        assert!(security::verify_password(&found.password_hash, "correct"));
        let json = serde_json::to_value(&found).unwrap();
        assert!(json.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn duplicate_username_is_conflict() {
        let (_dir, store) = temp_store().await;
        store.insert_user(&alice()).await.unwrap();
        let err = store.insert_user(&alice()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref u) if u == "alice"));
    }

    #[tokio::test]
    async fn default_admin_only_on_empty_table() {
        let (_dir, store) = temp_store().await;
        assert!(store.ensure_default_admin().await.unwrap());
        assert!(!store.ensure_default_admin().await.unwrap());
        let admin = store.find_user(DEFAULT_ADMIN_USERNAME).await.unwrap().unwrap();
        assert!(admin.admin);
    }

    #[tokio::test]
    async fn update_delete_and_missing_rows() {
        let (_dir, store) = temp_store().await;
        let u = store.insert_user(&alice()).await.unwrap();
        let updated = store
            .update_user(&UserUpdate { id: u.id, username: "alice2".into(), name: "A".into(), admin: true })
            .await
            .unwrap();
        assert_eq!(updated.username, "alice2");
        assert!(updated.admin);

        assert!(matches!(store.set_password_hash(9999, "x").await, Err(StoreError::NotFound)));
        assert_eq!(store.delete_users(&[u.id, 9999]).await.unwrap(), 1);
        assert!(store.get_user(u.id).await.unwrap().is_none());
    }
}
