use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::db::models::GeneratedImage;
use crate::db::storage::{Storage, StorageError};

pub struct SqliteStorage {
    pool: SqlitePool,
    schema: OnceCell<()>,
    ttl: Duration,
}

impl SqliteStorage {
    /// The pool connects lazily; tables are created on first use.
    pub fn open(database_url: &str, ttl: Duration) -> Result<Self, StorageError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect_lazy(database_url)?;

        Ok(SqliteStorage {
            pool,
            schema: OnceCell::new(),
            ttl,
        })
    }

    async fn pool(&self) -> Result<&SqlitePool, StorageError> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS authorized_users (\
                        user_id INTEGER PRIMARY KEY,\
                        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
                    );",
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS generated_images (\
                        id TEXT PRIMARY KEY,\
                        payload TEXT NOT NULL,\
                        expires_at INTEGER NOT NULL\
                    );",
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_generated_images_expires_at ON generated_images(expires_at);",
                )
                .execute(&self.pool)
                .await?;

                info!("Database tables created successfully");
                Ok::<(), sqlx::Error>(())
            })
            .await?;
        Ok(&self.pool)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn add_authorized_user(&self, user_id: i64) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query("INSERT OR IGNORE INTO authorized_users (user_id) VALUES (?)")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn is_authorized(&self, user_id: i64) -> Result<bool, StorageError> {
        let pool = self.pool().await?;
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM authorized_users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(count > 0)
    }

    async fn cache_generated_image(&self, image: &GeneratedImage) -> Result<(), StorageError> {
        let payload = serde_json::to_string(image)?;
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl);
        let pool = self.pool().await?;

        let purged = sqlx::query("DELETE FROM generated_images WHERE expires_at <= ?")
            .bind(now)
            .execute(pool)
            .await?
            .rows_affected();
        if purged > 0 {
            debug!("Purged {purged} expired generated images");
        }

        sqlx::query(
            "INSERT INTO generated_images (id, payload, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, expires_at = excluded.expires_at",
        )
        .bind(&image.id)
        .bind(payload)
        .bind(expires_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn get_cached_generated_image(
        &self,
        id: &str,
    ) -> Result<Option<GeneratedImage>, StorageError> {
        let pool = self.pool().await?;
        let payload = sqlx::query_scalar::<_, String>(
            "SELECT payload FROM generated_images WHERE id = ? AND expires_at > ?",
        )
        .bind(id)
        .bind(Utc::now().timestamp())
        .fetch_optional(pool)
        .await?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str) -> GeneratedImage {
        GeneratedImage {
            id: id.to_string(),
            hash: "0f2c".to_string(),
            progress: "done".to_string(),
            uri: format!("https://cdn.example.com/{id}_grid_0f2c.png"),
            content: "a lighthouse in fog".to_string(),
        }
    }

    fn memory_storage(ttl: Duration) -> SqliteStorage {
        SqliteStorage::open("sqlite::memory:", ttl).unwrap()
    }

    #[tokio::test]
    async fn authorization_is_idempotent() {
        let storage = memory_storage(Duration::from_secs(60));
        assert!(!storage.is_authorized(42).await.unwrap());

        storage.add_authorized_user(42).await.unwrap();
        storage.add_authorized_user(42).await.unwrap();
        assert!(storage.is_authorized(42).await.unwrap());
        assert!(!storage.is_authorized(43).await.unwrap());

        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM authorized_users")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn cached_image_round_trips_and_overwrites() {
        let storage = memory_storage(Duration::from_secs(60));
        assert_eq!(storage.get_cached_generated_image("9").await.unwrap(), None);

        let mut first = image("9");
        storage.cache_generated_image(&first).await.unwrap();
        assert_eq!(
            storage.get_cached_generated_image("9").await.unwrap(),
            Some(first.clone())
        );

        first.content = "a lighthouse at dawn".to_string();
        storage.cache_generated_image(&first).await.unwrap();
        assert_eq!(
            storage.get_cached_generated_image("9").await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let storage = memory_storage(Duration::ZERO);
        storage.cache_generated_image(&image("7")).await.unwrap();
        assert_eq!(storage.get_cached_generated_image("7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_ttl_saturates_instead_of_expiring() {
        let storage = memory_storage(Duration::from_secs(u64::MAX));
        storage.cache_generated_image(&image("8")).await.unwrap();
        assert_eq!(
            storage.get_cached_generated_image("8").await.unwrap(),
            Some(image("8"))
        );
    }

    #[tokio::test]
    async fn health_check_creates_schema() {
        let storage = memory_storage(Duration::from_secs(60));
        storage.health_check().await.unwrap();
    }
}
