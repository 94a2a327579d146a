use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::StorageBackend;
use crate::db::database::SqliteStorage;
use crate::db::models::GeneratedImage;
use crate::db::redis_store::RedisStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("failed to encode cached image: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid storage address: {0}")]
    Address(String),
}

/// Authorized-user set plus the expiring cache of generated images, over one
/// connection that is opened on first use.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn add_authorized_user(&self, user_id: i64) -> Result<(), StorageError>;

    async fn is_authorized(&self, user_id: i64) -> Result<bool, StorageError>;

    /// Overwrites any existing entry and restarts its expiry.
    async fn cache_generated_image(&self, image: &GeneratedImage) -> Result<(), StorageError>;

    /// `None` when the entry never existed or has expired.
    async fn get_cached_generated_image(
        &self,
        id: &str,
    ) -> Result<Option<GeneratedImage>, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;

    async fn close(&self);
}

pub fn open_storage(
    backend: &StorageBackend,
    ttl: Duration,
) -> Result<Arc<dyn Storage>, StorageError> {
    match backend {
        StorageBackend::Redis {
            host,
            port,
            password,
        } => {
            info!("Using redis storage at {host}:{port}");
            let storage = RedisStorage::open(host, *port, password.as_deref(), ttl)?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Sqlite { database_url } => {
            info!("Using sqlite storage at {database_url}");
            let storage = SqliteStorage::open(database_url, ttl)?;
            Ok(Arc::new(storage))
        }
    }
}
