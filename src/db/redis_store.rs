use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::db::models::GeneratedImage;
use crate::db::storage::{Storage, StorageError};

pub const AUTHORIZED_USERS_KEY: &str = "MJ_KNOWN_PERSONS";
const GENERATED_IMAGE_PREFIX: &str = "generated:";

pub fn generated_image_key(id: &str) -> String {
    format!("{GENERATED_IMAGE_PREFIX}{id}")
}

fn redis_url(host: &str, port: u16, password: Option<&str>) -> Result<Url, StorageError> {
    let mut url = Url::parse(&format!("redis://{host}:{port}/"))
        .map_err(|err| StorageError::Address(format!("{host}:{port}: {err}")))?;
    if let Some(password) = password {
        url.set_password(Some(password))
            .map_err(|_| StorageError::Address(format!("{host}:{port}: cannot carry a password")))?;
    }
    Ok(url)
}

pub struct RedisStorage {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    ttl: Duration,
}

impl RedisStorage {
    /// Validates the address only; the connection is made on first use.
    pub fn open(
        host: &str,
        port: u16,
        password: Option<&str>,
        ttl: Duration,
    ) -> Result<Self, StorageError> {
        let url = redis_url(host, port, password)?;
        let client = redis::Client::open(url.as_str())?;
        Ok(RedisStorage {
            client,
            connection: Mutex::new(None),
            ttl,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.client.get_connection_manager().await?;
        info!("Redis connection established");
        *guard = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn add_authorized_user(&self, user_id: i64) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        conn.sadd::<_, _, ()>(AUTHORIZED_USERS_KEY, user_id.to_string())
            .await?;
        Ok(())
    }

    async fn is_authorized(&self, user_id: i64) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let member = conn
            .sismember::<_, _, bool>(AUTHORIZED_USERS_KEY, user_id.to_string())
            .await?;
        Ok(member)
    }

    async fn cache_generated_image(&self, image: &GeneratedImage) -> Result<(), StorageError> {
        let payload = serde_json::to_string(image)?;
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(
            generated_image_key(&image.id),
            payload,
            self.ttl.as_secs().max(1),
        )
        .await?;
        debug!("Cached generated image {}", image.id);
        Ok(())
    }

    async fn get_cached_generated_image(
        &self,
        id: &str,
    ) -> Result<Option<GeneratedImage>, StorageError> {
        let mut conn = self.connection().await?;
        let payload = conn
            .get::<_, Option<String>>(generated_image_key(id))
            .await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        conn.exists::<_, bool>(AUTHORIZED_USERS_KEY).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Redis connection closed");
        }
    }
}
