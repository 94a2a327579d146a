use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::models::GeneratedImage;
use crate::db::storage::{Storage, StorageError};

/// In-process storage used by handler tests. `fail` makes every call error
/// out the way an unreachable store would.
pub struct MemoryStorage {
    authorized: Mutex<HashSet<i64>>,
    images: Mutex<HashMap<String, (GeneratedImage, Instant)>>,
    ttl: Duration,
    fail: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            authorized: Mutex::new(HashSet::new()),
            images: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(60 * 60 * 24),
            fail: false,
        }
    }

    pub fn unavailable() -> Self {
        MemoryStorage {
            fail: true,
            ..MemoryStorage::new()
        }
    }

    pub fn authorized_count(&self) -> usize {
        self.authorized.lock().len()
    }

    pub fn cached_count(&self) -> usize {
        self.images.lock().len()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail {
            return Err(StorageError::Address("memory storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add_authorized_user(&self, user_id: i64) -> Result<(), StorageError> {
        self.check()?;
        self.authorized.lock().insert(user_id);
        Ok(())
    }

    async fn is_authorized(&self, user_id: i64) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self.authorized.lock().contains(&user_id))
    }

    async fn cache_generated_image(&self, image: &GeneratedImage) -> Result<(), StorageError> {
        self.check()?;
        self.images
            .lock()
            .insert(image.id.clone(), (image.clone(), Instant::now() + self.ttl));
        Ok(())
    }

    async fn get_cached_generated_image(
        &self,
        id: &str,
    ) -> Result<Option<GeneratedImage>, StorageError> {
        self.check()?;
        let images = self.images.lock();
        Ok(images
            .get(id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(image, _)| image.clone()))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.check()
    }

    async fn close(&self) {}
}
