use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::BotMode;
use crate::db::{Storage, StorageError};

/// Every sender passes in test mode; otherwise only members of the
/// authorized set do.
pub async fn is_user_authorized(
    mode: BotMode,
    storage: &dyn Storage,
    user_id: i64,
) -> Result<bool, StorageError> {
    if !mode.requires_authorization() {
        debug!("Authorization gate disabled, allowing user {user_id}");
        return Ok(true);
    }
    storage.is_authorized(user_id).await
}

/// Compares digests so the check takes the same time for every guess.
pub fn secret_matches(expected: &str, provided: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let expected_hash = Sha256::digest(expected.as_bytes());
    let provided_hash = Sha256::digest(provided.trim().as_bytes());
    expected_hash.as_slice().ct_eq(provided_hash.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStorage;

    #[test]
    fn secret_must_match_exactly_after_trimming() {
        assert!(secret_matches("open-sesame", "open-sesame"));
        assert!(secret_matches("open-sesame", "  open-sesame\n"));
        assert!(!secret_matches("open-sesame", "open-sesame!"));
        assert!(!secret_matches("open-sesame", ""));
        assert!(!secret_matches("", ""));
    }

    #[tokio::test]
    async fn production_mode_consults_the_store() {
        let storage = MemoryStorage::new();
        assert!(!is_user_authorized(BotMode::Production, &storage, 5).await.unwrap());
        storage.add_authorized_user(5).await.unwrap();
        assert!(is_user_authorized(BotMode::Production, &storage, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_mode_skips_the_store() {
        let storage = MemoryStorage::unavailable();
        assert!(is_user_authorized(BotMode::Test, &storage, 5).await.unwrap());
    }
}
