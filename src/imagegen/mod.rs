use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::models::GeneratedImage;

pub mod midjourney;

pub use midjourney::MidjourneyClient;

#[derive(Debug, Error)]
pub enum ImageClientError {
    /// The service answered, but refused the job or reported it failed.
    #[error("image service rejected the request: {0}")]
    Rejected(String),
    #[error("image service transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("image job did not finish within {0:?}")]
    Timeout(Duration),
    #[error("unexpected image service response: {0}")]
    Decode(String),
}

impl ImageClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageClientError::Rejected(_) => "rejected",
            ImageClientError::Transport(_) => "transport",
            ImageClientError::Timeout(_) => "timeout",
            ImageClientError::Decode(_) => "decode",
        }
    }
}

/// One of the four thumbnails in a result grid, numbered 1 to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantSlot(u8);

impl VariantSlot {
    pub const ALL: [VariantSlot; 4] = [
        VariantSlot(1),
        VariantSlot(2),
        VariantSlot(3),
        VariantSlot(4),
    ];

    pub fn new(index: u8) -> Option<Self> {
        (1..=4).contains(&index).then_some(VariantSlot(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for VariantSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote image generation. Every call blocks until the job finishes or
/// fails; callers must still check [`GeneratedImage::is_done`].
#[async_trait]
pub trait ImageClient: Send + Sync {
    async fn imagine(&self, prompt: &str) -> Result<GeneratedImage, ImageClientError>;

    async fn upscale(
        &self,
        source: &GeneratedImage,
        slot: VariantSlot,
    ) -> Result<GeneratedImage, ImageClientError>;

    async fn variant(
        &self,
        source: &GeneratedImage,
        slot: VariantSlot,
    ) -> Result<GeneratedImage, ImageClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_one_based() {
        assert_eq!(VariantSlot::new(0), None);
        assert_eq!(VariantSlot::new(5), None);
        assert_eq!(VariantSlot::new(3).map(VariantSlot::index), Some(3));
        assert_eq!(
            VariantSlot::ALL.iter().map(|slot| slot.index()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }
}
