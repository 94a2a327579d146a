use std::sync::Arc;

use crate::config::BotMode;
use crate::db::Storage;
use crate::imagegen::ImageClient;
use crate::utils::download::Downloader;

/// Everything a handler needs. Cloned per event; the store, image client
/// and downloader are shared.
#[derive(Clone)]
pub struct AppState {
    pub mode: BotMode,
    pub auth_password: Arc<str>,
    pub storage: Arc<dyn Storage>,
    pub images: Arc<dyn ImageClient>,
    pub downloader: Arc<dyn Downloader>,
}

impl AppState {
    pub fn new(
        mode: BotMode,
        auth_password: &str,
        storage: Arc<dyn Storage>,
        images: Arc<dyn ImageClient>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        AppState {
            mode,
            auth_password: Arc::from(auth_password),
            storage,
            images,
            downloader,
        }
    }
}
