use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use url::Url;

use crate::db::models::{GeneratedImage, PROGRESS_DONE};
use crate::handlers::responses::{ActionGrid, ChatReplier};
use crate::imagegen::{ImageClient, ImageClientError, VariantSlot};
use crate::utils::download::{extension_from_uri, Downloader, ScratchFile, TransferError};

pub fn done_image(id: &str) -> GeneratedImage {
    GeneratedImage {
        id: id.to_string(),
        hash: format!("hash-{id}"),
        progress: PROGRESS_DONE.to_string(),
        uri: format!("https://cdn.example.com/grid_{id}.png"),
        content: "a red fox".to_string(),
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    TextWithGrid { text: String, grid: ActionGrid },
    Photo { path: PathBuf, existed: bool, grid: ActionGrid },
    Document { path: PathBuf, existed: bool },
}

/// Records every reply. `existed` captures whether the file was on disk at
/// send time, so tests can check cleanup afterwards.
pub struct RecordingReplier {
    replies: Mutex<Vec<Reply>>,
    fail_photos: AtomicBool,
}

impl RecordingReplier {
    pub fn new() -> Self {
        RecordingReplier {
            replies: Mutex::new(Vec::new()),
            fail_photos: AtomicBool::new(false),
        }
    }

    pub fn fail_photos(&self) {
        self.fail_photos.store(true, Ordering::SeqCst);
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.replies
            .lock()
            .iter()
            .filter_map(|reply| match reply {
                Reply::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatReplier for RecordingReplier {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.replies.lock().push(Reply::Text(text.to_string()));
        Ok(())
    }

    async fn send_text_with_grid(&self, text: &str, grid: &ActionGrid) -> Result<()> {
        self.replies.lock().push(Reply::TextWithGrid {
            text: text.to_string(),
            grid: grid.clone(),
        });
        Ok(())
    }

    async fn send_photo(&self, path: &Path, grid: &ActionGrid) -> Result<()> {
        if self.fail_photos.load(Ordering::SeqCst) {
            return Err(anyhow!("photo rejected"));
        }
        self.replies.lock().push(Reply::Photo {
            path: path.to_path_buf(),
            existed: path.exists(),
            grid: grid.clone(),
        });
        Ok(())
    }

    async fn send_document(&self, path: &Path) -> Result<()> {
        self.replies.lock().push(Reply::Document {
            path: path.to_path_buf(),
            existed: path.exists(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageCall {
    Imagine(String),
    Upscale(String, u8),
    Variant(String, u8),
}

enum Behavior {
    Progress(String),
    Fail,
}

/// Answers instantly with ids counting up from 1001.
pub struct FakeImageClient {
    behavior: Behavior,
    next_id: AtomicU64,
    calls: Mutex<Vec<ImageCall>>,
}

impl FakeImageClient {
    pub fn done() -> Self {
        Self::with_progress(PROGRESS_DONE)
    }

    pub fn with_progress(progress: &str) -> Self {
        Self::with_behavior(Behavior::Progress(progress.to_string()))
    }

    pub fn failing() -> Self {
        Self::with_behavior(Behavior::Fail)
    }

    fn with_behavior(behavior: Behavior) -> Self {
        FakeImageClient {
            behavior,
            next_id: AtomicU64::new(1001),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ImageCall> {
        self.calls.lock().clone()
    }

    fn respond(&self, call: ImageCall, content: &str) -> Result<GeneratedImage, ImageClientError> {
        self.calls.lock().push(call);
        match &self.behavior {
            Behavior::Fail => Err(ImageClientError::Rejected("job failed".to_string())),
            Behavior::Progress(progress) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
                Ok(GeneratedImage {
                    hash: format!("hash-{id}"),
                    progress: progress.clone(),
                    uri: format!("https://cdn.example.com/grid_{id}.png"),
                    content: content.to_string(),
                    id,
                })
            }
        }
    }
}

#[async_trait]
impl ImageClient for FakeImageClient {
    async fn imagine(&self, prompt: &str) -> Result<GeneratedImage, ImageClientError> {
        self.respond(ImageCall::Imagine(prompt.to_string()), prompt)
    }

    async fn upscale(
        &self,
        source: &GeneratedImage,
        slot: VariantSlot,
    ) -> Result<GeneratedImage, ImageClientError> {
        self.respond(ImageCall::Upscale(source.id.clone(), slot.index()), &source.content)
    }

    async fn variant(
        &self,
        source: &GeneratedImage,
        slot: VariantSlot,
    ) -> Result<GeneratedImage, ImageClientError> {
        self.respond(ImageCall::Variant(source.id.clone(), slot.index()), &source.content)
    }
}

/// Writes a small placeholder file per request into a private temp dir.
pub struct FakeDownloader {
    dir: TempDir,
    fail: bool,
    counter: AtomicU64,
    requested: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeDownloader {
    pub fn new() -> Self {
        FakeDownloader {
            dir: TempDir::new().expect("temp dir"),
            fail: false,
            counter: AtomicU64::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        FakeDownloader {
            fail: true,
            ..FakeDownloader::new()
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().iter().map(|(uri, _)| uri.clone()).collect()
    }

    pub fn requested_paths(&self) -> Vec<PathBuf> {
        self.requested.lock().iter().map(|(_, path)| path.clone()).collect()
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(&self, uri: &str) -> Result<ScratchFile, TransferError> {
        let url = Url::parse(uri).map_err(|_| TransferError::InvalidUrl(uri.to_string()))?;
        let extension = extension_from_uri(&url).unwrap_or_else(|| "bin".to_string());
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("{index}.{extension}"));
        self.requested.lock().push((uri.to_string(), path.clone()));

        if self.fail {
            return Err(TransferError::InvalidUrl(uri.to_string()));
        }
        std::fs::write(&path, b"image").map_err(|source| TransferError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(ScratchFile::new(path))
    }
}
