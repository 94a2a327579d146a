use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::utils::http::get_http_client;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid download url {0}")]
    InvalidUrl(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A downloaded file that is removed from disk when dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        ScratchFile { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed scratch file {}", self.path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove scratch file {}: {err}", self.path.display()),
        }
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, uri: &str) -> Result<ScratchFile, TransferError>;
}

/// Extension of the last path segment, ignoring any query string.
pub fn extension_from_uri(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.last()?;
    let (_, extension) = segment.rsplit_once('.')?;
    if extension.is_empty() || !extension.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

pub struct HttpDownloader {
    client: Client,
    dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(dir: PathBuf) -> Self {
        HttpDownloader {
            client: get_http_client().clone(),
            dir,
        }
    }

    fn scratch_path(&self, url: &Url) -> PathBuf {
        let name = match extension_from_uri(url) {
            Some(extension) => format!("{}.{extension}", Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        self.dir.join(name)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, uri: &str) -> Result<ScratchFile, TransferError> {
        let url = Url::parse(uri).map_err(|_| TransferError::InvalidUrl(uri.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::InvalidUrl(uri.to_string()));
        }

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| TransferError::Request {
                url: uri.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: uri.to_string(),
                status,
            });
        }

        // Declared before the handle so a failed transfer closes the file
        // first and then removes it.
        let scratch = ScratchFile::new(self.scratch_path(&url));
        let io_error = |source| TransferError::Io {
            path: scratch.path().to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(scratch.path())
            .await
            .map_err(io_error)?;

        let mut written = 0usize;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| TransferError::Request {
                url: uri.to_string(),
                source,
            })?
        {
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len();
        }
        file.flush().await.map_err(io_error)?;
        drop(file);

        info!("Image downloaded as {} ({written} bytes)", scratch.path().display());
        Ok(scratch)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serves one canned HTTP response and returns the base url.
    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 2048];
            let mut request = Vec::new();
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn extension_ignores_query_and_fragment() {
        let url = Url::parse("https://cdn.example.com/a/b/grid_0_abc.PNG?ex=1&is=2#x").unwrap();
        assert_eq!(extension_from_uri(&url).as_deref(), Some("png"));

        let url = Url::parse("https://cdn.example.com/a/b/noext").unwrap();
        assert_eq!(extension_from_uri(&url), None);

        let url = Url::parse("https://cdn.example.com/v1.2/").unwrap();
        assert_eq!(extension_from_uri(&url), None);
    }

    #[tokio::test]
    async fn downloads_into_file_with_source_extension() {
        let base =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nPNG!")
                .await;
        let dir = tempfile::tempdir().unwrap();
        let downloader = HttpDownloader::new(dir.path().to_path_buf());

        let file = downloader
            .download(&format!("{base}/attachments/cat_1234.png?size=full"))
            .await
            .unwrap();
        assert_eq!(file.path().extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(std::fs::read(file.path()).unwrap(), b"PNG!");

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn non_success_status_leaves_nothing_behind() {
        let base = serve_once(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let downloader = HttpDownloader::new(dir.path().to_path_buf());

        let err = downloader
            .download(&format!("{base}/missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Status { status, .. } if status == StatusCode::NOT_FOUND
        ));
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn truncated_body_removes_partial_file() {
        let base = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nonly-a-few-bytes",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let downloader = HttpDownloader::new(dir.path().to_path_buf());

        let err = downloader
            .download(&format!("{base}/partial.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Request { .. }));
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = HttpDownloader::new(dir.path().to_path_buf());
        let err = downloader.download("file:///etc/passwd").await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidUrl(_)));
    }
}
