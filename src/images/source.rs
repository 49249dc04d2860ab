use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::images::tools::{self, TranscodeError};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.4 Safari/605.1.15";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("No remotes configured")]
    NoRemotes,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response status code {0}")]
    BadUpstreamStatus(u16),

    #[error("No image URL found in response from {0}")]
    NoImageUrlFound(String),

    #[error("Filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("Blocking task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl FetchError {
    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FetchError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure came from the upstream side rather than from us.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::BadUpstreamStatus(_) | FetchError::NoImageUrlFound(_)
        )
    }
}

/// What a remote answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum Located {
    /// The response body already is the image.
    Inline { data: Vec<u8>, extension: String },
    /// The response wrapped a link to the real image.
    Link { url: String, extension: String },
}

impl Located {
    pub fn extension(&self) -> &str {
        match self {
            Located::Inline { extension, .. } | Located::Link { extension, .. } => extension,
        }
    }
}

/// Network side of a remote fetch.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Queries a remote and works out where the image bytes are.
    async fn locate(&self, remote: &str) -> Result<Located, FetchError>;

    /// Streams `url` into the file at `dest`, returning the byte count.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

pub fn is_accepted_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
    )
}

/// `ImageSource` backed by a shared reqwest client.
pub struct RemoteFetcher {
    client: Client,
}

impl RemoteFetcher {
    pub fn new(timeout: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ImageSource for RemoteFetcher {
    async fn locate(&self, remote: &str) -> Result<Located, FetchError> {
        let response = self
            .client
            .get(remote)
            .header("Accept", "image/avif,image/webp,image/png,image/jpeg,application/json,text/html;q=0.9,*/*;q=0.8")
            .send()
            .await?;

        let status = response.status();
        if !is_accepted_status(status) {
            log::error!("Remote {} answered with status: {}", remote, status);
            return Err(FetchError::BadUpstreamStatus(status.as_u16()));
        }

        let extension = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .and_then(tools::extension_for_mime);

        if let Some(extension) = extension {
            log::debug!("Remote {} returned the image directly", remote);
            let data = response.bytes().await?.to_vec();
            return Ok(Located::Inline {
                data,
                extension: extension.to_string(),
            });
        }

        let body = response.text().await?;
        let url = tools::extract_image_url(&body)
            .ok_or_else(|| FetchError::NoImageUrlFound(remote.to_string()))?;
        let extension = tools::image_extension(&url).unwrap_or_else(|| "jpg".to_string());

        Ok(Located::Link { url, extension })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !is_accepted_status(status) {
            log::error!("Image download from {} failed with status: {}", url, status);
            return Err(FetchError::BadUpstreamStatus(status.as_u16()));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FetchError::filesystem(dest, e))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::filesystem(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| FetchError::filesystem(dest, e))?;

        Ok(written)
    }
}
