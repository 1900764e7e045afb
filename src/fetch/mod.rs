use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

use crate::errors::DownloaderError;
use crate::models::DaemonConfig;

/// Body chunks of an opened fetch, in order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A fetch whose source answered successfully. Bytes have not been read yet.
pub struct FetchBody {
    pub content_length: Option<u64>,
    pub chunks: ChunkStream,
}

/// Trait abstracting the remote source so the executor can be tested without a network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Connect to `source_url` and return its body stream.
    ///
    /// An error here means the transfer never started.
    async fn open(&self, source_url: &str) -> Result<FetchBody, DownloaderError>;
}

/// Fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if config.connect_timeout_secs > 0 {
            builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open(&self, source_url: &str) -> Result<FetchBody, DownloaderError> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| DownloaderError::Fetch(format!("Request to {} failed: {}", source_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloaderError::Fetch(format!(
                "{} answered with HTTP {}",
                source_url, status
            )));
        }

        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .context("Failed to read response body")
            })
            .boxed();

        Ok(FetchBody {
            content_length,
            chunks,
        })
    }
}

// --- Mock implementation for testing ---

/// Configuration for creating a MockFetcher.
#[derive(Clone, Default)]
pub struct MockFetchConfig {
    /// Body chunks the mock source will produce
    pub chunks: Vec<Vec<u8>>,
    /// Whether open should fail with an error
    pub open_error: Option<String>,
    /// Fail the body after this many chunks
    pub stream_error_after: Option<usize>,
    /// Delay before each chunk in milliseconds (for timeout and cancel testing)
    pub chunk_delay_ms: u64,
}

/// Mock fetcher for testing.
pub struct MockFetcher {
    config: MockFetchConfig,
    opened: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn new(config: MockFetchConfig) -> Self {
        Self {
            config,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a MockFetcher that serves the given chunks.
    pub fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self::new(MockFetchConfig {
            chunks,
            ..Default::default()
        })
    }

    /// Create a MockFetcher with a delay before each chunk.
    pub fn with_slow_chunks(chunks: Vec<Vec<u8>>, chunk_delay_ms: u64) -> Self {
        Self::new(MockFetchConfig {
            chunks,
            chunk_delay_ms,
            ..Default::default()
        })
    }

    /// Create a MockFetcher whose open fails with the given error.
    pub fn with_open_error(error: &str) -> Self {
        Self::new(MockFetchConfig {
            open_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    /// Create a MockFetcher whose body breaks after `after` chunks.
    pub fn with_stream_error(chunks: Vec<Vec<u8>>, after: usize) -> Self {
        Self::new(MockFetchConfig {
            chunks,
            stream_error_after: Some(after),
            ..Default::default()
        })
    }

    /// How many times open has been called.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn open(&self, source_url: &str) -> Result<FetchBody, DownloaderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &self.config.open_error {
            return Err(DownloaderError::Fetch(format!("{}: {}", source_url, error)));
        }

        let mut items: Vec<Result<Vec<u8>>> = Vec::new();
        for (i, chunk) in self.config.chunks.iter().enumerate() {
            if self.config.stream_error_after == Some(i) {
                break;
            }
            items.push(Ok(chunk.clone()));
        }
        if self.config.stream_error_after.is_some() {
            items.push(Err(anyhow::anyhow!("connection reset by peer")));
        }

        let content_length = Some(self.config.chunks.iter().map(|c| c.len() as u64).sum());
        let delay = self.config.chunk_delay_ms;
        let chunks = futures_util::stream::iter(items)
            .then(move |item| async move {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                item
            })
            .boxed();

        Ok(FetchBody {
            content_length,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut chunks: ChunkStream) -> (Vec<u8>, Option<String>) {
        let mut data = Vec::new();
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => return (data, Some(e.to_string())),
            }
        }
        (data, None)
    }

    #[tokio::test]
    async fn test_mock_fetcher_serves_chunks() {
        let fetcher = MockFetcher::with_chunks(vec![b"hello ".to_vec(), b"world".to_vec()]);
        let body = fetcher.open("http://x/a.txt").await.expect("open");
        assert_eq!(body.content_length, Some(11));
        let (data, err) = drain(body.chunks).await;
        assert_eq!(data, b"hello world");
        assert!(err.is_none());
        assert_eq!(fetcher.open_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_fetcher_open_error() {
        let fetcher = MockFetcher::with_open_error("connection refused");
        match fetcher.open("http://x/a.txt").await {
            Err(DownloaderError::Fetch(msg)) => assert!(msg.contains("connection refused")),
            Err(other) => panic!("Expected Fetch error, got: {:?}", other),
            Ok(_) => panic!("Expected open to fail"),
        }
    }

    #[tokio::test]
    async fn test_mock_fetcher_stream_error_mid_body() {
        let fetcher =
            MockFetcher::with_stream_error(vec![b"abc".to_vec(), b"def".to_vec()], 1);
        let body = fetcher.open("http://x/a.txt").await.expect("open");
        let (data, err) = drain(body.chunks).await;
        assert_eq!(data, b"abc");
        assert!(err.expect("stream error").contains("reset"));
    }

    #[tokio::test]
    async fn test_http_fetcher_unreachable_host_is_fetch_error() {
        let fetcher = HttpFetcher::new(&DaemonConfig::default()).expect("build fetcher");
        let result = fetcher.open("http://127.0.0.1:1/file.png").await;
        assert!(matches!(result, Err(DownloaderError::Fetch(_))));
    }
}
