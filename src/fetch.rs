// Byte-stream acquisition. The processor only ever asks one thing of a
// fetcher: resolve a URL to a readable stream of bytes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use tracing::trace;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// A readable stream of bytes. Dropping the stream releases whatever
/// connection or handle backs it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send + 'static>>;

/// Resolve a URL to a byte stream.
///
/// Implementations must be callable concurrently and must surface transient
/// transport failures distinguishably from permanent ones; the processor
/// retries the former and treats everything else as terminal (see
/// [`DownloadError::is_retryable`]).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<ByteStream, DownloadError>;
}

/// Default fetcher over a shared `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(DownloadError::from)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<ByteStream, DownloadError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }
        trace!(url = %url, http_version = ?response.version(), "Opened byte stream");
        Ok(Box::pin(response.bytes_stream().map_err(DownloadError::from)))
    }
}

/// Drain a stream into a single buffer. Used for small bodies: playlists and
/// decryption keys.
pub async fn read_to_end(mut stream: ByteStream) -> Result<Bytes, DownloadError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Wrap an in-memory buffer as a [`ByteStream`]. Handy for adapters and
/// tests that already hold the full body.
pub fn stream_from_bytes(bytes: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_to_end_concatenates_chunks() {
        let chunks: Vec<Result<Bytes, DownloadError>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let body = read_to_end(stream).await.expect("read should succeed");
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn read_to_end_propagates_mid_stream_errors() {
        let chunks: Vec<Result<Bytes, DownloadError>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(DownloadError::FetchTransient {
                reason: "connection reset".to_string(),
            }),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        assert!(read_to_end(stream).await.is_err());
    }

    #[tokio::test]
    async fn stream_from_bytes_round_trips() {
        let body = read_to_end(stream_from_bytes(Bytes::from_static(b"abc")))
            .await
            .expect("read should succeed");
        assert_eq!(body.as_ref(), b"abc");
    }
}
