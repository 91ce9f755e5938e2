// src/transport.rs

use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("TLS validation failed: {0}")]
    Tls(#[source] reqwest::Error),
    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },
}

impl TransportError {
    /// Map a reqwest failure onto the connection/TLS taxonomy.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if is_tls_error(&err) {
            TransportError::Tls(err)
        } else {
            TransportError::Connection(err)
        }
    }
}

fn is_tls_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string();
        if text.contains("certificate") || text.contains("handshake") {
            return true;
        }
        source = e.source();
    }
    false
}

/// An open transfer: the response body plus what the server told us about it.
pub struct Transfer {
    pub response: reqwest::Response,
    /// Total file size including any already-downloaded prefix, when known.
    pub total_size: Option<u64>,
    /// Offset the server actually honored; 0 means the Range was ignored
    /// and the caller must restart the staging file from scratch.
    pub resumed_from: u64,
}

/// Issues HTTP(S) requests and yields byte streams with range-resume support.
/// Writes nothing to disk itself.
#[derive(Clone)]
pub struct TransportClient {
    client: Client,
}

impl TransportClient {
    /// Build a client with the given timeout. With `verify_tls` false,
    /// certificate validation is disabled (trusted-LAN servers only).
    pub fn new(verify_tls: bool, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .unwrap_or_else(|err| {
                warn!("transport: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Open a transfer, optionally resuming from a byte offset.
    pub async fn open(&self, url: &str, offset: u64) -> Result<Transfer, TransportError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();

        if status == StatusCode::PARTIAL_CONTENT {
            let total = content_range_total(response.headers())
                .or_else(|| response.content_length().map(|len| offset + len));
            Ok(Transfer {
                response,
                total_size: total,
                resumed_from: offset,
            })
        } else if status.is_success() {
            // Full content: the server ignored the Range header (if any).
            let total = response.content_length();
            Ok(Transfer {
                response,
                total_size: total,
                resumed_from: 0,
            })
        } else {
            Err(TransportError::HttpStatus {
                status: status.as_u16(),
            })
        }
    }

    /// Fetch a whole small resource (manifests) into memory.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?;
        Ok(bytes.to_vec())
    }
}

/// Total size from a `Content-Range: bytes start-end/total` header.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    total.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 500-999/1000"),
        );
        assert_eq!(content_range_total(&headers), Some(1000));
    }

    #[test]
    fn content_range_without_total_is_none() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 500-999/*"),
        );
        assert_eq!(content_range_total(&headers), None);
        assert_eq!(content_range_total(&HeaderMap::new()), None);
    }
}
