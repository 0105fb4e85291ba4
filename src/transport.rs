//! Async HTTP range-fetch transport: probe the remote's total size, fetch
//! byte ranges, retry transient failures.

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::config::RetryPolicy;
use crate::errors::{CacheError, CacheResult};

/// Thin wrapper around `reqwest::Client` for the two operations this crate
/// needs against an immutable remote file: a HEAD-style probe and ranged
/// GETs, both retried per `RetryPolicy`.
pub struct Transport {
    client: Client,
    url: Url,
    bearer_token: Option<String>,
    retry: RetryPolicy,
}

impl Transport {
    pub fn new(url: Url, bearer_token: Option<String>, retry: RetryPolicy) -> CacheResult<Self> {
        let client = Client::builder()
            .timeout(retry.per_attempt_timeout)
            .build()
            .map_err(CacheError::from)?;
        Ok(Self {
            client,
            url,
            bearer_token,
            retry,
        })
    }

    /// Reads `HF_TOKEN` from the environment for bearer auth.
    pub fn from_env(url: Url, retry: RetryPolicy) -> CacheResult<Self> {
        let token = std::env::var("HF_TOKEN").ok();
        Self::new(url, token, retry)
    }

    /// Determine the remote's total size and whether it honors range
    /// requests. Tries a HEAD first (cheap, no body transfer); if the host
    /// doesn't support HEAD or it comes back unsuccessful, falls back to a
    /// zero-length ranged GET, which every range-serving host must answer
    /// with a `Content-Range` header.
    pub async fn probe(&self) -> CacheResult<(u64, bool)> {
        if let Some(result) = self.try_head().await {
            return result;
        }
        let total_size = self.probe_url(&self.url.clone()).await?;
        Ok((total_size, true))
    }

    /// Attempt a HEAD probe; `None` means HEAD was unavailable/unsuccessful
    /// and the caller should fall back to a ranged GET.
    async fn try_head(&self) -> Option<CacheResult<(u64, bool)>> {
        let mut builder = self.client.head(self.url.clone());
        if let Some(token) = &self.bearer_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let response = builder.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let total_size = match total_size_from_headers(response.headers()) {
            Ok(size) => size,
            Err(_) => return None,
        };
        let supports_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Some(Ok((total_size, supports_ranges)))
    }

    /// Same as `probe`, but against an arbitrary URL rather than this
    /// transport's configured content URL (used to freshness-check the
    /// reference tree file, which lives at a different path).
    pub async fn probe_url(&self, url: &Url) -> CacheResult<u64> {
        self.with_retry(|| async {
            let response = self.send_range_request(url, 0, 0).await?;
            let status = response.status();
            if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
                return Err(status_error(status, "probe expected 206 or 200"));
            }
            total_size_from_headers(response.headers())
        })
        .await
    }

    /// Fetch `[offset, offset+len)` from the remote, verifying the server
    /// actually honored the requested range.
    pub async fn fetch_range(&self, offset: u64, len: u64) -> CacheResult<Vec<u8>> {
        self.with_retry(|| async {
            let response = self.send_range_request(&self.url, offset, len).await?;
            let status = response.status();
            if status != StatusCode::PARTIAL_CONTENT {
                return Err(status_error(status, "ranged GET expected 206"));
            }
            let bytes = response.bytes().await.map_err(CacheError::from)?;
            if bytes.len() as u64 != len {
                return Err(CacheError::Protocol(format!(
                    "requested {len} bytes, server returned {}",
                    bytes.len()
                )));
            }
            Ok(bytes.to_vec())
        })
        .await
    }

    /// Download `url` in full, used only for fetching an already-built
    /// reference tree file verbatim (never the logical content itself).
    pub async fn fetch_whole(&self, url: &Url) -> CacheResult<Vec<u8>> {
        self.with_retry(|| async {
            let mut builder = self.client.get(url.clone());
            if let Some(token) = &self.bearer_token {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
            let response = builder.send().await.map_err(CacheError::from)?;
            if !response.status().is_success() {
                return Err(CacheError::Protocol(format!(
                    "whole-file GET failed with status {}",
                    response.status()
                )));
            }
            let bytes = response.bytes().await.map_err(CacheError::from)?;
            Ok(bytes.to_vec())
        })
        .await
    }

    async fn send_range_request(
        &self,
        url: &Url,
        offset: u64,
        len: u64,
    ) -> CacheResult<reqwest::Response> {
        let range_end = if len == 0 { offset } else { offset + len - 1 };
        let range_header = format!("bytes={offset}-{range_end}");
        let mut builder = self.client.get(url.clone()).header("Range", range_header);
        if let Some(token) = &self.bearer_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.send().await.map_err(CacheError::from)
    }

    async fn with_retry<F, Fut, T>(&self, mut op: F) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CacheResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.retry.per_attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if attempt < self.retry.max_attempts && is_transient(&err) => {
                    warn!("transport attempt {attempt} failed: {err}, retrying");
                    tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) if attempt < self.retry.max_attempts => {
                    debug!("transport attempt {attempt} timed out, retrying");
                    tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                }
                Err(_elapsed) => {
                    return Err(CacheError::Exhausted(format!(
                        "timed out after {attempt} attempts"
                    )))
                }
            }
        }
    }
}

fn is_transient(err: &CacheError) -> bool {
    matches!(err, CacheError::Timeout | CacheError::Exhausted(_))
}

/// Classify an unexpected HTTP status per §4.4: 5xx and 408 are transient
/// (retried, surfaced as `Exhausted` if the retry budget runs out); every
/// other 4xx is fatal and reported as `Protocol` immediately.
fn status_error(status: StatusCode, context: &str) -> CacheError {
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CacheError::Exhausted(format!("{context}, got {status}"))
    } else {
        CacheError::Protocol(format!("{context}, got {status}"))
    }
}

fn total_size_from_headers(headers: &reqwest::header::HeaderMap) -> CacheResult<u64> {
    if let Some(content_range) = headers.get(reqwest::header::CONTENT_RANGE) {
        let value = content_range
            .to_str()
            .map_err(|_| CacheError::Protocol("non-UTF8 Content-Range header".to_string()))?;
        return parse_content_range_total(value);
    }
    if let Some(content_length) = headers.get(reqwest::header::CONTENT_LENGTH) {
        let value = content_length
            .to_str()
            .map_err(|_| CacheError::Protocol("non-UTF8 Content-Length header".to_string()))?;
        return value
            .parse()
            .map_err(|_| CacheError::Protocol(format!("malformed Content-Length: {value}")));
    }
    Err(CacheError::Protocol(
        "response carries neither Content-Range nor Content-Length".to_string(),
    ))
}

/// Parse `"bytes 0-0/12345"` into `12345`.
fn parse_content_range_total(value: &str) -> CacheResult<u64> {
    let total = value
        .rsplit('/')
        .next()
        .ok_or_else(|| CacheError::Protocol(format!("malformed Content-Range: {value}")))?;
    total
        .parse()
        .map_err(|_| CacheError::Protocol(format!("malformed Content-Range total: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345").unwrap(), 12345);
    }

    #[test]
    fn rejects_malformed_content_range() {
        assert!(parse_content_range_total("garbage").is_err());
    }
}
