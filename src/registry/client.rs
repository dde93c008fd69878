//! HTTP client for origin blob traffic with bounded transport retries.
//!
//! Only transport failures (connect errors, timeouts) are retried, with a
//! fixed sleep between attempts.  Any HTTP response, whatever its status, is
//! handed back to the caller.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const PROGRESS_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

fn is_transport_failure(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

#[derive(Debug, Clone)]
pub struct RetryingClient {
    http: Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(http: Client, policy: RetryPolicy) -> Self {
        Self { http, policy }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send the request produced by `build`, rebuilding it for each attempt.
    pub async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build(&self.http).send().await {
                Ok(response) => return Ok(response),
                Err(e) if is_transport_failure(&e) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "transport failure, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    pub async fn head(&self, url: &str, token: Option<&str>) -> Result<Response> {
        self.send_with_retry(|http| with_bearer(http.head(url), token))
            .await
    }

    pub async fn get(&self, url: &str, token: Option<&str>) -> Result<Response> {
        self.send_with_retry(|http| with_bearer(http.get(url), token))
            .await
    }

    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// The body lands in a temporary file next to `dest` and is renamed into
    /// place only once fully written.  On any failure the temporary file is
    /// removed and `dest` is left untouched.
    #[instrument(skip(self, token), fields(%url, dest = %dest.display()))]
    pub async fn download_to(&self, url: &str, token: Option<&str>, dest: &Path) -> Result<u64> {
        let response = self.get(url, token).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let expected = response.content_length();

        let dir = dest
            .parent()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("destination has no parent dir")))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.tick().await;

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                    }
                    Some(Err(e)) => {
                        warn!(written, error = %e, "download interrupted");
                        return Err(Error::Transport(e));
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    info!(written, total = ?expected, "download progress");
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = expected {
            if expected != written {
                return Err(Error::SizeMismatch {
                    digest: url.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
        debug!(written, "download complete");
        Ok(written)
    }
}

pub(crate) fn with_bearer(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) if !token.is_empty() => builder.header(AUTHORIZATION, format!("Bearer {token}")),
        _ => builder,
    }
}
