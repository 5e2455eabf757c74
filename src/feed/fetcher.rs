use futures::StreamExt;
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::sync::JobId;
use crate::util::validate_url;

const MAX_DOWNLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while downloading a document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// The URL was rejected before any request was made
    #[error("Refusing to fetch {0}")]
    Rejected(String),
    /// The body could not be written to its destination
    #[error("Could not write download: {0}")]
    Io(#[from] std::io::Error),
}

/// Completion notifications delivered by a [`Downloader`].
#[derive(Debug)]
pub enum FetchEvent {
    /// The body was written to the job's destination path.
    Finished(JobId),
    Failed { job_id: JobId, error: FetchError },
    /// The job was cancelled before completing.
    Removed(JobId),
}

impl FetchEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            FetchEvent::Finished(id) | FetchEvent::Removed(id) => *id,
            FetchEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Turns a URL into a local file, asynchronously.
///
/// `dispatch` returns immediately with a job id; the outcome arrives later as a
/// [`FetchEvent`] on whatever channel the implementation reports to.
pub trait Downloader {
    /// Whether `url` is something this downloader can fetch at all.
    fn could_fetch(&self, url: &str) -> bool;

    fn dispatch(&self, url: &str, dest: &Path) -> Result<JobId, FetchError>;

    /// Cancels a running job. Returns false when the job is unknown or already done.
    fn cancel(&self, job: JobId) -> bool;
}

/// Backoff for transient failures (429, 5xx, truncated bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Builds the shared HTTP client: bounded redirects, pooled connections, 30s timeout.
pub fn build_client(user_agent: &str) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    Ok(client)
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

// ============================================================================
// HTTP downloader
// ============================================================================

/// [`Downloader`] backed by reqwest, one tokio task per job.
///
/// Must be used from within a tokio runtime. Outcomes are sent on the unbounded channel
/// given at construction; a closed receiver just drops them.
pub struct HttpDownloader {
    client: reqwest::Client,
    events: mpsc::UnboundedSender<FetchEvent>,
    next_id: AtomicU64,
    running: Arc<Mutex<HashMap<JobId, AbortHandle>>>,
    retry: RetryPolicy,
    allow_private_hosts: bool,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client, events: mpsc::UnboundedSender<FetchEvent>) -> Self {
        Self {
            client,
            events,
            next_id: AtomicU64::new(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryPolicy::default(),
            allow_private_hosts: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Allows localhost and private-network URLs.
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    /// Number of jobs still running.
    pub fn running(&self) -> usize {
        lock(&self.running).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Downloader for HttpDownloader {
    fn could_fetch(&self, url: &str) -> bool {
        validate_url(url, self.allow_private_hosts).is_ok()
    }

    fn dispatch(&self, url: &str, dest: &Path) -> Result<JobId, FetchError> {
        let url = validate_url(url, self.allow_private_hosts)
            .map_err(|e| FetchError::Rejected(format!("{}: {}", url, e)))?;
        let job_id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let client = self.client.clone();
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let retry = self.retry;
        let dest: PathBuf = dest.to_path_buf();

        // Held across the spawn so the task cannot deregister itself before it is registered.
        let mut tasks = lock(&self.running);
        let handle = tokio::spawn(async move {
            let outcome = download_to_file(&client, url.as_str(), &dest, retry).await;
            lock(&running).remove(&job_id);
            let event = match outcome {
                Ok(len) => {
                    tracing::debug!(job_id = %job_id, url = %url, bytes = len, "Download finished");
                    FetchEvent::Finished(job_id)
                }
                Err(error) => {
                    tracing::warn!(job_id = %job_id, url = %url, error = %error, "Download failed");
                    FetchEvent::Failed { job_id, error }
                }
            };
            if events.send(event).is_err() {
                tracing::debug!(job_id = %job_id, "Fetch event receiver dropped");
            }
        });
        tasks.insert(job_id, handle.abort_handle());
        Ok(job_id)
    }

    fn cancel(&self, job: JobId) -> bool {
        let Some(handle) = lock(&self.running).remove(&job) else {
            return false;
        };
        handle.abort();
        tracing::debug!(job_id = %job, "Download cancelled");
        let _ = self.events.send(FetchEvent::Removed(job));
        true
    }
}

async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    retry: RetryPolicy,
) -> Result<usize, FetchError> {
    let bytes = fetch_bytes(client, url, retry).await?;
    tokio::fs::write(dest, &bytes).await?;
    Ok(bytes.len())
}

/// GETs `url`, retrying rate limits, server errors and truncated bodies with backoff.
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    retry: RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 0;

    loop {
        let response = tokio::time::timeout(REQUEST_TIMEOUT, client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if attempt >= retry.max_retries {
                return Err(FetchError::RateLimited(retry.max_retries));
            }
            let delay = retry.delay(attempt);
            tracing::warn!(
                url = %url,
                retry = attempt,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        if status.is_server_error() {
            if attempt >= retry.max_retries {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            let delay = retry.delay(attempt);
            tracing::warn!(
                url = %url,
                status = %status,
                retry = attempt,
                delay_ms = delay.as_millis() as u64,
                "Server error, retrying after delay"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        // 4xx fails immediately
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        match read_limited_bytes(response, MAX_DOWNLOAD_SIZE).await {
            Ok(bytes) => return Ok(bytes),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if attempt >= retry.max_retries {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }
                let delay = retry.delay(attempt);
                tracing::debug!(
                    url = %url,
                    expected = expected,
                    received = received,
                    attempt = attempt + 1,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
