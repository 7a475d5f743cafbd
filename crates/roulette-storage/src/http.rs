use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info_span, warn, Instrument};

/// Floor for the spacing between any two outbound requests.
pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Drops the query string, which carries the API credentials.
pub fn redact_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Time source behind [`RequestPacer`].
#[async_trait]
pub trait PacerClock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl PacerClock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: sleeping advances time instantly and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    state: std::sync::Mutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: std::sync::Mutex::new(ManualClockState::default()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.elapsed += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sleeps.clone()
    }
}

#[async_trait]
impl PacerClock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.origin + state.elapsed
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.elapsed += duration;
        state.sleeps.push(duration);
    }
}

/// Process-wide spacing of outbound requests. One instance is shared by every
/// fetcher. A caller holds its [`PacerTurn`] for the whole request, so requests
/// are serialized and the interval runs from the end of one request to the
/// start of the next.
pub struct RequestPacer {
    min_interval: Duration,
    clock: Arc<dyn PacerClock>,
    last_finished: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, Arc::new(TokioClock))
    }

    /// Intervals below [`MIN_REQUEST_INTERVAL`] are raised to it.
    pub fn with_clock(min_interval: Duration, clock: Arc<dyn PacerClock>) -> Self {
        Self {
            min_interval: min_interval.max(MIN_REQUEST_INTERVAL),
            clock,
            last_finished: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until `min_interval` has passed since the previous request
    /// finished. The returned turn must be held until the response is read.
    pub async fn wait_turn(&self) -> PacerTurn<'_> {
        let last = self.last_finished.lock().await;
        if let Some(previous) = *last {
            let since = self.clock.now().saturating_duration_since(previous);
            if since < self.min_interval {
                let wait = self.min_interval - since;
                debug!(wait_ms = wait.as_millis() as u64, "pacing outbound request");
                self.clock.sleep(wait).await;
            }
        }
        PacerTurn {
            last_finished: last,
            clock: self.clock.as_ref(),
        }
    }

    /// Sleeps on the pacer's clock without holding a turn.
    pub async fn backoff(&self, delay: Duration) {
        self.clock.sleep(delay).await;
    }
}

/// Exclusive right to send one request. Dropping it records the finish time.
#[must_use = "the request slot ends when the turn is dropped"]
pub struct PacerTurn<'a> {
    last_finished: MutexGuard<'a, Option<Instant>>,
    clock: &'a dyn PacerClock,
}

impl Drop for PacerTurn<'_> {
    fn drop(&mut self) {
        *self.last_finished = Some(self.clock.now());
    }
}

/// Result of one paced attempt inside [`with_retries`].
#[derive(Debug)]
pub enum Attempt<T> {
    Done(Result<T, FetchError>),
    Retry(FetchError),
}

/// Runs `attempt` under a pacer turn until it is done or the retry budget is
/// spent. Backoff sleeps go through the pacer's clock.
pub async fn with_retries<T, F, Fut>(
    pacer: &RequestPacer,
    backoff: &BackoffPolicy,
    mut attempt: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut retries = 0usize;
    loop {
        let turn = pacer.wait_turn().await;
        let outcome = attempt().await;
        drop(turn);

        match outcome {
            Attempt::Done(result) => return result,
            Attempt::Retry(err) if retries < backoff.max_retries => {
                warn!(error = %err, attempt = retries, "retryable failure");
                pacer.backoff(backoff.delay_for_attempt(retries)).await;
                retries += 1;
            }
            Attempt::Retry(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// Final URL without its query string.
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("cannot build request url for {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Arc<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, pacer: Arc<RequestPacer>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer,
            backoff: config.backoff,
        })
    }

    pub fn pacer(&self) -> &Arc<RequestPacer> {
        &self.pacer
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %redact_url(url));
        self.fetch_with_retries(url).instrument(span).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, source_id: &str, url: &str) -> Result<T, FetchError> {
        let response = self.fetch_bytes(source_id, url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        with_retries(&self.pacer, &self.backoff, move || self.attempt(url)).await
    }

    async fn attempt(&self, url: &str) -> Attempt<FetchedResponse> {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.without_url();
                return match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable => Attempt::Retry(FetchError::Request(err)),
                    RetryDisposition::NonRetryable => Attempt::Done(Err(FetchError::Request(err))),
                };
            }
        };

        let status = resp.status();
        let final_url = redact_url(resp.url().as_str());
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return match classify_status(status) {
                RetryDisposition::Retryable => Attempt::Retry(err),
                RetryDisposition::NonRetryable => Attempt::Done(Err(err)),
            };
        }

        match resp.bytes().await {
            Ok(body) => {
                debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                Attempt::Done(Ok(FetchedResponse {
                    status,
                    final_url,
                    body: body.to_vec(),
                }))
            }
            Err(err) => Attempt::Done(Err(FetchError::Request(err.without_url()))),
        }
    }
}
