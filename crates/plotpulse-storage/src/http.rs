//! Polite HTTP session: user-agent rotation, 429 handling, retries and pacing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, RETRY_AFTER, USER_AGENT,
};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const USER_AGENT_POOL: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
    }

    /// `Retry-After` in whole seconds; HTTP-date values are ignored.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited {hits} consecutive times at {url}")]
    RateLimited { hits: u32, url: String },
    #[error("request to {url} failed after {attempts} attempts: {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("gave up on {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: &OutboundRequest,
        user_agent: &str,
    ) -> Result<FetchedResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &OutboundRequest,
        user_agent: &str,
    ) -> Result<FetchedResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header(USER_AGENT, user_agent);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            headers,
            body,
        })
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Network failures wait `step * attempt`.
    pub network_step: Duration,
    /// Waits after the 1st, 2nd, ... consecutive 429 when no `Retry-After` is sent.
    pub rate_limit_waits: Vec<Duration>,
    pub max_consecutive_rate_limits: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            network_step: Duration::from_secs(2),
            rate_limit_waits: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            max_consecutive_rate_limits: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn network_delay(&self, attempt_index: u32) -> Duration {
        self.network_step.saturating_mul(attempt_index + 1)
    }

    pub fn rate_limit_wait(&self, hits: u32) -> Duration {
        let idx = (hits.max(1) - 1) as usize;
        self.rate_limit_waits
            .get(idx)
            .or(self.rate_limit_waits.last())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone)]
pub struct PacingPolicy {
    pub base_delay: Duration,
    pub variation: Duration,
    pub min_delay: Duration,
    pub break_every: u64,
    pub break_min: Duration,
    pub break_max: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            variation: Duration::from_secs(1),
            min_delay: Duration::from_millis(500),
            break_every: 50,
            break_min: Duration::from_secs(10),
            break_max: Duration::from_secs(30),
        }
    }
}

impl PacingPolicy {
    pub fn with_delay(mut self, base_delay: Duration, variation: Duration) -> Self {
        self.base_delay = base_delay;
        self.variation = variation;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub pacing: PacingPolicy,
    pub backoff: BackoffPolicy,
    /// Successful requests between user-agent rotations, drawn from this inclusive range.
    pub rotation_range: (u64, u64),
    pub rng_seed: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pacing: PacingPolicy::default(),
            backoff: BackoffPolicy::default(),
            rotation_range: (10, 20),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub request_count: u64,
    pub consecutive_rate_limits: u32,
    pub user_agent: String,
    pub next_rotation_at: u64,
}

pub struct HttpSession {
    source_id: String,
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    pacing: PacingPolicy,
    backoff: BackoffPolicy,
    rotation_range: (u64, u64),
    rng: StdRng,
    state: SessionState,
}

impl HttpSession {
    pub fn new(
        source_id: impl Into<String>,
        config: &HttpClientConfig,
        transport: Arc<dyn HttpTransport>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut session = Self {
            source_id: source_id.into(),
            transport,
            sleeper,
            pacing: config.pacing.clone(),
            backoff: config.backoff.clone(),
            rotation_range: config.rotation_range,
            rng,
            state: SessionState {
                request_count: 0,
                consecutive_rate_limits: 0,
                user_agent: String::new(),
                next_rotation_at: 0,
            },
        };
        session.rotate_user_agent();
        session
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn rotate_user_agent(&mut self) {
        let next = USER_AGENT_POOL
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(USER_AGENT_POOL[0]);
        self.state.user_agent = next.to_string();
        let (lo, hi) = self.rotation_range;
        let interval = self.rng.random_range(lo.max(1)..=hi.max(lo.max(1)));
        self.state.next_rotation_at = self.state.request_count + interval;
    }

    /// Randomized pause after a successful request, never below the pacing floor.
    pub fn human_delay(&mut self) -> Duration {
        let base = self.pacing.base_delay.as_secs_f64();
        let variation = self.pacing.variation.as_secs_f64();
        let jitter = if variation > 0.0 {
            self.rng.random_range(-variation..=variation)
        } else {
            0.0
        };
        let floor = self.pacing.min_delay.as_secs_f64();
        Duration::from_secs_f64((base + jitter).max(floor))
    }

    fn break_duration(&mut self) -> Duration {
        let lo = self.pacing.break_min.as_secs_f64();
        let hi = self.pacing.break_max.as_secs_f64();
        if hi > lo {
            Duration::from_secs_f64(self.rng.random_range(lo..=hi))
        } else {
            self.pacing.break_min
        }
    }

    async fn pace(&mut self) {
        let delay = self.human_delay();
        self.sleeper.sleep(delay).await;

        let every = self.pacing.break_every;
        if every > 0 && self.state.request_count % every == 0 {
            let pause = self.break_duration();
            info!(
                requests = self.state.request_count,
                pause_secs = pause.as_secs_f64(),
                "taking a break"
            );
            self.sleeper.sleep(pause).await;
        }
    }

    /// Longer pause taken between two targets of the same source.
    pub async fn target_break(&mut self) {
        let pause = self.break_duration();
        debug!(pause_secs = pause.as_secs_f64(), "pausing between targets");
        self.sleeper.sleep(pause).await;
    }

    /// Sends one request under the session's retry, rate-limit and pacing policy.
    ///
    /// `max_retries` bounds the total number of attempts; every 429 and every
    /// network failure consumes one.
    pub async fn request(
        &mut self,
        request: &OutboundRequest,
        max_retries: u32,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!(
            "http_fetch",
            source_id = %self.source_id,
            method = %request.method,
            url = %request.url
        );
        self.request_with_policy(request, max_retries.max(1))
            .instrument(span)
            .await
    }

    async fn request_with_policy(
        &mut self,
        request: &OutboundRequest,
        attempts: u32,
    ) -> Result<FetchedResponse, FetchError> {
        for attempt in 0..attempts {
            if self.state.request_count >= self.state.next_rotation_at {
                self.rotate_user_agent();
                debug!(user_agent = %self.state.user_agent, "rotated user agent");
            }

            let result = self.transport.send(request, &self.state.user_agent).await;
            match result {
                Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                    self.state.consecutive_rate_limits += 1;
                    let hits = self.state.consecutive_rate_limits;
                    warn!(hits, "rate limit hit");
                    if hits >= self.backoff.max_consecutive_rate_limits {
                        warn!(hits, "rate limited too often, stopping");
                        return Err(FetchError::RateLimited {
                            hits,
                            url: request.url.clone(),
                        });
                    }

                    let wait = response
                        .retry_after()
                        .unwrap_or_else(|| self.backoff.rate_limit_wait(hits));
                    info!(wait_secs = wait.as_secs(), "waiting before retry");
                    self.sleeper.sleep(wait).await;
                    self.rotate_user_agent();
                }
                Ok(response) if !response.status.is_success() => {
                    warn!(status = response.status.as_u16(), "http error");
                    return Err(FetchError::HttpStatus {
                        status: response.status.as_u16(),
                        url: response.final_url,
                    });
                }
                Ok(response) => {
                    self.state.consecutive_rate_limits = 0;
                    self.state.request_count += 1;
                    debug!(
                        status = response.status.as_u16(),
                        bytes = response.body.len(),
                        "fetched"
                    );
                    self.pace().await;
                    return Ok(response);
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "request failed");
                    if attempt + 1 >= attempts {
                        return Err(FetchError::Transport {
                            url: request.url.clone(),
                            attempts,
                            source: err,
                        });
                    }
                    let wait = self.backoff.network_delay(attempt);
                    info!(wait_secs = wait.as_secs(), "retrying");
                    self.sleeper.sleep(wait).await;
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            url: request.url.clone(),
            attempts,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<FetchedResponse, TransportError>>>,
        user_agents: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with(script: Vec<Result<FetchedResponse, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                user_agents: Mutex::default(),
            }
        }

        fn calls(&self) -> usize {
            self.user_agents.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            _request: &OutboundRequest,
            user_agent: &str,
        ) -> Result<FetchedResponse, TransportError> {
            self.user_agents.lock().unwrap().push(user_agent.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(200)))
        }
    }

    fn status(code: u16) -> FetchedResponse {
        FetchedResponse {
            status: StatusCode::from_u16(code).unwrap(),
            final_url: "https://example.test/page".to_string(),
            headers: HeaderMap::new(),
            body: b"ok".to_vec(),
        }
    }

    fn too_many(retry_after: Option<&'static str>) -> FetchedResponse {
        let mut resp = status(429);
        if let Some(value) = retry_after {
            resp.headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        }
        resp
    }

    fn quiet_config() -> HttpClientConfig {
        HttpClientConfig {
            pacing: PacingPolicy::default().with_delay(Duration::ZERO, Duration::ZERO),
            rng_seed: Some(7),
            ..HttpClientConfig::default()
        }
    }

    fn session(
        script: Vec<Result<FetchedResponse, TransportError>>,
    ) -> (HttpSession, Arc<ScriptedTransport>, Arc<RecordingSleeper>) {
        let transport = Arc::new(ScriptedTransport::with(script));
        let sleeper = Arc::new(RecordingSleeper::default());
        let session = HttpSession::new(
            "test_source",
            &quiet_config(),
            transport.clone(),
            sleeper.clone(),
        );
        (session, transport, sleeper)
    }

    #[tokio::test]
    async fn retry_after_header_overrides_the_schedule() {
        let (mut session, _, sleeper) = session(vec![Ok(too_many(Some("30"))), Ok(status(200))]);
        let resp = session
            .request(&OutboundRequest::get("https://example.test/page"), 3)
            .await
            .expect("second attempt succeeds");

        assert_eq!(resp.status, StatusCode::OK);
        let slept = sleeper.slept();
        assert_eq!(slept[0], Duration::from_secs(30));
        assert_eq!(slept[1], Duration::from_millis(500));
        assert_eq!(session.state().consecutive_rate_limits, 0);
    }

    #[tokio::test]
    async fn rate_limit_redraws_user_agent_and_rotation_point() {
        let (mut session, transport, _) = session(vec![Ok(too_many(None)), Ok(status(200))]);
        session
            .request(&OutboundRequest::get("https://example.test/page"), 3)
            .await
            .unwrap();

        // mirror the session's draws: one rotation at construction, one after the 429
        let mut rng = StdRng::seed_from_u64(7);
        USER_AGENT_POOL.choose(&mut rng).unwrap();
        let first_interval = rng.random_range(10..=20u64);
        let agent_after_429 = USER_AGENT_POOL.choose(&mut rng).copied().unwrap();
        let interval_after_429 = rng.random_range(10..=20u64);

        let seen = transport.user_agents.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], agent_after_429);
        assert_eq!(session.state().user_agent, agent_after_429);
        // the 429 does not count as a request, so the point is drawn from zero
        assert_eq!(session.state().next_rotation_at, interval_after_429);
        assert!(first_interval >= 10 && interval_after_429 >= 10);
    }

    #[tokio::test]
    async fn third_consecutive_rate_limit_aborts() {
        let (mut session, transport, sleeper) = session(vec![
            Ok(too_many(None)),
            Ok(too_many(None)),
            Ok(too_many(Some("not-a-number"))),
        ]);
        let err = session
            .request(&OutboundRequest::get("https://example.test/page"), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RateLimited { hits: 3, .. }));
        assert!(err.is_rate_limited());
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn rate_limit_counter_resets_after_success() {
        let (mut session, _, sleeper) = session(vec![
            Ok(too_many(None)),
            Ok(status(200)),
            Ok(too_many(None)),
            Ok(status(200)),
        ]);
        let req = OutboundRequest::get("https://example.test/page");
        session.request(&req, 3).await.unwrap();
        session.request(&req, 3).await.unwrap();

        let slept = sleeper.slept();
        assert_eq!(slept[0], Duration::from_secs(60));
        assert_eq!(slept[2], Duration::from_secs(60));
        assert_eq!(session.state().request_count, 2);
    }

    #[tokio::test]
    async fn network_errors_back_off_linearly_then_give_up() {
        let (mut session, transport, sleeper) = session(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Connect("refused".into())),
            Err(TransportError::Timeout),
        ]);
        let err = session
            .request(&OutboundRequest::get("https://example.test/page"), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Transport { attempts: 3, .. }));
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn other_http_errors_are_not_retried() {
        let (mut session, transport, sleeper) = session(vec![Ok(status(404))]);
        let err = session
            .request(&OutboundRequest::get("https://example.test/page"), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn fiftieth_request_takes_a_break() {
        let (mut session, _, sleeper) = session(Vec::new());
        let req = OutboundRequest::get("https://example.test/page");
        for _ in 0..50 {
            session.request(&req, 3).await.unwrap();
        }

        let slept = sleeper.slept();
        assert_eq!(slept.len(), 51);
        let pause = slept[50];
        assert!(pause >= Duration::from_secs(10) && pause <= Duration::from_secs(30));
        assert!(slept[..50].iter().all(|d| *d == Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn target_break_uses_the_break_window() {
        let (mut session, transport, sleeper) = session(Vec::new());
        session.target_break().await;

        let slept = sleeper.slept();
        assert_eq!(slept.len(), 1);
        assert!(slept[0] >= Duration::from_secs(10) && slept[0] <= Duration::from_secs(30));
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn human_delay_never_drops_below_floor() {
        let config = HttpClientConfig {
            pacing: PacingPolicy::default()
                .with_delay(Duration::from_millis(200), Duration::from_millis(400)),
            rng_seed: Some(11),
            ..HttpClientConfig::default()
        };
        let mut session = HttpSession::new(
            "test_source",
            &config,
            Arc::new(ScriptedTransport::default()),
            Arc::new(RecordingSleeper::default()),
        );
        for _ in 0..200 {
            assert!(session.human_delay() >= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn user_agent_is_stable_for_at_least_ten_requests() {
        let (mut session, transport, _) = session(Vec::new());
        let req = OutboundRequest::get("https://example.test/page");
        for _ in 0..30 {
            session.request(&req, 3).await.unwrap();
        }

        let seen = transport.user_agents.lock().unwrap().clone();
        assert!(seen[..10].iter().all(|ua| ua == &seen[0]));
        assert!(seen.iter().all(|ua| USER_AGENT_POOL.contains(&ua.as_str())));
        assert!(session.state().next_rotation_at >= 30);
    }
}
