use std::thread::sleep;
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;
use url::Url;

/// Per-request socket timeout for every outbound call.
pub const TIMEOUT: Duration = Duration::from_secs(30);

pub const API_BASE: &str = "https://api.real-debrid.com/rest/1.0/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request against the API, relative to the API base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            form: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(path)
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.form.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failure: no HTTP status was received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

/// Sends one request and returns whatever status came back.
pub trait Transport {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

impl<F> Transport for F
where
    F: Fn(&ApiRequest) -> Result<ApiResponse, TransportError>,
{
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self(request)
    }
}

/// Bearer-authenticated blocking transport to the Real-Debrid API.
pub struct ReqwestTransport {
    client: Client,
    base: Url,
    token: String,
}

impl ReqwestTransport {
    pub fn new(token: &str) -> Result<Self, TransportError> {
        Self::with_base(token, Url::parse(API_BASE)?)
    }

    pub fn with_base(token: &str, base: Url) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            token: token.to_string(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.base.join(&request.path)?;
        let builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url).form(&request.form),
        };

        let response = builder
            .bearer_auth(&self.token)
            .query(&request.query)
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;

        Ok(ApiResponse { status, body })
    }
}

/// Pacing and retry parameters for outbound API calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Fixed delay paid before every first attempt.
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to `base_delay`.
    pub base_jitter: Duration,
    pub max_retries: u32,
    /// Retry `n` waits `backoff_base^n` seconds plus jitter.
    pub backoff_base: f64,
    pub backoff_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            base_jitter: Duration::from_millis(500),
            max_retries: 3,
            backoff_base: 2.0,
            backoff_jitter: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Same retry ceiling, no waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            base_jitter: Duration::ZERO,
            max_retries,
            backoff_base: 0.0,
            backoff_jitter: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.base_delay + jitter(self.base_jitter)
        } else {
            let exponential = self.backoff_base.powi(attempt as i32);
            let delay = Duration::try_from_secs_f64(exponential).unwrap_or(self.max_delay)
                + jitter(self.backoff_jitter);
            delay.min(self.max_delay)
        }
    }
}

fn jitter(max: Duration) -> Duration {
    max.mul_f64(rand::random::<f64>())
}

/// Paces every call and retries rate limiting, unavailability and network errors.
///
/// Calls are strictly sequential: the pacing delay before each first attempt
/// only guarantees spacing between requests because nothing runs concurrently.
pub struct RateLimitedHttpClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> RateLimitedHttpClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Returns the last response received, or `None` if the final attempt
    /// failed at the network level.
    pub fn execute(&self, request: &ApiRequest) -> Option<ApiResponse> {
        let attempts = self.policy.max_attempts();

        for attempt in 0..attempts {
            let delay = self.policy.delay_before(attempt);
            if attempt > 0 {
                log::info!(
                    "Retrying in {:.1} seconds... (attempt {}/{attempts})",
                    delay.as_secs_f64(),
                    attempt + 1
                );
            }
            if !delay.is_zero() {
                sleep(delay);
            }

            let last = attempt + 1 == attempts;
            match self.transport.send(request) {
                Ok(response) if matches!(response.status, 429 | 503) => {
                    let reason = if response.status == 429 {
                        "Rate limit hit"
                    } else {
                        "Service unavailable"
                    };
                    if last {
                        log::warn!("{reason}, max retries exceeded");
                        return Some(response);
                    }
                    log::warn!("{reason}, will retry...");
                }
                Ok(response) => return Some(response),
                Err(err) => {
                    if last {
                        log::error!("Request failed ({err}), max retries exceeded");
                        return None;
                    }
                    log::warn!("Request failed ({err}), will retry...");
                }
            }
        }

        None
    }
}
