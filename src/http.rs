//! Single-path HTTP fetch with caching, rate limiting, and retries
//!
//! Every outbound request in safever goes through [`HttpFetcher::fetch`].
//! The contract: a supplied cache key short-circuits to the file cache; a
//! supplied limiter is acquired before the request; 429/403 honor
//! Retry-After and otherwise back off exponentially (2 s doubling, capped
//! at 60 s, five attempts total); transport failures use the same backoff;
//! any other non-2xx status is a structured error the caller may swallow.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Result, SafeverError};
use crate::filecache::FileCache;
use crate::ratelimit::TokenBucket;

/// Initial backoff delay
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
/// Backoff ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Slice length for cancellation-aware sleeping
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Authentication to attach to a request
#[derive(Debug, Clone, Default)]
pub enum Auth {
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// Arbitrary header, e.g. NVD's `apiKey`
    Header { name: String, value: String },
}

/// One fetch: URL plus caching, auth, and rate-limit parameters
pub struct FetchSpec<'a> {
    pub url: &'a str,
    pub accept: Option<&'a str>,
    /// File-cache key; None disables caching for this request
    pub cache_key: Option<&'a str>,
    /// TTL applied when storing under `cache_key`
    pub ttl: chrono::Duration,
    pub auth: Auth,
    /// Endpoint-family bucket to acquire before each network attempt
    pub limiter: Option<Arc<TokenBucket>>,
}

impl<'a> FetchSpec<'a> {
    /// A plain uncached, unauthenticated GET
    pub fn plain(url: &'a str) -> Self {
        Self {
            url,
            accept: None,
            cache_key: None,
            ttl: chrono::Duration::zero(),
            auth: Auth::None,
            limiter: None,
        }
    }
}

/// Shared blocking HTTP client
pub struct HttpFetcher {
    client: Client,
    cache: Arc<FileCache>,
    max_attempts: u32,
    cancel: CancelToken,
}

impl HttpFetcher {
    /// Build the client with the configured timeouts and User-Agent
    pub fn new(config: &Config, cache: Arc<FileCache>, cancel: CancelToken) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.http.connect_timeout_secs))
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .user_agent(Config::user_agent())
            .build()
            .map_err(|e| SafeverError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache,
            max_attempts: config.http.max_attempts,
            cancel,
        })
    }

    /// Fetch a URL per the contract, returning the payload text
    pub fn fetch(&self, spec: &FetchSpec) -> Result<String> {
        if let Some(key) = spec.cache_key {
            if let Some(cached) = self.cache.get::<String>(key) {
                return Ok(cached);
            }
        }

        let mut last_error: Option<SafeverError> = None;

        for attempt in 1..=self.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(SafeverError::Cancelled);
            }

            if let Some(ref limiter) = spec.limiter {
                limiter.acquire(&self.cancel)?;
            }

            match self.fetch_once(spec) {
                Ok(body) => {
                    if let Some(key) = spec.cache_key {
                        if let Err(e) = self.cache.set(key, &body, spec.ttl, Some(spec.url)) {
                            tracing::warn!("failed to cache {}: {}", key, e);
                        }
                    }
                    return Ok(body);
                }
                Err(Backoff::Retry { delay, error }) => {
                    tracing::warn!(
                        "attempt {}/{} for {} failed: {}",
                        attempt,
                        self.max_attempts,
                        spec.url,
                        error
                    );
                    last_error = Some(error);
                    if attempt < self.max_attempts {
                        let delay = delay.unwrap_or_else(|| backoff_delay(attempt));
                        self.sleep(delay)?;
                    }
                }
                Err(Backoff::Fatal(error)) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| SafeverError::Request(format!("{} unreachable", spec.url))))
    }

    /// One network attempt
    fn fetch_once(&self, spec: &FetchSpec) -> std::result::Result<String, Backoff> {
        let mut request = self.client.get(spec.url);
        if let Some(accept) = spec.accept {
            request = request.header("Accept", accept);
        }
        match &spec.auth {
            Auth::None => {}
            Auth::Bearer(token) => {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
            Auth::Header { name, value } => {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        let response = request.send().map_err(|e| Backoff::Retry {
            delay: None,
            error: SafeverError::Request(format!("{}: {}", spec.url, e)),
        })?;

        let status = response.status();
        if status.is_success() {
            return response.text().map_err(|e| Backoff::Retry {
                delay: None,
                error: SafeverError::Request(format!("{}: {}", spec.url, e)),
            });
        }

        // 429 and 403 both signal throttling on the feeds we talk to
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            let delay = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Backoff::Retry {
                delay,
                error: SafeverError::RateLimited(spec.url.to_string()),
            });
        }

        Err(Backoff::Fatal(SafeverError::Http {
            status: status.as_u16(),
            url: spec.url.to_string(),
        }))
    }

    /// Sleep in slices so cancellation interrupts a long backoff
    fn sleep(&self, total: Duration) -> Result<()> {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.cancel.is_cancelled() {
                return Err(SafeverError::Cancelled);
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        Ok(())
    }
}

enum Backoff {
    /// Retryable failure; `delay` overrides the exponential schedule
    Retry {
        delay: Option<Duration>,
        error: SafeverError,
    },
    Fatal(SafeverError),
}

/// Exponential backoff: 2 s, 4 s, 8 s, ... capped at 60 s
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_INITIAL.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(BACKOFF_CAP)
}
