//! Token-bucket rate limiting shared across the process
//!
//! Buckets live in a process-wide registry keyed by endpoint family, so
//! concurrent product queries cooperate instead of each carrying their own
//! counter. This is load-bearing for NVD: its public ceiling is 5 requests
//! per 30 seconds, and a per-client limiter would blow through it the
//! moment the batch executor fans out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::cancel::CancelToken;
use crate::error::{Result, SafeverError};

/// Endpoint family name for the NVD feed
pub const NVD_FAMILY: &str = "nvd";

/// NVD rate without an API key: 5 requests / 30 s
pub const NVD_ANON_MAX: u32 = 5;
/// NVD rate with an API key: 50 requests / 30 s
pub const NVD_KEYED_MAX: u32 = 50;
/// NVD rate window
pub const NVD_WINDOW: Duration = Duration::from_secs(30);

/// Sleep slice while waiting for a token, so cancellation stays responsive
const WAIT_SLICE: Duration = Duration::from_millis(50);

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Arc<TokenBucket>>> = Mutex::new(HashMap::new());
}

struct BucketState {
    max: f64,
    window: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let rate = self.max / self.window.as_secs_f64();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(self.max);
        self.last_refill = now;
    }
}

/// A token bucket with continuous refill at `max / window`
pub struct TokenBucket {
    name: String,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(name: &str, max: u32, window: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(BucketState {
                max: f64::from(max),
                window,
                tokens: f64::from(max),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token without blocking; false when none is available
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.refill();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available, then consume it
    ///
    /// Returns `SafeverError::Cancelled` instead of blocking indefinitely
    /// once the token is cancelled.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(SafeverError::Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }
            tracing::trace!("waiting on rate limiter: {}", self.name);
            std::thread::sleep(WAIT_SLICE);
        }
    }

    /// Raise the bucket's rate; downgrades are ignored
    ///
    /// Stored tokens are clamped to the new max so a reconfigure never
    /// mints a burst larger than the new ceiling.
    pub fn reconfigure(&self, max: u32, window: Duration) {
        let mut state = self.state.lock().unwrap();
        let new_max = f64::from(max);
        let new_rate = new_max / window.as_secs_f64();
        let old_rate = state.max / state.window.as_secs_f64();
        if new_rate <= old_rate {
            return;
        }
        state.max = new_max;
        state.window = window;
        state.tokens = state.tokens.min(new_max);
        tracing::debug!("rate limiter {} upgraded to {}/{:?}", self.name, max, window);
    }
}

/// Get or create the bucket for an endpoint family
///
/// An existing bucket is reconfigured (monotonic upgrade) rather than
/// replaced, so every holder keeps sharing the same instance.
pub fn limiter(family: &str, max: u32, window: Duration) -> Arc<TokenBucket> {
    let mut registry = REGISTRY.lock().unwrap();
    if let Some(bucket) = registry.get(family) {
        bucket.reconfigure(max, window);
        return Arc::clone(bucket);
    }
    let bucket = Arc::new(TokenBucket::new(family, max, window));
    registry.insert(family.to_string(), Arc::clone(&bucket));
    bucket
}

/// The shared NVD bucket, keyed or anonymous
pub fn nvd_limiter(has_api_key: bool) -> Arc<TokenBucket> {
    let max = if has_api_key { NVD_KEYED_MAX } else { NVD_ANON_MAX };
    limiter(NVD_FAMILY, max, NVD_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_consumes_tokens() {
        let bucket = TokenBucket::new("test-consume", 3, Duration::from_secs(30));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_bucket_refills_continuously() {
        let bucket = TokenBucket::new("test-refill", 10, Duration::from_millis(100));
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // 10 tokens / 100 ms: after ~30 ms at least one token is back
        std::thread::sleep(Duration::from_millis(30));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_reconfigure_is_monotonic() {
        let bucket = TokenBucket::new("test-mono", 50, Duration::from_secs(30));
        // Downgrade attempt is a no-op
        bucket.reconfigure(5, Duration::from_secs(30));
        for _ in 0..6 {
            assert!(bucket.try_acquire());
        }
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let bucket = TokenBucket::new("test-clamp", 5, Duration::from_secs(3600));
        bucket.reconfigure(50, Duration::from_secs(30));
        // The upgrade must not mint more than the old balance right away;
        // at most the 5 stored tokens are spendable immediately.
        let mut granted = 0;
        while bucket.try_acquire() {
            granted += 1;
            assert!(granted <= 6);
        }
        assert!(granted >= 5);
    }

    #[test]
    fn test_registry_returns_shared_instance() {
        let a = limiter("test-shared", 5, Duration::from_secs(30));
        let b = limiter("test-shared", 5, Duration::from_secs(30));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_acquire_honors_cancellation() {
        let bucket = TokenBucket::new("test-cancel", 1, Duration::from_secs(3600));
        assert!(bucket.try_acquire());

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = bucket.acquire(&cancel).unwrap_err();
        assert!(matches!(err, SafeverError::Cancelled));
    }

    #[test]
    fn test_nvd_limiter_upgrades_with_key() {
        let anon = nvd_limiter(false);
        let keyed = nvd_limiter(true);
        // Same singleton either way; the key only raises the rate
        assert!(Arc::ptr_eq(&anon, &keyed));
    }
}
