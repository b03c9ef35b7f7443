//! Shared HTTP plumbing: tokio runtime, client builder, rate-limit headers.
//!
//! Requests are async reqwest calls driven through [`SHARED_RUNTIME`], exposing a
//! sync interface so rayon page workers can block on them.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

/// HTTP timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConfig {
    /// Must not exceed `read_timeout`, which already bounds the connect phase
    pub connect_timeout: Duration,
    /// Whole-request timeout (connect + send + body)
    pub read_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("stepline-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Build a pooled client carrying `default_headers` (credentials, accept, user agent)
/// on every request.
pub fn build_client(
    config: &HttpConfig,
    user_agent: &str,
    default_headers: HeaderMap,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.read_timeout)
        .user_agent(user_agent)
        .default_headers(default_headers)
        .pool_max_idle_per_host(8)
        .build()
}

/// Rate-limit state reported by the server on one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    /// `x-ratelimit-remaining`
    pub remaining: Option<u64>,
    /// `x-ratelimit-reset`, UTC epoch seconds
    pub reset_epoch: Option<i64>,
    /// `retry-after`, seconds
    pub retry_after: Option<u64>,
}

fn header_num<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

impl RateLimit {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            remaining: header_num(headers, "x-ratelimit-remaining"),
            reset_epoch: header_num(headers, "x-ratelimit-reset"),
            retry_after: header_num(headers, "retry-after"),
        }
    }

    /// Server-mandated wait before the next attempt, if any.
    ///
    /// `retry-after` wins; otherwise an exhausted quota waits until the reset time.
    pub fn retry_hint(&self, now_epoch: i64) -> Option<Duration> {
        if let Some(secs) = self.retry_after {
            return Some(Duration::from_secs(secs));
        }
        match (self.remaining, self.reset_epoch) {
            (Some(0), Some(reset)) => Some(Duration::from_secs(
                u64::try_from(reset.saturating_sub(now_epoch)).unwrap_or(0),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn default_connect_timeout_can_fire() {
        let config = HttpConfig::default();
        assert!(config.connect_timeout < config.read_timeout);
    }

    #[test]
    fn far_future_reset_does_not_overflow() {
        let rl = RateLimit {
            remaining: Some(0),
            reset_epoch: Some(i64::MAX),
            retry_after: None,
        };
        assert!(rl.retry_hint(i64::MIN).is_some());
    }

    #[test]
    fn parses_github_headers() {
        let rl = RateLimit::from_headers(&headers(&[
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1700000060"),
        ]));
        assert_eq!(rl.remaining, Some(0));
        assert_eq!(rl.reset_epoch, Some(1_700_000_060));
        assert_eq!(rl.retry_after, None);
    }

    #[test]
    fn ignores_malformed_values() {
        let rl = RateLimit::from_headers(&headers(&[
            ("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ("x-ratelimit-remaining", "lots"),
        ]));
        assert_eq!(rl, RateLimit::default());
    }

    #[test]
    fn retry_after_takes_precedence() {
        let rl = RateLimit {
            remaining: Some(0),
            reset_epoch: Some(1_700_000_600),
            retry_after: Some(7),
        };
        assert_eq!(rl.retry_hint(1_700_000_000), Some(Duration::from_secs(7)));
    }

    #[test]
    fn exhausted_quota_waits_until_reset() {
        let rl = RateLimit {
            remaining: Some(0),
            reset_epoch: Some(1_700_000_045),
            retry_after: None,
        };
        assert_eq!(rl.retry_hint(1_700_000_000), Some(Duration::from_secs(45)));
        // reset already passed
        assert_eq!(rl.retry_hint(1_700_000_100), Some(Duration::ZERO));
    }

    #[test]
    fn remaining_quota_gives_no_hint() {
        let rl = RateLimit {
            remaining: Some(12),
            reset_epoch: Some(1_700_000_045),
            retry_after: None,
        };
        assert_eq!(rl.retry_hint(1_700_000_000), None);
        assert_eq!(RateLimit::default().retry_hint(0), None);
    }
}
