//! Response classification and exponential backoff for page requests

use std::time::Duration;

use rand::Rng;

use crate::error::SettingsError;

/// What one HTTP status means for a page attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// 200: parse the body
    Success,
    /// 404 / 422: pagination ran past the last page
    EndOfData,
    /// 429 / 403: back off (honouring server hints) and resubmit
    RateLimited,
    /// 5xx: back off and resubmit
    ServerError,
    /// Anything else (400, 401, ...): retrying cannot help
    Fatal,
}

impl Attempt {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError)
    }
}

/// Pure status → attempt decision.
pub fn classify(status: u16) -> Attempt {
    match status {
        200 => Attempt::Success,
        404 | 422 => Attempt::EndOfData,
        403 | 429 => Attempt::RateLimited,
        500..=u16::MAX => Attempt::ServerError,
        _ => Attempt::Fatal,
    }
}

/// Exponential backoff schedule for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts per page, including the first
    pub max_attempts: u32,
    /// Upper bound of the uniform jitter added to computed delays
    pub jitter: Duration,
    /// Longest sleep a server hint can impose
    pub max_hint: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            max_attempts: 5,
            jitter: Duration::from_secs(1),
            max_hint: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Policy that never sleeps (tests, replay)
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts,
            jitter: Duration::ZERO,
            max_hint: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_attempts == 0 {
            return Err(SettingsError("max_attempts must be at least 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(SettingsError(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// `min(base * 2^attempt, max)` for a 0-based retry index
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Sleep before retry `attempt`.
    ///
    /// A server hint of N seconds means N + 1, capped at `max_hint`; otherwise
    /// the capped exponential delay plus `jitter_fraction * jitter`
    /// (`jitter_fraction` in `[0, 1]`).
    pub fn delay_for(
        &self,
        attempt: u32,
        hint: Option<Duration>,
        jitter_fraction: f64,
    ) -> Duration {
        match hint {
            Some(wait) => wait.saturating_add(Duration::from_secs(1)).min(self.max_hint),
            None => self
                .backoff_duration(attempt)
                .saturating_add(self.jitter.mul_f64(jitter_fraction.clamp(0.0, 1.0))),
        }
    }

    /// [`delay_for`](Self::delay_for) with a random jitter sample
    pub fn next_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let fraction = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..=1.0)
        };
        self.delay_for(attempt, hint, fraction)
    }
}
