//! API budget governance
//!
//! [`RateLimitGovernor`] sits between every page fetch and the upstream API:
//!
//! - paces requests client-side with a `governor` token bucket
//! - tracks the server-reported [`RateLimitInfo`] and refuses to spend below
//!   the configured reserve
//! - maps upstream status codes onto the error taxonomy
//! - computes the delay before a rate-limited or failed operation may run again

pub mod retry;

use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::RateLimitInfo;
use retry::RetryPolicy;

/// Slack allowed when comparing refresh timestamps from successive responses
const REFRESH_TOLERANCE_SECS: i64 = 1;

/// Governor settings
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Client-side pacing
    pub requests_per_second: u32,

    /// Points kept in reserve
    pub min_points_reserve: f64,

    /// Short fixed delay for point regeneration
    pub regen_delay: Duration,

    /// Fallback backoff for errors without budget information
    pub backoff: RetryPolicy,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            min_points_reserve: 1.0,
            regen_delay: Duration::from_secs(5),
            backoff: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for GovernorConfig {
    fn from(config: &Config) -> Self {
        Self {
            requests_per_second: config.api.requests_per_second,
            min_points_reserve: config.sync.min_points_reserve,
            regen_delay: Duration::from_secs(config.sync.regen_delay_secs),
            backoff: config.retry_policy(),
        }
    }
}

/// Tracked server budget plus the trial request schedule
///
/// Below the reserve no request would ever refresh the snapshot, so one
/// trial request is let through every `regen_delay`. Its response replaces
/// the snapshot outright, which is how regenerated points become visible.
#[derive(Debug, Default)]
struct Budget {
    info: Option<RateLimitInfo>,
    /// Earliest instant the next trial request may go out
    trial_at: Option<DateTime<Utc>>,
    /// A trial request is out and its snapshot not yet seen
    trial_pending: bool,
    /// The last trial came back still below the reserve
    trial_failed: bool,
}

impl Budget {
    fn clear_trial(&mut self) {
        self.trial_at = None;
        self.trial_pending = false;
        self.trial_failed = false;
    }
}

/// Tracks remaining API budget and refusal windows
pub struct RateLimitGovernor {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    budget: Mutex<Budget>,
    config: GovernorConfig,
}

impl RateLimitGovernor {
    /// Create a new governor
    pub fn new(config: GovernorConfig) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_second(rate));

        Self {
            limiter,
            budget: Mutex::new(Budget::default()),
            config,
        }
    }

    /// Wait for a client-side pacing slot
    pub async fn pace(&self) {
        self.limiter.until_ready().await;
    }

    /// Fold a fresh server snapshot into the tracked budget
    ///
    /// Within one window the remaining points only ever go down, except for
    /// the answer to a trial request, which is taken as is. A snapshot with a
    /// later refresh time starts a new window.
    pub fn observe(&self, info: RateLimitInfo) {
        let mut budget = self.budget.lock();

        if budget.trial_pending {
            let recovered = info.remaining_points >= self.config.min_points_reserve;
            tracing::debug!(
                remaining = info.remaining_points,
                recovered,
                "Trial request reported budget"
            );
            budget.clear_trial();
            budget.trial_failed = !recovered;
            budget.info = Some(info);
            return;
        }

        let next = match budget.info.take() {
            None => info,
            Some(current) => {
                let boundary = info.next_refresh
                    > current.next_refresh + chrono::Duration::seconds(REFRESH_TOLERANCE_SECS);
                if boundary {
                    tracing::debug!(
                        remaining = info.remaining_points,
                        next_refresh = %info.next_refresh,
                        "Rate limit window refreshed"
                    );
                    budget.clear_trial();
                    info
                } else {
                    RateLimitInfo {
                        remaining_points: current.remaining_points.min(info.remaining_points),
                        points_per_hour: info.points_per_hour,
                        reset_in_secs: info.reset_in_secs,
                        next_refresh: current.next_refresh,
                    }
                }
            }
        };

        budget.info = Some(next);
    }

    /// Current tracked budget
    pub fn snapshot(&self) -> Option<RateLimitInfo> {
        self.budget.lock().info.clone()
    }

    /// Refuse to spend when the known budget is below the reserve
    pub fn check_budget(&self) -> Result<()> {
        self.check_budget_at(Utc::now())
    }

    /// Budget check against an explicit instant
    ///
    /// Below the reserve the first refusal schedules a trial request
    /// `regen_delay` later. Once due, one caller is let through. If the trial
    /// shows no recovery, refusals escalate to [`Error::QuotaExceeded`] so the
    /// caller waits out the window instead of polling.
    pub fn check_budget_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut budget = self.budget.lock();
        let Some(info) = budget.info.clone() else {
            return Ok(());
        };

        if now >= info.next_refresh {
            budget.clear_trial();
            return Ok(());
        }

        let current = RateLimitInfo {
            reset_in_secs: (info.next_refresh - now).num_seconds().max(0) as u64,
            ..info
        };

        if current.is_exhausted() || (budget.trial_failed && self.below_reserve(&current)) {
            return Err(Error::quota_exceeded(
                format!(
                    "{:.1} points left, window resets in {}s",
                    current.remaining_points, current.reset_in_secs
                ),
                Some(current),
            ));
        }

        if !self.below_reserve(&current) {
            return Ok(());
        }

        let trial_at = budget.trial_at;
        match trial_at {
            Some(due) if now >= due => {
                budget.trial_pending = true;
                budget.trial_at = Some(now + self.regen_step());
                tracing::debug!(remaining = current.remaining_points, "Letting trial request through");
                Ok(())
            }
            scheduled => {
                if scheduled.is_none() {
                    budget.trial_at = Some(now + self.regen_step());
                }
                Err(Error::rate_limit(
                    format!(
                        "{:.1} points left, below reserve of {:.1}",
                        current.remaining_points, self.config.min_points_reserve
                    ),
                    Some(current),
                ))
            }
        }
    }

    fn below_reserve(&self, info: &RateLimitInfo) -> bool {
        info.remaining_points < self.config.min_points_reserve
    }

    fn regen_step(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.regen_delay).unwrap_or(chrono::Duration::zero())
    }

    /// Map an upstream status code onto the error taxonomy
    pub fn classify_status(status: u16, message: String, info: Option<RateLimitInfo>) -> Error {
        match status {
            429 => match &info {
                Some(i) if i.is_exhausted() => Error::quota_exceeded(message, info),
                _ => Error::rate_limit(message, info),
            },
            408 | 500..=599 => Error::Api {
                status,
                message,
                retryable: true,
            },
            _ => Error::Api {
                status,
                message,
                retryable: false,
            },
        }
    }

    /// Delay before the failed operation may run again
    ///
    /// Rate-limit family errors carrying budget information wait for the reset
    /// window on quota exhaustion or when less than one point is left, and for
    /// the short regeneration delay otherwise. Everything else uses capped
    /// exponential backoff.
    pub fn retry_delay(&self, err: &Error, attempt: u32) -> Duration {
        retry_delay(err, attempt, self.config.regen_delay, &self.config.backoff)
    }
}

/// Retry delay selection without a governor instance
pub fn retry_delay(err: &Error, attempt: u32, regen_delay: Duration, backoff: &RetryPolicy) -> Duration {
    if err.is_rate_limited() {
        if let Some(info) = err.rate_limit_info() {
            let quota = matches!(err, Error::QuotaExceeded { .. });
            return if quota || info.is_exhausted() {
                info.reset_in()
            } else {
                regen_delay
            };
        }
    }

    backoff.calculate_delay(attempt.max(1))
}
