//! Retry policy: how many attempts, and how long to wait between them.
//!
//! ## 遅延の計算
//! - jitter なし: `base * 2^attempts`
//! - jitter あり: `base + rand[0, 3 * previous - base]`
//! - どちらも `max_timeout` で頭打ち（`0` なら上限なし）
//!
//! ## 試行回数
//! `retries(0)` は一度も実行しない。`-1` は無制限。

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Attempt limit of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Limited(u32),
    Unbounded,
}

impl MaxAttempts {
    /// `-1` means unbounded. Anything below that is a programming error.
    pub fn from_count(n: i32) -> Self {
        match n {
            -1 => MaxAttempts::Unbounded,
            n if n >= 0 => MaxAttempts::Limited(n as u32),
            n => panic!("invalid attempt count {n}; use -1 for unbounded"),
        }
    }

    pub fn exhausted(self, attempts: u32) -> bool {
        match self {
            MaxAttempts::Limited(max) => attempts >= max,
            MaxAttempts::Unbounded => false,
        }
    }
}

/// Retry settings, loadable from configuration.
///
/// Durations are in milliseconds so the JSON form stays flat. Missing fields
/// fall back to the defaults: one attempt, 1 minute base delay, 30 minute
/// cap, jitter on, no per-attempt deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, `-1` for unbounded.
    pub max_attempts: i32,

    pub base_delay_ms: u64,

    /// Upper bound for the delay between attempts; `0` leaves it uncapped.
    pub max_timeout_ms: u64,

    pub jitter: bool,

    /// Upper limit for the duration of each attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub within_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 60_000,
            max_timeout_ms: 30 * 60_000,
            jitter: true,
            within_ms: None,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> MaxAttempts {
        MaxAttempts::from_count(self.max_attempts)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn within(&self) -> Option<Duration> {
        self.within_ms.map(Duration::from_millis)
    }
}

/// The backoff curve, resolved from a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    /// Zero means uncapped.
    pub max_timeout: Duration,
    pub jitter: bool,
}

impl Backoff {
    /// Delay before the attempt following failed attempt number `attempts`
    /// (1-indexed). `previous` is the delay used last time (the base delay
    /// before the first retry).
    ///
    /// Without jitter: `base * 2^attempts`, e.g. with a 1 minute base
    /// 2m, 4m, 8m, 16m, ...
    ///
    /// With jitter: uniformly random in `[base, 3 * previous]`, so the delay
    /// still tends to grow but retries from many tasks spread out.
    ///
    /// Either way the result is capped at `max_timeout` unless that is zero.
    pub fn next_delay(&self, attempts: u32, previous: Duration) -> Duration {
        let delay = if self.jitter {
            let span = previous.saturating_mul(3).saturating_sub(self.base);
            let span_ms = u64::try_from(span.as_millis()).unwrap_or(u64::MAX);
            let extra = rand::thread_rng().gen_range(0..=span_ms);
            self.base.saturating_add(Duration::from_millis(extra))
        } else {
            2u32.checked_pow(attempts)
                .and_then(|factor| self.base.checked_mul(factor))
                .unwrap_or(Duration::MAX)
        };
        self.cap(delay)
    }

    fn cap(&self, delay: Duration) -> Duration {
        if self.max_timeout.is_zero() {
            delay
        } else {
            delay.min(self.max_timeout)
        }
    }
}
