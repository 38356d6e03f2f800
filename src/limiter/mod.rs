//! Rate Limiter & Timeout Service (C10, §4.10).
//!
//! Two independent concerns share this module because they're both
//! "fires once, compares an elapsed duration against a configured bound"
//! primitives: the sliding-window admission limiter (mutated under a
//! single mutex by the dispatcher, §5) and the per-call timers the
//! session loop races against its event loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by user ID (§4.10). `check` is read-only;
/// `record` is the only mutator, so the critical section callers need to
/// hold a lock across is exactly `record` (or `check_and_record`).
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_calls: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_calls: 10,
            window: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateCheck {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: Instant,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config_max_calls: u32,
    config_window: Duration,
    buckets: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config_max_calls: config.max_calls,
            config_window: config.window,
            buckets: HashMap::new(),
        }
    }

    fn trim(&mut self, user_id: &str, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(user_id) {
            while let Some(&front) = bucket.front() {
                if now.duration_since(front) > self.config_window {
                    bucket.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Trims expired timestamps and reports whether a new call is allowed
    /// right now, without recording one.
    pub fn check(&mut self, user_id: &str, now: Instant) -> RateCheck {
        self.trim(user_id, now);
        let count = self.buckets.get(user_id).map(|b| b.len()).unwrap_or(0) as u32;
        let reset_time = self
            .buckets
            .get(user_id)
            .and_then(|b| b.front())
            .map(|&t| t + self.config_window)
            .unwrap_or(now);
        RateCheck {
            allowed: count < self.config_max_calls,
            remaining: self.config_max_calls.saturating_sub(count),
            reset_time,
        }
    }

    /// Appends the current timestamp. Callers that want atomic
    /// check-then-record should call [`Self::check_and_record`] instead.
    pub fn record(&mut self, user_id: &str, now: Instant) {
        self.buckets.entry(user_id.to_string()).or_default().push_back(now);
    }

    /// O(1)-amortized critical section (trim + append/check): the one the
    /// dispatcher holds its mutex across (§5).
    pub fn check_and_record(&mut self, user_id: &str, now: Instant) -> RateCheck {
        let check = self.check(user_id, now);
        if check.allowed {
            self.record(user_id, now);
        }
        check
    }
}

/// One of the three per-call timers (§4.10): max duration, silence,
/// response. Each fires once; the caller maps the fire to a typed
/// `endReason` via [`TimerKind::reason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    MaxDuration,
    Silence,
    Response,
}

impl TimerKind {
    pub fn reason(self) -> &'static str {
        match self {
            TimerKind::MaxDuration => "duration-exceeded",
            TimerKind::Silence => "silence",
            TimerKind::Response => "response-timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub max_duration: Duration,
    pub silence: Duration,
    pub response: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(600),
            silence: Duration::from_secs(30),
            response: Duration::from_secs(30),
        }
    }
}

/// A single fire-once timer tracked by elapsed wall-clock rather than an
/// actual `tokio::time::Sleep`, so the session loop can race several of
/// these against one `tokio::select!` using its own ticking clock (real or
/// `tokio::time::pause`d in tests).
#[derive(Debug, Clone, Copy)]
pub struct CallTimer {
    kind: TimerKind,
    bound: Duration,
    started_at: Instant,
    fired: bool,
}

impl CallTimer {
    pub fn new(kind: TimerKind, bound: Duration, started_at: Instant) -> Self {
        Self { kind, bound, started_at, fired: false }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Resets the timer's clock, used by the silence/response timers every
    /// time a qualifying event (voice-active frame / model audio chunk)
    /// arrives.
    pub fn reset(&mut self, now: Instant) {
        self.started_at = now;
        self.fired = false;
    }

    /// Checks whether the bound has elapsed as of `now`. Fires (returns
    /// `true`) exactly once per arm; subsequent calls return `false` until
    /// `reset`.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.fired {
            return false;
        }
        if now.duration_since(self.started_at) >= self.bound {
            self.fired = true;
            true
        } else {
            false
        }
    }
}

/// Bundles the three per-call timers so the session loop can poll all of
/// them each tick and react to whichever fires first.
pub struct CallTimers {
    pub max_duration: CallTimer,
    pub silence: CallTimer,
    pub response: CallTimer,
}

impl CallTimers {
    pub fn new(config: &TimeoutConfig, now: Instant) -> Self {
        Self {
            max_duration: CallTimer::new(TimerKind::MaxDuration, config.max_duration, now),
            silence: CallTimer::new(TimerKind::Silence, config.silence, now),
            response: CallTimer::new(TimerKind::Response, config.response, now),
        }
    }

    /// Returns the first timer kind to fire, if any, checked in the order
    /// max-duration, silence, response (an arbitrary but stable tie-break
    /// for the rare case two bounds elapse in the same poll).
    pub fn poll(&mut self, now: Instant) -> Option<TimerKind> {
        if self.max_duration.check(now) {
            return Some(TimerKind::MaxDuration);
        }
        if self.silence.check(now) {
            return Some(TimerKind::Silence);
        }
        if self.response.check(now) {
            return Some(TimerKind::Response);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_calls_then_blocks() {
        let mut limiter = RateLimiter::new(RateLimiterConfig { max_calls: 3, window: Duration::from_secs(60) });
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_and_record("u1", now).allowed);
        }
        assert!(!limiter.check_and_record("u1", now).allowed);
    }

    #[test]
    fn window_expiry_frees_up_capacity() {
        let mut limiter = RateLimiter::new(RateLimiterConfig { max_calls: 1, window: Duration::from_millis(50) });
        let t0 = Instant::now();
        assert!(limiter.check_and_record("u1", t0).allowed);
        let t1 = t0 + Duration::from_millis(60);
        assert!(limiter.check_and_record("u1", t1).allowed);
    }

    #[test]
    fn buckets_are_independent_per_user() {
        let mut limiter = RateLimiter::new(RateLimiterConfig { max_calls: 1, window: Duration::from_secs(60) });
        let now = Instant::now();
        assert!(limiter.check_and_record("a", now).allowed);
        assert!(limiter.check_and_record("b", now).allowed);
    }

    #[test]
    fn timer_fires_once_then_needs_reset() {
        let t0 = Instant::now();
        let mut timer = CallTimer::new(TimerKind::Silence, Duration::from_millis(100), t0);
        assert!(!timer.check(t0 + Duration::from_millis(50)));
        assert!(timer.check(t0 + Duration::from_millis(150)));
        assert!(!timer.check(t0 + Duration::from_millis(200)));
        timer.reset(t0 + Duration::from_millis(200));
        assert!(!timer.check(t0 + Duration::from_millis(250)));
        assert!(timer.check(t0 + Duration::from_millis(350)));
    }

    #[test]
    fn timers_poll_in_priority_order() {
        let t0 = Instant::now();
        let config = TimeoutConfig {
            max_duration: Duration::from_millis(100),
            silence: Duration::from_millis(100),
            response: Duration::from_millis(100),
        };
        let mut timers = CallTimers::new(&config, t0);
        let fired = timers.poll(t0 + Duration::from_millis(150));
        assert_eq!(fired, Some(TimerKind::MaxDuration));
    }
}
