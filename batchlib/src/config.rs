use crate::retry::RetryConfig;
use crate::spec::ResourceRequest;
use rand::Rng;
use std::time::Duration;

/// AWS Batch refuses array jobs larger than this.
pub const DEFAULT_MAX_ARRAY_SIZE: usize = 10_000;
/// Upper limit for any poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Cadence of the shared status poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Growth factor applied after a tick that observed no progress.
    pub multiplier: f64,
    /// Fractional jitter, 0.2 means +/- 20%.
    pub jitter: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl PollConfig {
    /// Interval to use after a tick, before jitter.
    pub fn next_interval(&self, current: Duration, progressed: bool) -> Duration {
        if progressed {
            return self.initial_interval.min(self.ceiling());
        }
        // NaN multipliers fall back to 1.0 through `max`
        let grown = current.as_secs_f64() * self.multiplier.max(1.0);
        self.capped(grown)
    }

    /// Spread `interval` by +/- `jitter`. A jitter outside `0..=1` (or NaN)
    /// is treated as none.
    pub fn jittered(&self, interval: Duration) -> Duration {
        let jitter = self.jitter;
        if !(jitter > 0.0 && jitter <= 1.0) {
            return interval.min(self.ceiling());
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..(1.0 + jitter));
        self.capped(interval.as_secs_f64() * factor)
    }

    fn ceiling(&self) -> Duration {
        self.max_interval.min(MAX_POLL_INTERVAL)
    }

    fn capped(&self, secs: f64) -> Duration {
        let ceiling = self.ceiling();
        Duration::try_from_secs_f64(secs)
            .map(|interval| interval.min(ceiling))
            .unwrap_or(ceiling)
    }
}

/// Settings shared by every handle of a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll: PollConfig,
    /// Applied to `describe` and result fetches, which are idempotent.
    pub describe_retry: RetryConfig,
    /// How old a cached snapshot may be before `done()` queries again.
    pub staleness_bound: Duration,
    pub max_array_size: usize,
    /// Used by `Session::map` when no resources are given.
    pub default_resources: ResourceRequest,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            describe_retry: RetryConfig::default(),
            staleness_bound: Duration::from_secs(1),
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            default_resources: ResourceRequest::default(),
        }
    }
}

impl SessionConfig {
    /// Both intervals are clamped to `1ms..=MAX_POLL_INTERVAL`, and `max` is
    /// raised to `initial` if it is smaller.
    pub fn with_poll_intervals(mut self, initial: Duration, max: Duration) -> Self {
        let clamp = |interval: Duration| interval.clamp(Duration::from_millis(1), MAX_POLL_INTERVAL);
        self.poll.initial_interval = clamp(initial);
        self.poll.max_interval = clamp(max).max(self.poll.initial_interval);
        self
    }

    pub fn with_describe_attempts(mut self, attempts: u32) -> Self {
        self.describe_retry.max_attempts = attempts;
        self
    }

    pub fn with_max_array_size(mut self, size: usize) -> Self {
        self.max_array_size = size.max(1);
        self
    }

    pub fn with_default_resources(mut self, resources: ResourceRequest) -> Self {
        self.default_resources = resources;
        self
    }

    pub fn with_staleness_bound(mut self, bound: Duration) -> Self {
        self.staleness_bound = bound;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_config_default() {
        let cfg = PollConfig::default();
        assert_eq!(cfg.initial_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_interval, Duration::from_secs(60));
    }

    #[test]
    fn interval_grows_then_caps() {
        let cfg = PollConfig::default();
        let mut interval = cfg.initial_interval;
        let mut seen = vec![];
        for _ in 0..8 {
            interval = cfg.next_interval(interval, false);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn progress_resets_interval() {
        let cfg = PollConfig::default();
        assert_eq!(
            cfg.next_interval(Duration::from_secs(32), true),
            cfg.initial_interval
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let cfg = PollConfig::default();
        for _ in 0..200 {
            let d = cfg.jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{:?}", d);
            let capped = cfg.jittered(cfg.max_interval);
            assert!(capped <= cfg.max_interval);
        }
    }

    #[test]
    fn session_config_builders() {
        let cfg = SessionConfig::default()
            .with_poll_intervals(Duration::from_millis(50), Duration::from_millis(10))
            .with_max_array_size(0)
            .with_describe_attempts(2);
        assert_eq!(cfg.poll.initial_interval, Duration::from_millis(50));
        assert_eq!(cfg.poll.max_interval, Duration::from_millis(50));
        assert_eq!(cfg.max_array_size, 1);
        assert_eq!(cfg.describe_retry.max_attempts, 2);
        assert_eq!(cfg.staleness_bound, Duration::from_secs(1));
    }

    #[test]
    fn poll_intervals_are_clamped() {
        let cfg = SessionConfig::default()
            .with_poll_intervals(Duration::ZERO, Duration::from_secs(u64::MAX));
        assert_eq!(cfg.poll.initial_interval, Duration::from_millis(1));
        assert_eq!(cfg.poll.max_interval, MAX_POLL_INTERVAL);
        assert!(cfg.poll.jittered(cfg.poll.max_interval) <= MAX_POLL_INTERVAL);
    }

    #[test]
    fn bad_jitter_and_huge_intervals_do_not_panic() {
        let cfg = PollConfig {
            jitter: f64::NAN,
            max_interval: Duration::from_secs(u64::MAX),
            multiplier: f64::NAN,
            ..PollConfig::default()
        };
        assert_eq!(cfg.jittered(Duration::from_secs(10)), Duration::from_secs(10));
        assert_eq!(cfg.jittered(Duration::MAX), MAX_POLL_INTERVAL);
        assert_eq!(cfg.next_interval(Duration::from_secs(10), false), Duration::from_secs(10));
        assert_eq!(cfg.next_interval(Duration::MAX, false), MAX_POLL_INTERVAL);

        let wide = PollConfig {
            jitter: 7.0,
            multiplier: f64::INFINITY,
            ..PollConfig::default()
        };
        assert_eq!(wide.jittered(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(wide.next_interval(Duration::from_secs(3), false), wide.max_interval);
    }
}
