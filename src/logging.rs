//! Logging setup for the transfer tool.
//!
//! Human readable console output by default, JSON lines with `--json-logs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default to DEBUG instead of INFO.
    pub verbose: bool,
}

impl LogConfig {
    pub fn directive(&self) -> String {
        let level = if self.verbose { Level::DEBUG } else { Level::INFO };
        format!("p2v_transfer={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the level chosen
/// from `verbose`.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    // Logs go to stderr so ssh prompts and rsync output stay readable.
    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Rate limiter for progress messages that would otherwise flood the log.
pub struct LogThrottle {
    interval_ms: u64,
    /// Stores the last log time in ms, or u64::MAX to indicate "never logged"
    last_log_ms: AtomicU64,
    start: Instant,
}

/// Sentinel value indicating the throttle has never logged
const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    /// Create a new throttle with the given minimum interval between logs.
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// Returns true if at least one interval has passed since the last log.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let should = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            // Losing the race means another thread just logged.
            self.last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }

    #[test]
    fn verbose_lowers_default_level() {
        assert_eq!(LogConfig::default().directive(), "p2v_transfer=info");
        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.directive(), "p2v_transfer=debug");
    }
}
