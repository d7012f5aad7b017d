//! Runtime configuration
//!
//! Defaults come from the environment (`STRAND_*`) via the `env_get`
//! helpers; everything can be overridden per scheduler with the builder.

use std::sync::OnceLock;
use std::time::Duration;

use strand_core::env::env_get;
use strand_core::error::{RtError, RtResult};

/// Default usable stack size per fiber (`STRAND_STACK_SIZE`, bytes).
pub fn default_stack_size() -> usize {
    static CACHED: OnceLock<usize> = OnceLock::new();
    *CACHED.get_or_init(|| env_get("STRAND_STACK_SIZE", 128 * 1024))
}

/// Tunables for a scheduler or IO manager instance.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Usable stack size for fibers created by this scheduler.
    pub stack_size: usize,

    /// How long the default idle fiber sleeps between queue checks.
    pub idle_interval: Duration,

    /// Upper bound on a single poller wait, even with no timer due.
    pub poll_cap_ms: u64,

    /// Maximum events drained per poller wakeup.
    pub poll_batch: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            idle_interval: Duration::from_millis(env_get("STRAND_IDLE_INTERVAL_MS", 1000u64)),
            poll_cap_ms: env_get("STRAND_POLL_CAP_MS", 5000u64),
            poll_batch: env_get("STRAND_POLL_BATCH", 256usize),
        }
    }
}

impl SchedulerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn idle_interval(mut self, d: Duration) -> Self {
        self.idle_interval = d;
        self
    }

    pub fn poll_cap_ms(mut self, ms: u64) -> Self {
        self.poll_cap_ms = ms;
        self
    }

    pub fn poll_batch(mut self, n: usize) -> Self {
        self.poll_batch = n;
        self
    }

    pub fn validate(&self) -> RtResult<()> {
        if self.stack_size < 16 * 1024 {
            return Err(RtError::InvalidOptions("stack_size below 16 KiB"));
        }
        if self.poll_cap_ms == 0 {
            return Err(RtError::InvalidOptions("poll_cap_ms must be positive"));
        }
        if self.poll_batch == 0 {
            return Err(RtError::InvalidOptions("poll_batch must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SchedulerOptions::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let opts = SchedulerOptions::new()
            .stack_size(64 * 1024)
            .idle_interval(Duration::from_millis(5))
            .poll_cap_ms(100)
            .poll_batch(32);
        assert_eq!(opts.stack_size, 64 * 1024);
        assert_eq!(opts.poll_cap_ms, 100);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_stack() {
        let opts = SchedulerOptions::new().stack_size(1024);
        assert!(matches!(opts.validate(), Err(RtError::InvalidOptions(_))));
    }
}
