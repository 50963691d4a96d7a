//! Bounded polling for wait-mode admin operations
//!
//! A wait re-reads metadata snapshots with jittered exponential backoff
//! until its condition holds or the deadline passes. Dropping the future
//! cancels the wait; nothing is rolled back.

use crate::common::metrics::METRICS;
use crate::common::{AdminConfig, Backoff, Error, Result};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl WaitPolicy {
    pub fn from_config(config: &AdminConfig) -> Self {
        Self {
            timeout: config.wait_timeout(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::from_config(&AdminConfig::default())
    }
}

/// Poll `check` until it returns `true`, failing with [`Error::Timeout`]
/// once the policy's deadline passes. Errors from `check` end the wait.
pub async fn poll_until<F>(policy: &WaitPolicy, operation: &'static str, mut check: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let mut polls = 0u32;

    loop {
        polls += 1;
        if check()? {
            METRICS.record_wait(operation, started.elapsed());
            tracing::debug!(operation, polls, elapsed_ms = started.elapsed().as_millis() as u64, "Wait satisfied");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            METRICS.wait_timeouts.inc();
            METRICS.record_wait(operation, started.elapsed());
            return Err(Error::Timeout(format!(
                "{} not observed within {:?} ({} polls)",
                operation, policy.timeout, polls
            )));
        }
        tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
    }
}
