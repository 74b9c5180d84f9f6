//! Bounded polling for asynchronous hypervisor work.
//!
//! The hypervisor finishes clones, migrations, disk resizes and agent start-up
//! in the background. Callers wait on it with [`poll_until`], which keeps the
//! fixed-interval/maximum-timeout contract but sleeps on the tokio timer, so a
//! waiting worker can serve other requests and dropping the future cancels
//! the wait.

use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Poll once per second for at most `timeout_secs`.
    pub fn from_secs(timeout_secs: u64) -> Self {
        Self::new(Duration::from_secs(timeout_secs), Duration::from_secs(1))
    }
}

/// Run `probe` until it reports `true`.
///
/// Errors returned by the probe abort the wait immediately; a probe that wants
/// to tolerate transient failures should map them to `Ok(false)`. When the
/// deadline passes, fails with `Unavailable("timeout waiting for <what> ...")`.
pub async fn poll_until<F, Fut>(policy: PollPolicy, what: &str, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if probe().await? {
            debug!(what, attempts, "poll condition satisfied");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(CloudError::Unavailable(format!(
                "timeout waiting for {} after {}s ({} attempts)",
                what,
                policy.timeout.as_secs_f32(),
                attempts
            )));
        }

        sleep(policy.interval).await;
    }
}
