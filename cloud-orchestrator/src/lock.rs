//! Advisory file lock serialising allocation.
//!
//! fqdn uniqueness, NIC allocation and external port allocation are
//! read-then-write scans over the cluster. Workers sharing the lock file run
//! those scans one at a time. Writers that bypass the lock are not covered.

use cloud_core::{CloudError, PollPolicy, Result};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AllocationLock {
    path: PathBuf,
    policy: PollPolicy,
}

impl AllocationLock {
    pub fn new(path: impl Into<PathBuf>, policy: PollPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `work` while holding the exclusive lock.
    pub async fn with_lock<F, Fut, T>(&self, what: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| {
                CloudError::Unavailable(format!(
                    "cannot open allocation lock {}: {e}",
                    self.path.display()
                ))
            })?;

        let started = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    if started.elapsed() >= self.policy.timeout {
                        return Err(CloudError::Unavailable(format!(
                            "timeout waiting for allocation lock after {attempts} attempts: {e}"
                        )));
                    }
                    sleep(self.policy.interval).await;
                }
            }
        }
        debug!(what, attempts, "allocation lock acquired");

        let _guard = scopeguard::guard(file, |file| {
            let _ = FileExt::unlock(&file);
        });

        work().await
    }
}
