//! Retry policy for remote calls.

use std::future::Future;
use std::time::Duration;

use affinity_graph::NodeId;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::watchdog::Watchdog;

/// Bounded retries with a fixed wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRetry {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl Default for IoRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            wait: Duration::from_millis(100),
        }
    }
}

impl IoRetry {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self { max_attempts, wait }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Run `op` against `target` until it succeeds, fails with an error that
    /// retrying cannot fix, or the attempts run out.
    ///
    /// A target the watchdog already considers dead is not retried. When the
    /// attempts run out the target is reported to the watchdog as failed.
    pub async fn run<T, F, Fut>(&self, target: NodeId, watchdog: &dyn Watchdog, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };
            if !watchdog.is_alive(target) {
                debug!(node = %target, "target is dead, not retrying");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(node = %target, attempts = attempt, error = %err, "giving up on remote call");
                watchdog.report_failure(target);
                return Err(err);
            }
            debug!(node = %target, attempt, error = %err, "retrying remote call");
            tokio::time::sleep(self.wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::watchdog::LocalWatchdog;

    fn quick() -> IoRetry {
        IoRetry::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let watchdog = LocalWatchdog::new();
        let calls = AtomicU32::new(0);
        let result = quick()
            .run(NodeId(1), &watchdog, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::communication(NodeId(1), "reset"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(watchdog.is_alive(NodeId(1)));
    }

    #[tokio::test]
    async fn exhaustion_reports_target_failed() {
        let watchdog = LocalWatchdog::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = quick()
            .run(NodeId(2), &watchdog, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::communication(NodeId(2), "refused"))
            })
            .await;
        assert!(matches!(result, Err(Error::Communication { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!watchdog.is_alive(NodeId(2)));
    }

    #[tokio::test]
    async fn protocol_errors_are_not_retried() {
        let watchdog = LocalWatchdog::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = quick()
            .run(NodeId(3), &watchdog, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Protocol("stale".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_targets_are_not_retried() {
        let watchdog = LocalWatchdog::new();
        watchdog.report_failure(NodeId(4));
        let calls = AtomicU32::new(0);
        let _: Result<()> = quick()
            .run(NodeId(4), &watchdog, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::communication(NodeId(4), "refused"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
