//! Periodic affinity group computation.

use std::sync::Arc;
use std::time::Duration;

use affinity_graph::RelocatingAffinityGroup;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::validate_update_frequency;
use crate::error::{Error, Result};
use crate::finder::AffinityGroupFinder;

/// Latest published partition.
pub type Groups = Arc<Vec<RelocatingAffinityGroup>>;

struct DriverInner {
    finder: Arc<dyn AffinityGroupFinder>,
    frequency: Duration,
    groups: watch::Sender<Groups>,
    stop: watch::Sender<bool>,
}

/// Calls a finder on a fixed schedule and publishes each successful result.
///
/// Published partitions are immutable; a failed run leaves the previous one
/// in place.
#[derive(Clone)]
pub struct GroupDriver {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for GroupDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDriver")
            .field("frequency", &self.inner.frequency)
            .field("groups", &self.inner.groups.borrow().len())
            .finish()
    }
}

impl GroupDriver {
    pub fn new(finder: Arc<dyn AffinityGroupFinder>, frequency: Duration) -> Result<Self> {
        validate_update_frequency(frequency)?;
        let (groups, _) = watch::channel(Arc::new(Vec::new()));
        let (stop, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(DriverInner {
                finder,
                frequency,
                groups,
                stop,
            }),
        })
    }

    pub fn finder(&self) -> Arc<dyn AffinityGroupFinder> {
        Arc::clone(&self.inner.finder)
    }

    pub fn frequency(&self) -> Duration {
        self.inner.frequency
    }

    /// Receiver that sees every newly published partition.
    pub fn subscribe(&self) -> watch::Receiver<Groups> {
        self.inner.groups.subscribe()
    }

    pub fn latest(&self) -> Groups {
        Arc::clone(&self.inner.groups.borrow())
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Run the finder once. Returns the newly published partition, or `None`
    /// when the run failed and nothing was published.
    pub async fn run_once(&self) -> Option<Groups> {
        match self.inner.finder.find_affinity_groups().await {
            Ok(groups) => {
                let groups = Arc::new(groups);
                debug!(groups = groups.len(), "publishing affinity groups");
                self.inner.groups.send_replace(Arc::clone(&groups));
                Some(groups)
            }
            Err(Error::Shutdown) => {
                self.stop();
                None
            }
            Err(e) => {
                warn!(error = %e, "affinity group run failed, keeping previous groups");
                None
            }
        }
    }

    /// Start the periodic loop. The first run happens one period from now.
    pub fn spawn(&self) -> JoinHandle<()> {
        let driver = self.clone();
        let mut stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            let period = driver.inner.frequency;
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, "affinity group driver started");
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticks.tick() => {
                        driver.run_once().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("affinity group driver stopped");
        })
    }

    fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Stop the loop and shut the finder down.
    pub async fn shutdown(&self) {
        self.stop();
        self.inner.finder.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use affinity_graph::{Identity, NodeId};
    use async_trait::async_trait;

    use super::*;
    use crate::finder::FinderStats;

    /// Fails every other call.
    #[derive(Default)]
    struct Flaky {
        calls: AtomicU32,
        shut: AtomicU32,
    }

    #[async_trait]
    impl AffinityGroupFinder for Flaky {
        async fn find_affinity_groups(&self) -> Result<Vec<RelocatingAffinityGroup>> {
            if self.shut.load(Ordering::SeqCst) > 0 {
                return Err(Error::Shutdown);
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 1 {
                return Err(Error::Protocol("flaky".to_string()));
            }
            let placement: BTreeMap<Identity, NodeId> =
                [(Identity::new(u64::from(call) + 1), NodeId(1))].into_iter().collect();
            Ok(vec![RelocatingAffinityGroup::new(1, u64::from(call), placement)?])
        }

        async fn remove_node(&self, _node: NodeId) {}

        async fn enable(&self) -> Result<()> {
            Ok(())
        }

        async fn disable(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {
            self.shut.fetch_add(1, Ordering::SeqCst);
        }

        fn stats(&self) -> FinderStats {
            FinderStats::default()
        }
    }

    #[test]
    fn rejects_out_of_range_frequency() {
        let finder: Arc<dyn AffinityGroupFinder> = Arc::new(Flaky::default());
        assert!(GroupDriver::new(Arc::clone(&finder), Duration::from_secs(4)).is_err());
        assert!(GroupDriver::new(Arc::clone(&finder), Duration::from_secs(65536)).is_err());
        assert!(GroupDriver::new(finder, Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn failed_run_keeps_previous_groups() {
        let driver = GroupDriver::new(Arc::new(Flaky::default()), Duration::from_secs(60)).unwrap();
        let mut updates = driver.subscribe();

        let first = driver.run_once().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(updates.has_changed().unwrap());
        updates.borrow_and_update();

        assert!(driver.run_once().await.is_none());
        assert!(!updates.has_changed().unwrap());
        assert!(Arc::ptr_eq(&driver.latest(), &first));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_loop_publishes_and_stops() {
        let driver = GroupDriver::new(Arc::new(Flaky::default()), Duration::from_secs(5)).unwrap();
        let mut updates = driver.subscribe();
        let handle = driver.spawn();

        tokio::time::timeout(Duration::from_secs(30), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(driver.latest().len(), 1);

        driver.shutdown().await;
        handle.await.unwrap();
        assert!(driver.is_stopped());
        assert!(driver.run_once().await.is_none());
    }
}
