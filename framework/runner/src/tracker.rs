use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// TTL on every tracker entry so abandoned runs self-expire.
pub const RUN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

fn run_key(run_id: &str) -> String {
    format!("gust:run:{run_id}:remaining")
}

/// Remaining-count of a run as seen by the tracker.
///
/// `Unknown` means the entry is absent or expired. It must never be treated
/// as zero remaining: the run may have completed on another replica, or the
/// entry may simply have expired mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Count(i64),
    Unknown,
}

/// Backing store for the run tracker.
///
/// A shared implementation (e.g. Redis `SETEX`/`DECR`/`EXPIRE`) gives the
/// fleet cross-process completion detection. The in-memory implementation
/// offers the identical contract within one process.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Startup connectivity probe. A store that fails the probe is not used.
    async fn probe(&self) -> anyhow::Result<()>;

    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()>;

    /// Atomically decrement `key` and refresh its TTL. Returns `None` when
    /// the key is absent or expired.
    async fn decrement_with_refresh(&self, key: &str, ttl: Duration)
        -> anyhow::Result<Option<i64>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Process-local counter store used when no shared store is configured or
/// reachable. Completion detection then degrades to best-effort within one
/// process, behind the same interface.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn decrement_with_refresh(
        &self,
        key: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<i64>> {
        let mut entries = self.entries.lock();

        let Some((value, deadline)) = entries.get_mut(key) else {
            return Ok(None);
        };

        if *deadline <= Instant::now() {
            entries.remove(key);
            return Ok(None);
        }

        *value -= 1;
        *deadline = Instant::now() + ttl;
        Ok(Some(*value))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Shared remaining-count per run id, used by replicas to agree when every
/// `process` unit of a fanned-out batch is done.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn CounterStore>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Pick the backing store: probe the shared store when one is configured
    /// and fall back to a process-local counter when it is not reachable.
    /// The call contract is identical either way.
    pub async fn select(shared: Option<Arc<dyn CounterStore>>) -> Self {
        match shared {
            Some(store) => match store.probe().await {
                Ok(()) => {
                    log::info!("Run tracker using shared counter store");
                    Self::new(store)
                }
                Err(e) => {
                    log::warn!(
                        "Shared counter store probe failed, falling back to in-memory tracker: {e:#}"
                    );
                    Self::new(Arc::new(MemoryCounterStore::new()))
                }
            },
            None => {
                log::info!("No shared counter store configured, using in-memory run tracker");
                Self::new(Arc::new(MemoryCounterStore::new()))
            }
        }
    }

    /// Initialize the remaining-count for `run_id` to `total`.
    pub async fn set(&self, run_id: &str, total: i64) -> anyhow::Result<()> {
        self.store.set_with_ttl(&run_key(run_id), total, RUN_TTL).await
    }

    /// Atomically decrement the remaining-count for `run_id`, refreshing its
    /// TTL so active runs do not expire mid-flight.
    ///
    /// A decrement that would take the count below zero deletes the entry and
    /// reports [Remaining::Unknown]: the run was already complete and further
    /// decrements carry no information. Negative counts are never surfaced.
    pub async fn decrement(&self, run_id: &str) -> anyhow::Result<Remaining> {
        let key = run_key(run_id);
        match self.store.decrement_with_refresh(&key, RUN_TTL).await? {
            Some(value) if value < 0 => {
                self.store.delete(&key).await?;
                Ok(Remaining::Unknown)
            }
            Some(value) => Ok(Remaining::Count(value)),
            None => Ok(Remaining::Unknown),
        }
    }

    /// Remove the entry for a recognized-complete run.
    pub async fn delete(&self, run_id: &str) -> anyhow::Result<()> {
        self.store.delete(&run_key(run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tracker() -> RunTracker {
        RunTracker::new(Arc::new(MemoryCounterStore::new()))
    }

    #[tokio::test]
    async fn decrement_counts_down_to_zero() {
        let tracker = tracker();
        tracker.set("run-1", 3).await.unwrap();

        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Count(2));
        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Count(1));
        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Count(0));
    }

    #[tokio::test]
    async fn decrement_past_zero_is_unknown_not_negative() {
        let tracker = tracker();
        tracker.set("run-1", 1).await.unwrap();

        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Count(0));
        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Unknown);
        // The entry is gone now, so the result stays Unknown.
        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Unknown);
    }

    #[tokio::test]
    async fn decrement_of_unset_run_is_unknown() {
        let tracker = tracker();
        assert_eq!(tracker.decrement("never-set").await.unwrap(), Remaining::Unknown);
    }

    #[tokio::test]
    async fn delete_forgets_the_run() {
        let tracker = tracker();
        tracker.set("run-1", 5).await.unwrap();
        tracker.delete("run-1").await.unwrap();

        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Unknown);
    }

    #[tokio::test]
    async fn expired_entries_read_as_unknown() {
        let store = MemoryCounterStore::new();
        store
            .set_with_ttl("gust:run:r:remaining", 2, Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            store
                .decrement_with_refresh("gust:run:r:remaining", Duration::from_secs(1))
                .await
                .unwrap(),
            None
        );
    }

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn probe(&self) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }

        async fn set_with_ttl(&self, _: &str, _: i64, _: Duration) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }

        async fn decrement_with_refresh(
            &self,
            _: &str,
            _: Duration,
        ) -> anyhow::Result<Option<i64>> {
            anyhow::bail!("connection refused")
        }

        async fn delete(&self, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn failed_probe_falls_back_to_memory() {
        let tracker = RunTracker::select(Some(Arc::new(UnreachableStore))).await;

        // The fallback honours the identical contract.
        tracker.set("run-1", 1).await.unwrap();
        assert_eq!(tracker.decrement("run-1").await.unwrap(), Remaining::Count(0));
    }
}
