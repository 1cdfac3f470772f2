//! Stale-lease reaper.
//!
//! No mechanism in the source implementation recovers `PROCESSING` items
//! whose dispatcher crashed mid-transition (spec "absent reaper" note).
//! This crate runs a supervised background tick, analogous to
//! `PgJobStore::reclaim_expired` in the Postgres job-queue lineage this
//! workspace descends from: items in `PROCESSING` past `lease_ttl` are
//! returned to `PENDING` with `retry_count + 1`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use crawlsched_core::store::WorkKind;
use crawlsched_core::WorkStore;

/// How long a `PROCESSING` item may sit unattended before the reaper
/// reclaims it. Derived from the concurrency model's worst-case lease
/// duration bound (publish retries included): ~15s, rounded up.
pub const DEFAULT_LEASE_TTL: Duration = Duration::seconds(20);

/// How often the reaper wakes to sweep both queues.
pub const DEFAULT_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(30);

pub struct Reaper {
    store: Arc<dyn WorkStore>,
    lease_ttl: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self {
            store,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(store: Arc<dyn WorkStore>, lease_ttl: Duration) -> Self {
        Self { store, lease_ttl }
    }

    /// Sweeps both queues once, logging but not propagating per-kind
    /// failures so one queue's DB error never stalls the other.
    pub async fn sweep_once(&self) {
        for kind in [WorkKind::Scheduled, WorkKind::Predefined] {
            match self.store.reclaim_expired(kind, self.lease_ttl).await {
                Ok(ids) if !ids.is_empty() => {
                    tracing::info!(?kind, count = ids.len(), "reaper reclaimed stale leases");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(?kind, error = %e, "reaper sweep failed"),
            }
        }
    }

    /// Spawns a supervised background task that sweeps every
    /// `DEFAULT_SWEEP_INTERVAL`, running until the returned handle is
    /// dropped or aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlsched_core::{ItemStatus, TaskData};
    use crawlsched_testing::InMemoryWorkStore;

    #[tokio::test]
    async fn sweep_reclaims_items_past_the_lease_ttl() {
        let store = Arc::new(InMemoryWorkStore::new());
        let id = store.seed_scheduled(
            "https://a.example",
            chrono::Utc::now(),
            TaskData {
                exchange: "news.direct".into(),
                queue: "news.crawler.fetch_url".into(),
                routing_key: "crawler.fetch_url".into(),
            },
        );
        store
            .lease_due_batch(WorkKind::Scheduled, 10)
            .await
            .unwrap();
        assert_eq!(store.status_of(WorkKind::Scheduled, id), Some(ItemStatus::Processing));

        let reaper = Reaper::with_lease_ttl(store.clone(), Duration::zero());
        reaper.sweep_once().await;

        assert_eq!(store.status_of(WorkKind::Scheduled, id), Some(ItemStatus::Pending));
        assert_eq!(store.retry_count_of(WorkKind::Scheduled, id), Some(1));
    }
}
