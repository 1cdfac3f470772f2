//! Scheduler Core (SC) — §4.2.
//!
//! Two cron-driven tick loops (one per [`WorkKind`]) built on
//! `tokio-cron-scheduler`, the same crate the wider Seesaw ecosystem uses
//! for its periodic tasks (see `fourthplaces-mntogether`'s
//! `kernel/scheduled_tasks.rs`). Each tick claims a due batch, fans the
//! batch out concurrently, and never lets one item's failure unwind the
//! timer.

use std::sync::Arc;

use crawlsched_core::broker::{publish, BrokerPublisher, PublishOptions};
use crawlsched_core::policy::{PREDEFINED_CRON, SCHEDULED_CRON};
use crawlsched_core::store::{ClaimedItem, WorkKind, WorkStore};
use crawlsched_core::{CoreError, FetchUrlDto, ItemStatus, UrlString, MAX_RETRIES};
use tokio_cron_scheduler::{Job, JobScheduler};

const LEASE_BATCH_LIMIT: i64 = crawlsched_core::store::DEFAULT_LEASE_LIMIT;

/// Dispatches a single leased item: publishes it, then transitions it to
/// its next state. Never returns an error — every failure is logged and
/// folded into a state transition instead, per §4.2/§7.
pub async fn dispatch_one(store: &dyn WorkStore, publisher: &dyn BrokerPublisher, kind: WorkKind, item: ClaimedItem) {
    if item.retry_count > MAX_RETRIES {
        if let Err(e) = store
            .transition_item(
                kind,
                item.id,
                ItemStatus::Failed,
                item.retry_count,
                Some("Max retry count exceeded".to_string()),
                None,
            )
            .await
        {
            tracing::error!(item_id = item.id, error = %e, "failed to transition exhausted item to FAILED");
        }
        return;
    }

    let dto = match UrlString::validate(item.url.clone()) {
        Ok(url) => FetchUrlDto { url },
        Err(e) => {
            tracing::error!(item_id = item.id, url = item.url, error = %e, "leased item carries an invalid url");
            return;
        }
    };

    let publish_result = publish(
        publisher,
        &dto,
        &item.task_data.exchange,
        &item.task_data.routing_key,
        PublishOptions::default(),
    )
    .await;

    let transition_result = match publish_result {
        Ok(()) => {
            store
                .transition_item(kind, item.id, ItemStatus::Completed, item.retry_count, None, None)
                .await
        }
        Err(e) => {
            tracing::error!(item_id = item.id, error = %e, "publish failed, requeuing");
            store
                .transition_item(
                    kind,
                    item.id,
                    ItemStatus::Pending,
                    item.retry_count + 1,
                    Some(e.to_string()),
                    None,
                )
                .await
        }
    };

    if let Err(e) = transition_result {
        tracing::error!(item_id = item.id, error = %e, "failed to persist dispatch outcome");
    }
}

/// Claims and drains one due batch of `kind`, fanning dispatch out
/// concurrently and unordered (§4.2 step 2b/2c).
pub async fn process_batch(store: &dyn WorkStore, publisher: &dyn BrokerPublisher, kind: WorkKind) {
    let leased = match store.lease_due_batch(kind, LEASE_BATCH_LIMIT).await {
        Ok(items) => items,
        Err(e) => {
            tracing::error!(?kind, error = %e, "lease_due_batch failed");
            return;
        }
    };

    if leased.is_empty() {
        return;
    }
    tracing::debug!(?kind, count = leased.len(), "dispatching leased batch");

    let dispatches = leased.into_iter().map(|item| dispatch_one(store, publisher, kind, item));
    futures::future::join_all(dispatches).await;
}

/// Builds and starts the two cron jobs. Returns the running
/// `JobScheduler`; dropping or shutting it down stops both loops.
pub async fn start(store: Arc<dyn WorkStore>, publisher: Arc<dyn BrokerPublisher>) -> Result<JobScheduler, CoreError> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| CoreError::Internal(format!("failed to start cron scheduler: {e}")))?;

    let scheduled_store = store.clone();
    let scheduled_publisher = publisher.clone();
    let scheduled_job = Job::new_async(SCHEDULED_CRON, move |_uuid, _lock| {
        let store = scheduled_store.clone();
        let publisher = scheduled_publisher.clone();
        Box::pin(async move {
            process_batch(store.as_ref(), publisher.as_ref(), WorkKind::Scheduled).await;
        })
    })
    .map_err(|e| CoreError::Internal(format!("invalid scheduled-loop cron expression: {e}")))?;
    scheduler
        .add(scheduled_job)
        .await
        .map_err(|e| CoreError::Internal(format!("failed to register scheduled loop: {e}")))?;

    let predefined_store = store;
    let predefined_publisher = publisher;
    let predefined_job = Job::new_async(PREDEFINED_CRON, move |_uuid, _lock| {
        let store = predefined_store.clone();
        let publisher = predefined_publisher.clone();
        Box::pin(async move {
            process_batch(store.as_ref(), publisher.as_ref(), WorkKind::Predefined).await;
        })
    })
    .map_err(|e| CoreError::Internal(format!("invalid predefined-loop cron expression: {e}")))?;
    scheduler
        .add(predefined_job)
        .await
        .map_err(|e| CoreError::Internal(format!("failed to register predefined loop: {e}")))?;

    scheduler
        .start()
        .await
        .map_err(|e| CoreError::Internal(format!("failed to start cron scheduler: {e}")))?;

    tracing::info!(
        scheduled_cron = SCHEDULED_CRON,
        predefined_cron = PREDEFINED_CRON,
        "scheduler core started"
    );
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlsched_core::TaskData;
    use crawlsched_testing::{InMemoryWorkStore, RecordingBrokerPublisher};

    fn task_data() -> TaskData {
        TaskData {
            exchange: "news.direct".into(),
            queue: "news.crawler.fetch_url".into(),
            routing_key: "crawler.fetch_url".into(),
        }
    }

    #[tokio::test]
    async fn happy_path_completes_on_successful_publish() {
        let store = InMemoryWorkStore::new();
        let publisher = RecordingBrokerPublisher::new();
        let id = store.seed_scheduled("https://hetq.am/hy/articles/", chrono::Utc::now(), task_data());

        process_batch(&store, &publisher, WorkKind::Scheduled).await;

        assert_eq!(store.status_of(WorkKind::Scheduled, id), Some(ItemStatus::Completed));
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(publisher.published()[0].routing_key, "crawler.fetch_url");
    }

    #[tokio::test]
    async fn transient_publish_failures_requeue_with_incrementing_retry_count() {
        let store = InMemoryWorkStore::new();
        let publisher = RecordingBrokerPublisher::new();
        let id = store.seed_scheduled("https://hetq.am/hy/articles/", chrono::Utc::now(), task_data());

        for expected_retry_count in 1..=(MAX_RETRIES + 1) {
            publisher.fail_next(1);
            process_batch(&store, &publisher, WorkKind::Scheduled).await;
            assert_eq!(store.retry_count_of(WorkKind::Scheduled, id), Some(expected_retry_count));
            assert_eq!(store.status_of(WorkKind::Scheduled, id), Some(ItemStatus::Pending));
        }

        // One more lease observes retry_count > MAX_RETRIES and fails terminally
        // without attempting another publish.
        process_batch(&store, &publisher, WorkKind::Scheduled).await;
        assert_eq!(store.status_of(WorkKind::Scheduled, id), Some(ItemStatus::Failed));
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn predefined_items_are_leased_regardless_of_schedule() {
        let store = InMemoryWorkStore::new();
        let publisher = RecordingBrokerPublisher::new();
        let id = store.add_predefined(crawlsched_core::NewPredefinedItem {
            task_data: task_data(),
            url: "https://hetq.am/hy/articles/".to_string(),
        })
        .await
        .unwrap();

        process_batch(&store, &publisher, WorkKind::Predefined).await;

        assert_eq!(store.status_of(WorkKind::Predefined, id), Some(ItemStatus::Completed));
    }
}
