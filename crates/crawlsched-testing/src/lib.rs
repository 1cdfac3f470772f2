//! In-memory fakes of [`WorkStore`] and [`BrokerPublisher`], shared across
//! the rest of the workspace's test suites. Mirrors the `InMemoryStore`
//! pattern used for `MachineStore` in the wider Seesaw ecosystem: a
//! `Mutex`-guarded `HashMap`, no persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawlsched_core::store::{ClaimedItem, UrlRepository, WorkKind, WorkStore};
use crawlsched_core::{CoreError, ItemStatus, NewPredefinedItem, NewScheduledItem, NewUrl, TaskData, Url};

#[derive(Debug, Clone)]
struct StoredItem {
    url: String,
    status: ItemStatus,
    scheduled_time: Option<DateTime<Utc>>,
    retry_count: i32,
    task_data: TaskData,
    exception_info: Option<String>,
    updated_at: DateTime<Utc>,
}

/// An in-memory [`WorkStore`] for scheduler/dlq/reaper tests. Both queues
/// share one id space so fixtures can mix `Scheduled`/`Predefined` items
/// without collision.
pub struct InMemoryWorkStore {
    scheduled: Mutex<HashMap<i64, StoredItem>>,
    predefined: Mutex<HashMap<i64, StoredItem>>,
    next_id: Mutex<i64>,
}

impl Default for InMemoryWorkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkStore {
    pub fn new() -> Self {
        Self {
            scheduled: Mutex::new(HashMap::new()),
            predefined: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    fn table(&self, kind: WorkKind) -> &Mutex<HashMap<i64, StoredItem>> {
        match kind {
            WorkKind::Scheduled => &self.scheduled,
            WorkKind::Predefined => &self.predefined,
        }
    }

    fn alloc_id(&self) -> i64 {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    /// Seeds a `PENDING` scheduled item directly, bypassing `add_item`, for
    /// tests that want to control `scheduled_time` and starting status.
    pub fn seed_scheduled(&self, url: &str, scheduled_time: DateTime<Utc>, task_data: TaskData) -> i64 {
        let id = self.alloc_id();
        self.scheduled.lock().unwrap().insert(
            id,
            StoredItem {
                url: url.to_string(),
                status: ItemStatus::Pending,
                scheduled_time: Some(scheduled_time),
                retry_count: 0,
                task_data,
                exception_info: None,
                updated_at: Utc::now(),
            },
        );
        id
    }

    pub fn status_of(&self, kind: WorkKind, id: i64) -> Option<ItemStatus> {
        self.table(kind).lock().unwrap().get(&id).map(|i| i.status)
    }

    pub fn retry_count_of(&self, kind: WorkKind, id: i64) -> Option<i32> {
        self.table(kind).lock().unwrap().get(&id).map(|i| i.retry_count)
    }

    /// Number of rows currently stored for `kind`, for idempotence
    /// assertions (spec S3: duplicate submission yields exactly one row).
    pub fn count(&self, kind: WorkKind) -> usize {
        self.table(kind).lock().unwrap().len()
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn lease_due_batch(&self, kind: WorkKind, limit: i64) -> Result<Vec<ClaimedItem>, CoreError> {
        let now = Utc::now();
        let mut table = self.table(kind).lock().unwrap();
        let mut eligible: Vec<i64> = table
            .iter()
            .filter(|(_, item)| {
                item.status == ItemStatus::Pending
                    && item.scheduled_time.map(|t| t <= now).unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();
        eligible.sort_by_key(|id| {
            let item = &table[id];
            (item.scheduled_time.unwrap_or(now), *id)
        });
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let item = table.get_mut(&id).expect("id came from the same map");
            item.status = ItemStatus::Processing;
            item.updated_at = Utc::now();
            claimed.push(ClaimedItem {
                id,
                url: item.url.clone(),
                retry_count: item.retry_count,
                task_data: item.task_data.clone(),
                scheduled_time: item.scheduled_time,
            });
        }
        Ok(claimed)
    }

    async fn transition_item(
        &self,
        kind: WorkKind,
        id: i64,
        new_status: ItemStatus,
        retry_count: i32,
        exception: Option<String>,
        next_scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let mut table = self.table(kind).lock().unwrap();
        if let Some(item) = table.get_mut(&id) {
            if item.status.is_terminal() {
                return Ok(());
            }
            item.status = new_status;
            item.retry_count = retry_count;
            item.exception_info = exception;
            if let Some(ts) = next_scheduled_time {
                item.scheduled_time = Some(ts);
            }
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn add_item(&self, item: NewScheduledItem) -> Result<i64, CoreError> {
        let id = self.alloc_id();
        self.scheduled.lock().unwrap().insert(
            id,
            StoredItem {
                url: item.url,
                status: ItemStatus::Pending,
                scheduled_time: Some(item.scheduled_time),
                retry_count: 0,
                task_data: item.task_data,
                exception_info: None,
                updated_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn add_predefined(&self, item: NewPredefinedItem) -> Result<i64, CoreError> {
        let id = self.alloc_id();
        self.predefined.lock().unwrap().insert(
            id,
            StoredItem {
                url: item.url,
                status: ItemStatus::Pending,
                scheduled_time: None,
                retry_count: 0,
                task_data: item.task_data,
                exception_info: None,
                updated_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn exists_by_url_ci(&self, url: &str) -> Result<bool, CoreError> {
        let lower = url.to_lowercase();
        Ok(self
            .scheduled
            .lock()
            .unwrap()
            .values()
            .any(|item| item.url.to_lowercase() == lower))
    }

    async fn reclaim_expired(&self, kind: WorkKind, lease_ttl: chrono::Duration) -> Result<Vec<i64>, CoreError> {
        let now = Utc::now();
        let mut table = self.table(kind).lock().unwrap();
        let mut reclaimed = Vec::new();
        for (id, item) in table.iter_mut() {
            if item.status == ItemStatus::Processing && now - item.updated_at >= lease_ttl {
                item.status = ItemStatus::Pending;
                item.retry_count += 1;
                item.updated_at = now;
                reclaimed.push(*id);
            }
        }
        Ok(reclaimed)
    }
}

/// An in-memory [`UrlRepository`] for discovery-worker/intake tests.
pub struct InMemoryUrlRepository {
    urls: Mutex<HashMap<i64, Url>>,
    next_id: Mutex<i64>,
    page_data: Mutex<HashMap<i64, crawlsched_core::NewPageData>>,
}

impl Default for InMemoryUrlRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUrlRepository {
    pub fn new() -> Self {
        Self {
            urls: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            page_data: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whatever page data was last saved for `url_id`, for
    /// asserting on parser output in tests.
    pub fn page_data_of(&self, url_id: i64) -> Option<crawlsched_core::NewPageData> {
        self.page_data.lock().unwrap().get(&url_id).cloned()
    }
}

#[async_trait]
impl UrlRepository for InMemoryUrlRepository {
    async fn insert(&self, new_url: NewUrl) -> Result<Url, CoreError> {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        let url = Url {
            id,
            url: new_url.url,
            crawling_status: crawlsched_core::CrawlingStatus::Idle,
            crawled_at: None,
            parent_id: new_url.parent_id,
            created_at: Utc::now(),
        };
        self.urls.lock().unwrap().insert(id, url.clone());
        Ok(url)
    }

    async fn exists_by_url_ci(&self, url: &str) -> Result<bool, CoreError> {
        let lower = url.to_lowercase();
        Ok(self.urls.lock().unwrap().values().any(|u| u.url.to_lowercase() == lower))
    }

    async fn find_by_url_ci(&self, url: &str) -> Result<Option<Url>, CoreError> {
        let lower = url.to_lowercase();
        Ok(self.urls.lock().unwrap().values().find(|u| u.url.to_lowercase() == lower).cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Url>, CoreError> {
        Ok(self.urls.lock().unwrap().get(&id).cloned())
    }

    async fn sub_urls_of(&self, parent_id: i64) -> Result<Vec<Url>, CoreError> {
        Ok(self
            .urls
            .lock()
            .unwrap()
            .values()
            .filter(|u| u.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn mark_crawled(&self, id: i64, crawled_at: DateTime<Utc>) -> Result<(), CoreError> {
        if let Some(url) = self.urls.lock().unwrap().get_mut(&id) {
            url.crawled_at = Some(crawled_at);
        }
        Ok(())
    }

    async fn save_page_data(&self, url_id: i64, data: crawlsched_core::NewPageData) -> Result<(), CoreError> {
        self.page_data.lock().unwrap().insert(url_id, data);
        Ok(())
    }
}

/// A [`BrokerPublisher`] fake that records every publish and can be told
/// to fail the next N calls, for exercising the S2 retry scenario.
pub struct RecordingBrokerPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    remaining_failures: Mutex<u32>,
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub body: serde_json::Value,
    pub exchange: String,
    pub routing_key: String,
}

impl Default for RecordingBrokerPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBrokerPublisher {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            remaining_failures: Mutex::new(0),
        }
    }

    /// The next `count` calls to `publish_json` return `BadGateway`.
    pub fn fail_next(&self, count: u32) {
        *self.remaining_failures.lock().unwrap() = count;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl crawlsched_core::BrokerPublisher for RecordingBrokerPublisher {
    async fn publish_json(
        &self,
        body: serde_json::Value,
        exchange: &str,
        routing_key: &str,
        _options: crawlsched_core::PublishOptions,
    ) -> Result<(), CoreError> {
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(CoreError::BadGateway("simulated publish failure".into()));
        }
        drop(remaining);
        self.published.lock().unwrap().push(PublishedMessage {
            body,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlsched_core::TaskData;

    fn task_data() -> TaskData {
        TaskData {
            exchange: "news.direct".into(),
            queue: "news.crawler.fetch_url".into(),
            routing_key: "crawler.fetch_url".into(),
        }
    }

    #[tokio::test]
    async fn lease_claims_due_items_only() {
        let store = InMemoryWorkStore::new();
        let due = store.seed_scheduled("https://a.example", Utc::now() - chrono::Duration::seconds(5), task_data());
        let not_due = store.seed_scheduled("https://b.example", Utc::now() + chrono::Duration::hours(1), task_data());

        let leased = store.lease_due_batch(WorkKind::Scheduled, 10).await.unwrap();

        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, due);
        assert_eq!(store.status_of(WorkKind::Scheduled, due), Some(ItemStatus::Processing));
        assert_eq!(store.status_of(WorkKind::Scheduled, not_due), Some(ItemStatus::Pending));
    }

    #[tokio::test]
    async fn terminal_status_blocks_further_transitions() {
        let store = InMemoryWorkStore::new();
        let id = store.seed_scheduled("https://a.example", Utc::now(), task_data());
        store
            .transition_item(WorkKind::Scheduled, id, ItemStatus::Completed, 0, None, None)
            .await
            .unwrap();
        store
            .transition_item(WorkKind::Scheduled, id, ItemStatus::Pending, 9, None, None)
            .await
            .unwrap();
        assert_eq!(store.status_of(WorkKind::Scheduled, id), Some(ItemStatus::Completed));
    }

    #[tokio::test]
    async fn recording_publisher_fails_then_succeeds() {
        let publisher = RecordingBrokerPublisher::new();
        publisher.fail_next(1);
        let err = crawlsched_core::publish(
            &publisher,
            &task_data(),
            "news.direct",
            "crawler.fetch_url",
            Default::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "BAD_GATEWAY");

        crawlsched_core::publish(&publisher, &task_data(), "news.direct", "crawler.fetch_url", Default::default())
            .await
            .unwrap();
        assert_eq!(publisher.published().len(), 1);
    }
}
