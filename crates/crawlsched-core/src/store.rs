//! Work Store contract — §4.1.
//!
//! Concrete implementations (`crawlsched-store-postgres`) provide the
//! transactional, skip-locked persistence; this crate only defines the
//! seam so the scheduler, intake and testing fakes can share one
//! vocabulary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{NewPageData, NewPredefinedItem, NewScheduledItem, NewUrl, TaskData, Url};
use crate::error::CoreError;
use crate::status::ItemStatus;

/// Distinguishes the two work queues. They share a schema shape but have
/// different eligibility predicates (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Scheduled,
    Predefined,
}

/// The row snapshot returned by `lease_due_batch`, common to both kinds.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub id: i64,
    pub url: String,
    pub retry_count: i32,
    pub task_data: TaskData,
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// Default batch size for `lease_due_batch`, per §4.1/§4.2.
pub const DEFAULT_LEASE_LIMIT: i64 = 10;

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Claims up to `limit` eligible items of `kind`, transitioning them
    /// to `PROCESSING` in the same transaction, and returns the updated
    /// snapshot. For `Scheduled`, eligibility additionally requires
    /// `scheduled_time <= now` and results are ordered by `scheduled_time`
    /// ascending, ties by `id`. Concurrent callers observe disjoint
    /// results (skip-locked).
    async fn lease_due_batch(&self, kind: WorkKind, limit: i64) -> Result<Vec<ClaimedItem>, CoreError>;

    /// Moves `id` to `new_status`, recording `retry_count` and the
    /// optional `exception`/`next_scheduled_time`. Does not itself
    /// validate the §3 transition table; callers must respect it. A
    /// conforming implementation protects terminal statuses with a
    /// `WHERE status NOT IN (...)` clause on the underlying UPDATE so a
    /// stray call against a finished item is a silent no-op rather than
    /// a state-machine violation (§9 "terminal-status protection").
    async fn transition_item(
        &self,
        kind: WorkKind,
        id: i64,
        new_status: ItemStatus,
        retry_count: i32,
        exception: Option<String>,
        next_scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Inserts a new `ScheduledItem`. Callers are expected to have
    /// already checked `exists_by_url_ci` (§7 idempotence note); this
    /// call does not itself deduplicate.
    async fn add_item(&self, item: NewScheduledItem) -> Result<i64, CoreError>;

    /// Inserts a new `PredefinedItem`.
    async fn add_predefined(&self, item: NewPredefinedItem) -> Result<i64, CoreError>;

    /// Case-insensitive existence check against `ScheduledItem.url`.
    async fn exists_by_url_ci(&self, url: &str) -> Result<bool, CoreError>;

    /// Returns `PROCESSING` items of `kind` whose lease has exceeded
    /// `lease_ttl`, reversing them to `PENDING` with `retry_count+1`.
    /// Grounds the §9 "absent reaper" recommendation. Returns the ids it
    /// reclaimed.
    async fn reclaim_expired(&self, kind: WorkKind, lease_ttl: chrono::Duration) -> Result<Vec<i64>, CoreError>;
}

/// URL sub-repository — insert, case-insensitive lookup, update-by-id,
/// mirroring the discipline of [`WorkStore`] (§4.1).
#[async_trait]
pub trait UrlRepository: Send + Sync {
    async fn insert(&self, new_url: NewUrl) -> Result<Url, CoreError>;
    async fn exists_by_url_ci(&self, url: &str) -> Result<bool, CoreError>;
    async fn find_by_url_ci(&self, url: &str) -> Result<Option<Url>, CoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Url>, CoreError>;
    async fn sub_urls_of(&self, parent_id: i64) -> Result<Vec<Url>, CoreError>;
    async fn mark_crawled(&self, id: i64, crawled_at: DateTime<Utc>) -> Result<(), CoreError>;

    /// Writes the parsed content/meta/author/index children for `url_id`,
    /// replacing any from a previous parse (§4.5 "idempotent re-parse").
    async fn save_page_data(&self, url_id: i64, data: NewPageData) -> Result<(), CoreError>;
}
