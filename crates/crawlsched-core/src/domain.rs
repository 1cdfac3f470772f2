//! Domain types for the crawl graph and the two work queues.
//!
//! Shapes mirror the original SQLAlchemy models in
//! `src/app/crawler/model.py` and `src/app/scheduler/model.py`/`dto.py`,
//! with status stored as text (see [`crate::status`]) rather than a
//! stringified integer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{CrawlingStatus, ItemStatus};
use crate::url_string::UrlString;

/// A crawled page and its place in the discovery graph.
///
/// `parent_id`/`sub_urls` mirror the self-referential `Url.parent`/
/// `Url.sub_urls` relationship in the original model — a discovered link is
/// stored as a child row pointing back at the page it was found on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Url {
    pub id: i64,
    pub url: String,
    pub crawling_status: CrawlingStatus,
    pub crawled_at: Option<DateTime<Utc>>,
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Url {
    pub fn new(url: UrlString, parent_id: Option<i64>) -> NewUrl {
        NewUrl {
            url: url.into_string(),
            parent_id,
        }
    }
}

/// Fields required to insert a new `Url` row; `id`/timestamps are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUrl {
    pub url: String,
    pub parent_id: Option<i64>,
}

/// Extracted page body, 1:N with [`Url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: i64,
    pub url_id: i64,
    pub title: String,
    pub content: String,
}

/// Author attribution, 1:N with [`Url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub url_id: i64,
    pub name: String,
    pub web_site: String,
}

/// Fetch metadata, 1:N with [`Url`], optionally pointing at an [`Author`].
///
/// Built from its own wire DTO fields, not borrowed from `Author` —
/// the original's `Meta` model and `MetaDto` carry distinct fields
/// (`content_type`, `http_status`, `author_id`, `published_at`) and
/// conflating them with author data was a bug in the distilled spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub id: i64,
    pub url_id: i64,
    pub content_type: String,
    pub http_status: i32,
    pub author_id: Option<i64>,
    pub published_at: DateTime<Utc>,
}

/// A keyword/frequency pair extracted from page content, 1:N with [`Url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub id: i64,
    pub url_id: i64,
    pub keyword: String,
    pub frequency: i32,
}

/// Routing data a scheduled/predefined item carries to the broker —
/// mirrors `TaskDataDto` (`queue`, `exchange`, `routing_key`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A leasable unit of work, distinguished by [`WorkKind`]. `ScheduledItem`
/// carries an explicit `scheduled_time`; `PredefinedItem` (same shape,
/// without it) is always eligible while `PENDING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub id: i64,
    pub task_data: TaskData,
    pub status: ItemStatus,
    pub url: String,
    pub scheduled_time: DateTime<Utc>,
    pub retry_count: i32,
    pub exception_info: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedItem {
    pub id: i64,
    pub task_data: TaskData,
    pub status: ItemStatus,
    pub url: String,
    pub retry_count: i32,
    pub exception_info: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields required to enqueue a new [`ScheduledItem`].
#[derive(Debug, Clone)]
pub struct NewScheduledItem {
    pub task_data: TaskData,
    pub url: String,
    pub scheduled_time: DateTime<Utc>,
}

/// Fields required to enqueue a new [`PredefinedItem`].
#[derive(Debug, Clone)]
pub struct NewPredefinedItem {
    pub task_data: TaskData,
    pub url: String,
}

/// The page data a parser extracts for one `url_id`, written together so
/// a re-parse overwrites the full set rather than leaving stale siblings
/// behind (see [`Meta`]'s note on the source's `Author`/`Meta` mixup).
#[derive(Debug, Clone)]
pub struct NewPageData {
    pub content: NewContent,
    pub author: NewAuthor,
    pub meta: NewMeta,
    pub index: Vec<NewIndex>,
}

#[derive(Debug, Clone)]
pub struct NewContent {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct NewAuthor {
    pub name: String,
    pub web_site: String,
}

#[derive(Debug, Clone)]
pub struct NewMeta {
    pub content_type: String,
    pub http_status: i32,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIndex {
    pub keyword: String,
    pub frequency: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_url_carries_parent_and_normalized_string() {
        let validated = UrlString::validate("https://example.com/a").unwrap();
        let new_url = Url::new(validated, Some(7));
        assert_eq!(new_url.url, "https://example.com/a");
        assert_eq!(new_url.parent_id, Some(7));
    }
}
