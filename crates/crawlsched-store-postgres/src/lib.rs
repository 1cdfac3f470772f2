//! PostgreSQL implementation of the crawl scheduler's work store.
//!
//! # Features
//!
//! - Skip-locked batch leasing (`FOR UPDATE SKIP LOCKED`) for both the
//!   scheduled and predefined queues.
//! - Terminal-status protection: every UPDATE that moves an item's status
//!   carries a `WHERE status NOT IN (...)` guard, so a stray transition
//!   against a finished item is a silent no-op rather than a state-machine
//!   violation.
//! - A `reclaim_expired` sweep for `PROCESSING` rows whose lease has
//!   outlived its TTL, standing in for the absent reaper noted against the
//!   source implementation.
//! - Every query runs inside [`atomic`]'s session: `lock_timeout`/
//!   `statement_timeout` are set on the transaction before the caller's
//!   work runs, mirroring the original's `main.py` lifespan hook.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE scheduled_item (
//!     id BIGSERIAL PRIMARY KEY,
//!     url TEXT NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     scheduled_time TIMESTAMPTZ NOT NULL,
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     task_data JSONB NOT NULL,
//!     exception_info TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_scheduled_item_due
//!     ON scheduled_item (scheduled_time, id)
//!     WHERE status = 'pending';
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use crawlsched_store_postgres::PgWorkStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/crawlsched").await?;
//! let store = PgWorkStore::new(pool);
//! let leased = store.lease_due_batch(WorkKind::Scheduled, 10).await?;
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use crawlsched_core::store::{ClaimedItem, UrlRepository, WorkKind, WorkStore};
use crawlsched_core::{CoreError, ItemStatus, NewPredefinedItem, NewScheduledItem, NewUrl, TaskData, Url};
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Row};

fn internal(e: sqlx::Error) -> CoreError {
    CoreError::Internal(e.to_string())
}

fn task_data_from_json(value: serde_json::Value) -> Result<TaskData, CoreError> {
    serde_json::from_value(value).map_err(|e| CoreError::Internal(format!("malformed task_data: {e}")))
}

/// Runs `f` against a freshly-begun transaction with the session's lock and
/// statement timeouts bounded, committing on `Ok` and rolling back on `Err`.
///
/// `read_only` callers skip the explicit commit: sqlx drops an unfinished
/// `Transaction` as an implicit `ROLLBACK`, which is exactly what a query
/// that wrote nothing needs.
async fn atomic<T>(
    pool: &PgPool,
    read_only: bool,
    f: impl for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, CoreError>>,
) -> Result<T, CoreError> {
    let mut tx = pool.begin().await.map_err(internal)?;
    sqlx::query("SET lock_timeout = '4s'").execute(&mut *tx).await.map_err(internal)?;
    sqlx::query("SET statement_timeout = '8s'").execute(&mut *tx).await.map_err(internal)?;

    let result = f(&mut tx).await;
    if result.is_ok() && !read_only {
        tx.commit().await.map_err(internal)?;
    }
    result
}

/// PostgreSQL-backed [`WorkStore`].
#[derive(Clone)]
pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(kind: WorkKind) -> &'static str {
        match kind {
            WorkKind::Scheduled => "scheduled_item",
            WorkKind::Predefined => "predefined_item",
        }
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn lease_due_batch(&self, kind: WorkKind, limit: i64) -> Result<Vec<ClaimedItem>, CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                let pending = ItemStatus::Pending.to_string();
                let processing = ItemStatus::Processing.to_string();

                let rows = match kind {
                    WorkKind::Scheduled => sqlx::query(
                        r#"
                        WITH claimable AS (
                            SELECT id
                            FROM scheduled_item
                            WHERE status = $1
                              AND scheduled_time <= NOW()
                            ORDER BY scheduled_time ASC, id ASC
                            LIMIT $2
                            FOR UPDATE SKIP LOCKED
                        )
                        UPDATE scheduled_item
                        SET status = $3, updated_at = NOW()
                        WHERE id IN (SELECT id FROM claimable)
                        RETURNING id, url, retry_count, task_data, scheduled_time
                        "#,
                    )
                    .bind(&pending)
                    .bind(limit)
                    .bind(&processing)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(internal)?,
                    WorkKind::Predefined => sqlx::query(
                        r#"
                        WITH claimable AS (
                            SELECT id
                            FROM predefined_item
                            WHERE status = $1
                            ORDER BY id ASC
                            LIMIT $2
                            FOR UPDATE SKIP LOCKED
                        )
                        UPDATE predefined_item
                        SET status = $3, updated_at = NOW()
                        WHERE id IN (SELECT id FROM claimable)
                        RETURNING id, url, retry_count, task_data, NULL::timestamptz AS scheduled_time
                        "#,
                    )
                    .bind(&pending)
                    .bind(limit)
                    .bind(&processing)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(internal)?,
                };

                let mut items = Vec::with_capacity(rows.len());
                for row in rows {
                    let task_data: serde_json::Value = row.try_get("task_data").map_err(internal)?;
                    items.push(ClaimedItem {
                        id: row.try_get("id").map_err(internal)?,
                        url: row.try_get("url").map_err(internal)?,
                        retry_count: row.try_get("retry_count").map_err(internal)?,
                        task_data: task_data_from_json(task_data)?,
                        scheduled_time: row.try_get("scheduled_time").map_err(internal)?,
                    });
                }
                // The UPDATE...RETURNING above yields exactly one row per
                // claimed id; no windowed dedup pass is needed on top of it.
                Ok(items)
            })
        })
        .await
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
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                let table = Self::table(kind);
                let completed = ItemStatus::Completed.to_string();
                let failed = ItemStatus::Failed.to_string();
                let new_status_str = new_status.to_string();

                if let (WorkKind::Scheduled, Some(ts)) = (kind, next_scheduled_time) {
                    let query = format!(
                        "UPDATE {table} SET status = $1, retry_count = $2, exception_info = $3, \
                         scheduled_time = $4, updated_at = NOW() \
                         WHERE id = $5 AND status NOT IN ($6, $7)"
                    );
                    sqlx::query(&query)
                        .bind(&new_status_str)
                        .bind(retry_count)
                        .bind(exception)
                        .bind(ts)
                        .bind(id)
                        .bind(&completed)
                        .bind(&failed)
                        .execute(&mut *conn)
                        .await
                        .map_err(internal)?;
                } else {
                    let query = format!(
                        "UPDATE {table} SET status = $1, retry_count = $2, exception_info = $3, \
                         updated_at = NOW() WHERE id = $4 AND status NOT IN ($5, $6)"
                    );
                    sqlx::query(&query)
                        .bind(&new_status_str)
                        .bind(retry_count)
                        .bind(exception)
                        .bind(id)
                        .bind(&completed)
                        .bind(&failed)
                        .execute(&mut *conn)
                        .await
                        .map_err(internal)?;
                }

                Ok(())
            })
        })
        .await
    }

    async fn add_item(&self, item: NewScheduledItem) -> Result<i64, CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                let task_data =
                    serde_json::to_value(&item.task_data).map_err(|e| CoreError::Internal(e.to_string()))?;
                let pending = ItemStatus::Pending.to_string();

                let row = sqlx::query(
                    r#"
                    INSERT INTO scheduled_item (url, status, scheduled_time, retry_count, task_data)
                    VALUES ($1, $2, $3, 0, $4)
                    RETURNING id
                    "#,
                )
                .bind(&item.url)
                .bind(&pending)
                .bind(item.scheduled_time)
                .bind(task_data)
                .fetch_one(&mut *conn)
                .await
                .map_err(internal)?;

                row.try_get("id").map_err(internal)
            })
        })
        .await
    }

    async fn add_predefined(&self, item: NewPredefinedItem) -> Result<i64, CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                let task_data =
                    serde_json::to_value(&item.task_data).map_err(|e| CoreError::Internal(e.to_string()))?;
                let pending = ItemStatus::Pending.to_string();

                let row = sqlx::query(
                    r#"
                    INSERT INTO predefined_item (url, status, retry_count, task_data)
                    VALUES ($1, $2, 0, $3)
                    RETURNING id
                    "#,
                )
                .bind(&item.url)
                .bind(&pending)
                .bind(task_data)
                .fetch_one(&mut *conn)
                .await
                .map_err(internal)?;

                row.try_get("id").map_err(internal)
            })
        })
        .await
    }

    async fn exists_by_url_ci(&self, url: &str) -> Result<bool, CoreError> {
        let url = url.to_string();
        atomic(&self.pool, true, move |conn| {
            Box::pin(async move {
                let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM scheduled_item WHERE url ILIKE $1) AS exists")
                    .bind(&url)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(internal)?;
                row.try_get("exists").map_err(internal)
            })
        })
        .await
    }

    async fn reclaim_expired(&self, kind: WorkKind, lease_ttl: Duration) -> Result<Vec<i64>, CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                let table = Self::table(kind);
                let processing = ItemStatus::Processing.to_string();
                let pending = ItemStatus::Pending.to_string();
                let query = format!(
                    "UPDATE {table} SET status = $1, retry_count = retry_count + 1, updated_at = NOW() \
                     WHERE status = $2 AND updated_at < NOW() - $3::interval RETURNING id"
                );

                let interval = format!("{} seconds", lease_ttl.num_seconds());
                let rows = sqlx::query(&query)
                    .bind(&pending)
                    .bind(&processing)
                    .bind(interval)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(internal)?;

                let mut ids = Vec::with_capacity(rows.len());
                for row in rows {
                    ids.push(row.try_get("id").map_err(internal)?);
                }
                if !ids.is_empty() {
                    tracing::warn!(kind = ?kind, count = ids.len(), "reclaimed stale PROCESSING items");
                }
                Ok(ids)
            })
        })
        .await
    }
}

/// PostgreSQL-backed [`UrlRepository`].
#[derive(Clone)]
pub struct PgUrlRepository {
    pool: PgPool,
}

impl PgUrlRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_url(row: sqlx::postgres::PgRow) -> Result<Url, CoreError> {
    let status_str: String = row.try_get("crawling_status").map_err(internal)?;
    let crawling_status =
        crawlsched_core::CrawlingStatus::from_str(&status_str).map_err(CoreError::Internal)?;
    Ok(Url {
        id: row.try_get("id").map_err(internal)?,
        url: row.try_get("url").map_err(internal)?,
        crawling_status,
        crawled_at: row.try_get("crawled_at").map_err(internal)?,
        parent_id: row.try_get("parent_id").map_err(internal)?,
        created_at: row.try_get("created_at").map_err(internal)?,
    })
}

#[async_trait]
impl UrlRepository for PgUrlRepository {
    async fn insert(&self, new_url: NewUrl) -> Result<Url, CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                let idle = crawlsched_core::CrawlingStatus::Idle.to_string();
                let row = sqlx::query(
                    r#"
                    INSERT INTO url (url, crawling_status, parent_id)
                    VALUES ($1, $2, $3)
                    RETURNING id, url, crawling_status, crawled_at, parent_id, created_at
                    "#,
                )
                .bind(&new_url.url)
                .bind(&idle)
                .bind(new_url.parent_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(internal)?;
                row_to_url(row)
            })
        })
        .await
    }

    async fn exists_by_url_ci(&self, url: &str) -> Result<bool, CoreError> {
        let url = url.to_string();
        atomic(&self.pool, true, move |conn| {
            Box::pin(async move {
                let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM url WHERE url ILIKE $1) AS exists")
                    .bind(&url)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(internal)?;
                row.try_get("exists").map_err(internal)
            })
        })
        .await
    }

    async fn find_by_url_ci(&self, url: &str) -> Result<Option<Url>, CoreError> {
        let url = url.to_string();
        atomic(&self.pool, true, move |conn| {
            Box::pin(async move {
                let row = sqlx::query(
                    "SELECT id, url, crawling_status, crawled_at, parent_id, created_at FROM url WHERE url ILIKE $1",
                )
                .bind(&url)
                .fetch_optional(&mut *conn)
                .await
                .map_err(internal)?;
                row.map(row_to_url).transpose()
            })
        })
        .await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Url>, CoreError> {
        atomic(&self.pool, true, move |conn| {
            Box::pin(async move {
                let row = sqlx::query(
                    "SELECT id, url, crawling_status, crawled_at, parent_id, created_at FROM url WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(internal)?;
                row.map(row_to_url).transpose()
            })
        })
        .await
    }

    async fn sub_urls_of(&self, parent_id: i64) -> Result<Vec<Url>, CoreError> {
        atomic(&self.pool, true, move |conn| {
            Box::pin(async move {
                let rows = sqlx::query(
                    "SELECT id, url, crawling_status, crawled_at, parent_id, created_at FROM url WHERE parent_id = $1",
                )
                .bind(parent_id)
                .fetch_all(&mut *conn)
                .await
                .map_err(internal)?;
                rows.into_iter().map(row_to_url).collect()
            })
        })
        .await
    }

    async fn mark_crawled(&self, id: i64, crawled_at: DateTime<Utc>) -> Result<(), CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                sqlx::query("UPDATE url SET crawled_at = $1 WHERE id = $2")
                    .bind(crawled_at)
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .map_err(internal)?;
                Ok(())
            })
        })
        .await
    }

    async fn save_page_data(&self, url_id: i64, data: crawlsched_core::NewPageData) -> Result<(), CoreError> {
        atomic(&self.pool, false, move |conn| {
            Box::pin(async move {
                sqlx::query("DELETE FROM content WHERE url_id = $1").bind(url_id).execute(&mut *conn).await.map_err(internal)?;
                sqlx::query("DELETE FROM author WHERE url_id = $1").bind(url_id).execute(&mut *conn).await.map_err(internal)?;
                sqlx::query("DELETE FROM meta WHERE url_id = $1").bind(url_id).execute(&mut *conn).await.map_err(internal)?;
                sqlx::query("DELETE FROM \"index\" WHERE url_id = $1").bind(url_id).execute(&mut *conn).await.map_err(internal)?;

                sqlx::query("INSERT INTO content (url_id, title, content) VALUES ($1, $2, $3)")
                    .bind(url_id)
                    .bind(&data.content.title)
                    .bind(&data.content.content)
                    .execute(&mut *conn)
                    .await
                    .map_err(internal)?;

                let author_row = sqlx::query("INSERT INTO author (url_id, name, web_site) VALUES ($1, $2, $3) RETURNING id")
                    .bind(url_id)
                    .bind(&data.author.name)
                    .bind(&data.author.web_site)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(internal)?;
                let author_id: i64 = author_row.try_get("id").map_err(internal)?;

                sqlx::query(
                    "INSERT INTO meta (url_id, content_type, http_status, author_id, published_at) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(url_id)
                .bind(&data.meta.content_type)
                .bind(data.meta.http_status)
                .bind(author_id)
                .bind(data.meta.published_at)
                .execute(&mut *conn)
                .await
                .map_err(internal)?;

                for index in &data.index {
                    sqlx::query("INSERT INTO \"index\" (url_id, keyword, frequency) VALUES ($1, $2, $3)")
                        .bind(url_id)
                        .bind(&index.keyword)
                        .bind(index.frequency)
                        .execute(&mut *conn)
                        .await
                        .map_err(internal)?;
                }

                Ok(())
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_is_kind_specific() {
        assert_eq!(PgWorkStore::table(WorkKind::Scheduled), "scheduled_item");
        assert_eq!(PgWorkStore::table(WorkKind::Predefined), "predefined_item");
    }
}
