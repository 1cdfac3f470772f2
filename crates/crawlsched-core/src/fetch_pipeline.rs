//! Fetch Pipeline Contracts (FP) — §4.5.
//!
//! Interface seam only: the concrete fetcher/parser/discovery workers that
//! implement these traits live outside the core, driven by messages on
//! `news.crawler.fetch_url`, `news.crawler.content_fetched` and
//! `news.crawler.check_sub_url_by_date` respectively. Every consumer must
//! be safe to invoke at-least-once per input message and converge to the
//! same end state on duplicate delivery.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::events::{ByDateFetchUrlDto, FetchUrlDto, FetchedUrlDto};

/// Consumes `FetchUrlDto` from `news.crawler.fetch_url`: persists or finds
/// the URL row (case-insensitive), scrapes content, stamps
/// `url.crawled_at`, and emits a [`FetchedUrlDto`] to `content_fetched`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, input: FetchUrlDto) -> Result<FetchedUrlDto, CoreError>;
}

/// Consumes `FetchedUrlDto` from `news.crawler.content_fetched`: writes
/// Content/Meta/Author/Index children for the URL. Idempotent: re-parsing
/// an already-parsed URL overwrites rather than duplicates its children.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(&self, input: FetchedUrlDto) -> Result<(), CoreError>;
}

/// Consumes `ByDateFetchUrlDto` from `news.crawler.check_sub_url_by_date`:
/// confirms `{url}/{year}/{month}/{day}` is live, then feeds each of
/// `candidate_hrefs` back into intake as a new scheduled item. HTML
/// anchor extraction that produces `candidate_hrefs` is out of scope for
/// this contract — it is the job of whatever FP consumer calls `discover`
/// after parsing the dated page.
#[async_trait]
pub trait DiscoveryWorker: Send + Sync {
    async fn discover(&self, input: ByDateFetchUrlDto, candidate_hrefs: Vec<String>) -> Result<Vec<String>, CoreError>;
}
