//! # crawlsched-core
//!
//! Domain types, error taxonomy, and the storage/broker/fetch-pipeline
//! seams shared by every other crate in the crawl scheduler.
//!
//! This crate is intentionally inert: no SQL, no AMQP connection, no HTTP
//! server. It defines *what* a work item, a broker event, and a lease
//! look like, and the traits ([`store::WorkStore`], [`broker::BrokerPublisher`],
//! fetch pipeline contracts) that downstream crates implement or consume.
//!
//! ## Layout
//!
//! - [`domain`] — `Url`, `Content`, `Author`, `Meta`, `Index`, the two
//!   work-item shapes (`ScheduledItem`, `PredefinedItem`) and `TaskData`.
//! - [`status`] — `CrawlingStatus`/`ItemStatus` with explicit
//!   `Display`/`FromStr`, plus `MAX_RETRIES`.
//! - [`url_string`] — the validated `UrlString` newtype.
//! - [`store`] — `WorkStore`/`UrlRepository` traits, `WorkKind`, `ClaimedItem`.
//! - [`broker`] — `BrokerPublisher`/`TopologyDeclarer` traits.
//! - [`events`] — `RabbitMqEvent` topology and wire DTOs.
//! - [`fetch_pipeline`] — `Fetcher`/`Parser`/`DiscoveryWorker` contracts.
//! - [`policy`] — retry/circuit-breaker/cron policy structs.
//! - [`error`] — the shared `CoreError` taxonomy.

pub mod broker;
pub mod domain;
pub mod error;
pub mod events;
pub mod fetch_pipeline;
pub mod policy;
pub mod status;
pub mod store;
pub mod url_string;

pub use broker::{publish, BrokerPublisher, DeathRecord, PublishOptions, TopologyDeclarer};
pub use domain::{
    Author, Content, Index, Meta, NewAuthor, NewContent, NewIndex, NewMeta, NewPageData,
    NewPredefinedItem, NewScheduledItem, NewUrl, PredefinedItem, ScheduledItem, TaskData, Url,
};
pub use error::CoreError;
pub use events::{ByDateFetchUrlDto, FetchUrlDto, FetchedUrlDto, RabbitMqEvent, MAX_DEAD_LETTER_RETRIES};
pub use fetch_pipeline::{DiscoveryWorker, Fetcher, Parser};
pub use policy::{
    BreakerPolicy, CircuitBreaker, CronPolicy, RetryPolicy, BROKER_PUBLISH_RETRY, DISCOVERY_BREAKER,
    DISCOVERY_HTTP_RETRY, DISCOVERY_HTTP_TIMEOUT, PREDEFINED_CRON, SCHEDULED_CRON,
};
pub use status::{CrawlingStatus, ItemStatus, MAX_RETRIES};
pub use store::{ClaimedItem, UrlRepository, WorkKind, WorkStore, DEFAULT_LEASE_LIMIT};
pub use url_string::UrlString;

pub use async_trait::async_trait;
