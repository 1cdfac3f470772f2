//! Intake API (IA) — §4.6/§6.
//!
//! Thin HTTP surface over the work store: `GET /health`, `GET /ready`,
//! `POST /api/v1/crawler/schedule-urls`, and `GET /api/v1/crawler/sub-urls`
//! (the last restored from `src/app/crawler/rest_api.py`, dropped by the
//! distilled spec but still part of the crawler controller's public
//! surface). Routing/state texture follows
//! `fourthplaces-mntogether`'s `server/app.rs`/`routes/health.rs`.

mod discovery;

pub use discovery::HttpDiscoveryWorker;

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use crawlsched_core::store::{UrlRepository, WorkStore};
use crawlsched_core::{CoreError, NewScheduledItem, RabbitMqEvent, TaskData, UrlString};
use serde::{Deserialize, Serialize};

/// Shared intake state, analogous to `AppState` in the routing texture
/// this crate borrows from.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkStore>,
    pub urls: Arc<dyn UrlRepository>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/v1/crawler/schedule-urls", post(schedule_urls))
        .route("/api/v1/crawler/sub-urls", get(sub_urls))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

async fn health() -> Json<StatusBody> {
    Json(StatusBody { status: "ok" })
}

async fn ready() -> Json<StatusBody> {
    Json(StatusBody { status: "ok" })
}

#[derive(Serialize)]
struct EnvelopeDto<T> {
    data: T,
    message: &'static str,
    status: &'static str,
}

impl<T> EnvelopeDto<T> {
    fn ok(data: T) -> Self {
        Self { data, message: "success", status: "ok" }
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    detail: ErrorDetail,
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorEnvelope {
            detail: ErrorDetail { message: self.0.to_string(), code: self.0.code(), errors: None },
        };
        (status, Json(body)).into_response()
    }
}

/// New scheduled items become eligible one minute after submission
/// (§4.6).
const SCHEDULE_DELAY: Duration = Duration::minutes(1);

fn fetch_url_task_data() -> TaskData {
    let event = RabbitMqEvent::FetchUrl;
    TaskData {
        exchange: event.exchange().to_string(),
        queue: event.queue().to_string(),
        routing_key: event.routing_key().to_string(),
    }
}

/// Validates and enqueues a single raw URL string as a new scheduled
/// item, or no-ops if it is already known. Shared by the HTTP handler
/// below and [`HttpDiscoveryWorker`]'s re-entry into intake.
pub async fn schedule_one(state: &AppState, raw: String) -> Result<String, CoreError> {
    let validated = UrlString::validate(raw)?;
    if state.store.exists_by_url_ci(validated.as_str()).await? {
        return Ok(validated.into_string());
    }
    state
        .store
        .add_item(NewScheduledItem {
            task_data: fetch_url_task_data(),
            url: validated.as_str().to_string(),
            scheduled_time: Utc::now() + SCHEDULE_DELAY,
        })
        .await?;
    Ok(validated.into_string())
}

async fn schedule_urls(
    State(state): State<AppState>,
    Json(raw_urls): Json<Vec<String>>,
) -> Result<Json<EnvelopeDto<Vec<String>>>, ApiError> {
    let mut accepted = Vec::with_capacity(raw_urls.len());
    for raw in raw_urls {
        accepted.push(schedule_one(&state, raw).await?);
    }
    Ok(Json(EnvelopeDto::ok(accepted)))
}

#[derive(Deserialize)]
struct SubUrlsQuery {
    url: String,
}

async fn sub_urls(
    State(state): State<AppState>,
    Query(query): Query<SubUrlsQuery>,
) -> Result<Json<EnvelopeDto<Vec<String>>>, ApiError> {
    let validated = UrlString::validate(query.url)?;
    let parent = state
        .urls
        .find_by_url_ci(validated.as_str())
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("url not found: {}", validated.as_str())))?;
    let children = state.urls.sub_urls_of(parent.id).await?;
    Ok(Json(EnvelopeDto::ok(children.into_iter().map(|u| u.url).collect())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use crawlsched_testing::{InMemoryUrlRepository, InMemoryWorkStore};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(InMemoryWorkStore::new()),
            urls: Arc::new(InMemoryUrlRepository::new()),
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn schedule_urls_rejects_invalid_urls_with_422() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/crawler/schedule-urls")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"["not a url"]"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn duplicate_submission_of_the_same_url_is_idempotent() {
        let state = test_state();
        let app = router(state.clone());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/v1/crawler/schedule-urls")
                        .header("content-type", "application/json")
                        .body(Body::from(r#"["https://hetq.am/hy/articles/"]"#))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert!(state.store.exists_by_url_ci("https://hetq.am/hy/articles/").await.unwrap());
    }

    #[tokio::test]
    async fn submitting_the_same_url_twice_yields_one_row() {
        let store = Arc::new(InMemoryWorkStore::new());
        let state = AppState { store: store.clone(), urls: Arc::new(InMemoryUrlRepository::new()) };
        let app = router(state);

        for _ in 0..2 {
            app.clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/v1/crawler/schedule-urls")
                        .header("content-type", "application/json")
                        .body(Body::from(r#"["https://hetq.am/hy/articles/"]"#))
                        .unwrap(),
                )
                .await
                .unwrap();
        }

        assert_eq!(store.count(crawlsched_core::store::WorkKind::Scheduled), 1);
    }
}
