//! Default [`DiscoveryWorker`] adapter — §4.5/§7 "Outbound HTTP (discovery worker)".
//!
//! Confirms `{url}/{year}/{month}/{day}` is live behind a circuit breaker
//! plus retry, then re-enters `candidate_hrefs` through [`schedule_one`]
//! exactly as the `/api/v1/crawler/schedule-urls` handler does. Anchor
//! extraction that produces `candidate_hrefs` happens upstream of this
//! adapter and is not this crate's concern.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use crawlsched_core::events::ByDateFetchUrlDto;
use crawlsched_core::fetch_pipeline::DiscoveryWorker;
use crawlsched_core::policy::{CircuitBreaker, DISCOVERY_BREAKER, DISCOVERY_HTTP_RETRY, DISCOVERY_HTTP_TIMEOUT};
use crawlsched_core::CoreError;

use crate::{schedule_one, AppState};

pub struct HttpDiscoveryWorker {
    client: reqwest::Client,
    state: AppState,
    breaker: Mutex<CircuitBreaker>,
}

impl HttpDiscoveryWorker {
    pub fn new(state: AppState) -> Self {
        Self {
            client: reqwest::Client::new(),
            state,
            breaker: Mutex::new(CircuitBreaker::new(DISCOVERY_BREAKER)),
        }
    }

    async fn fetch_dated_page(&self, url: &str) -> Result<(), CoreError> {
        if self.breaker.lock().expect("breaker lock poisoned").is_open() {
            return Err(CoreError::ServiceUnavailable("discovery breaker open".into()));
        }

        let mut last_err = None;
        for attempt in 1..=DISCOVERY_HTTP_RETRY.tries {
            match self.try_get(url).await {
                Ok(()) => {
                    self.breaker.lock().expect("breaker lock poisoned").record_success();
                    return Ok(());
                }
                Err(e) => {
                    self.breaker.lock().expect("breaker lock poisoned").record_failure();
                    tracing::warn!(url, attempt, error = %e, "discovery fetch failed");
                    last_err = Some(e);
                    if attempt < DISCOVERY_HTTP_RETRY.tries {
                        tokio::time::sleep(DISCOVERY_HTTP_RETRY.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    async fn try_get(&self, url: &str) -> Result<(), CoreError> {
        let response = self
            .client
            .get(url)
            .timeout(DISCOVERY_HTTP_TIMEOUT)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::BadRequest(format!("discovery fetch returned {}", response.status())))
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> CoreError {
    if e.is_timeout() {
        CoreError::Timeout
    } else if e.is_connect() {
        CoreError::ServiceUnavailable(format!("discovery connect failed: {e}"))
    } else {
        CoreError::BadRequest(format!("discovery request failed: {e}"))
    }
}

fn dated_url(input: &ByDateFetchUrlDto) -> String {
    format!("{}/{}/{}/{}", input.url.as_str().trim_end_matches('/'), input.year, input.month, input.day)
}

#[async_trait]
impl DiscoveryWorker for HttpDiscoveryWorker {
    async fn discover(&self, input: ByDateFetchUrlDto, candidate_hrefs: Vec<String>) -> Result<Vec<String>, CoreError> {
        self.fetch_dated_page(&dated_url(&input)).await?;

        let mut scheduled = Vec::with_capacity(candidate_hrefs.len());
        for href in candidate_hrefs {
            scheduled.push(schedule_one(&self.state, href).await?);
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlsched_testing::{InMemoryUrlRepository, InMemoryWorkStore};
    use std::sync::Arc;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(InMemoryWorkStore::new()),
            urls: Arc::new(InMemoryUrlRepository::new()),
        }
    }

    #[test]
    fn dated_url_appends_year_month_day() {
        let input = ByDateFetchUrlDto {
            url: crawlsched_core::UrlString::validate("https://hetq.am/hy/articles/").unwrap(),
            year: "2025".into(),
            month: "03".into(),
            day: "12".into(),
        };
        assert_eq!(dated_url(&input), "https://hetq.am/hy/articles/2025/03/12");
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let worker = HttpDiscoveryWorker::new(test_state());
        for _ in 0..DISCOVERY_BREAKER.failure_threshold {
            worker.breaker.lock().unwrap().record_failure();
        }
        let input = ByDateFetchUrlDto {
            url: crawlsched_core::UrlString::validate("https://hetq.am/hy/articles/").unwrap(),
            year: "2025".into(),
            month: "03".into(),
            day: "12".into(),
        };
        let err = worker.discover(input, vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::ServiceUnavailable(_)));
    }
}
