//! Broker event topology and wire DTOs.
//!
//! Grounded on `src/app/worker/events.py` (`RabbitMQEvents`) and
//! `src/app/worker/dto.py` (`FetchUrlDto`/`ByDateFetchUrlDto`/
//! `FetchedUrlDto`). Three routed events are named in spec §3/§4.3:
//! `fetch_url`, `content_fetched`, `check_sub_url_by_date`, each sharing
//! the `news.direct` exchange family.

use serde::{Deserialize, Serialize};

use crate::url_string::UrlString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RabbitMqEvent {
    FetchUrl,
    ContentFetched,
    CheckSubUrlByDate,
}

impl RabbitMqEvent {
    pub const ALL: [RabbitMqEvent; 3] = [Self::FetchUrl, Self::ContentFetched, Self::CheckSubUrlByDate];

    pub fn exchange(self) -> &'static str {
        match self {
            Self::FetchUrl | Self::ContentFetched | Self::CheckSubUrlByDate => "news.direct",
        }
    }

    pub fn queue(self) -> &'static str {
        match self {
            Self::FetchUrl => "news.crawler.fetch_url",
            Self::ContentFetched => "news.crawler.content_fetched",
            Self::CheckSubUrlByDate => "news.crawler.check_sub_url_by_date",
        }
    }

    pub fn routing_key(self) -> &'static str {
        match self {
            Self::FetchUrl => "crawler.fetch_url",
            Self::ContentFetched => "crawler.content_fetched",
            Self::CheckSubUrlByDate => "crawler.check_sub_url_by_date",
        }
    }

    pub fn queue_dead_letter(self) -> String {
        format!("{}_dead_letter", self.queue())
    }

    pub fn exchange_dead_letter(self) -> String {
        format!("{}_dead_letter", self.exchange())
    }

    pub fn routing_key_dead_letter(self) -> String {
        format!("{}_dead_letter", self.routing_key())
    }
}

/// Maximum number of dead-letter ring-backs before a message is dropped
/// rather than republished to the main queue. Spec §4.4.
pub const MAX_DEAD_LETTER_RETRIES: u32 = 3;

/// `x-message-ttl` applied to dead-letter queues, in milliseconds. A
/// message sits here for this long before RabbitMQ expires it back to the
/// main exchange via the dead-letter-on-dead-letter wiring.
pub const DEAD_LETTER_TTL_MS: u32 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchUrlDto {
    pub url: UrlString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByDateFetchUrlDto {
    pub url: UrlString,
    pub year: String,
    pub month: String,
    pub day: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedUrlDto {
    pub url_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_names_are_derived_from_the_primary_topology() {
        let event = RabbitMqEvent::FetchUrl;
        assert_eq!(event.queue_dead_letter(), "news.crawler.fetch_url_dead_letter");
        assert_eq!(event.exchange_dead_letter(), "news.direct_dead_letter");
        assert_eq!(event.routing_key_dead_letter(), "crawler.fetch_url_dead_letter");
    }
}
