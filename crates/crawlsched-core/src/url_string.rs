//! `UrlString` — a validated newtype mirroring the original
//! `base_value_objects.py::UrlString` (a Pydantic `Annotated` wrap-validator
//! over a regex). Kept case-insensitive and scheme/host driven, matching
//! spec §6.

use std::fmt;

use regex::Regex;
use std::sync::OnceLock;

use crate::error::CoreError;

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^(?:http|ftp)s?://",
            r"(?:(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:[a-z]{2,6}\.?|[a-z0-9-]{2,}\.?)|",
            r"localhost|",
            r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})",
            r"(?::\d+)?",
            r"(?:/?|[/?]\S+)$",
        ))
        .expect("UrlString regex is a compile-time constant")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct UrlString(String);

impl UrlString {
    pub fn validate(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if !url_regex().is_match(&value) {
            return Err(CoreError::Validation(format!("Invalid url format: {value}")));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for UrlString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for UrlString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        UrlString::validate(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_url_with_path_and_query() {
        let url = UrlString::validate("https://example.com/a?b=1").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?b=1");
    }

    #[test]
    fn accepts_localhost_with_port() {
        assert!(UrlString::validate("http://localhost:8080/x").is_ok());
    }

    #[test]
    fn accepts_bare_ipv4() {
        assert!(UrlString::validate("http://127.0.0.1/path").is_ok());
    }

    #[test]
    fn rejects_non_url_text() {
        let err = UrlString::validate("not a url").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(UrlString::validate("example.com/a").is_err());
    }

    #[test]
    fn accepts_bare_trailing_slash() {
        assert!(UrlString::validate("https://example.com/").is_ok());
    }

    #[test]
    fn rejects_bare_query_marker_with_no_key_value_pairs() {
        assert!(UrlString::validate("https://example.com?").is_err());
    }
}
