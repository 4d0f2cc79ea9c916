//! HTTP client for the remote collector
//!
//! Implements the collector protocol: single-event ingestion posts and the
//! daily count query. Requests optionally carry a bearer credential; its
//! absence means unauthenticated requests are sent as-is.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::types::{Fragment, StoredComment};

use super::Collector;

/// HTTP client for the collector API
pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CollectorClient {
    /// Create a new collector client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required
    /// fields.
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .endpoint_url
            .clone()
            .ok_or_else(|| Error::Config("delivery.endpoint_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &config.bearer_token {
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid bearer_token: {}", e)))?,
            );
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }
}

impl Collector for CollectorClient {
    /// POST one event. Success is any 2xx; everything else (including
    /// transport errors) is a delivery failure the engine retries.
    async fn post_event(&self, record: &StoredComment) -> Result<()> {
        let url = format!("{}/events", self.base_url);
        let payload = EventPayload::from_record(record);

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Delivery(format!(
                "collector rejected ({}): {}",
                status, error_text
            )))
        }
    }

    /// Query the actor's admitted-comment count for one day.
    ///
    /// An absent or malformed count is a soft failure (`Ok(None)`): callers
    /// fall back to the last locally known value rather than erroring.
    async fn fetch_count(
        &self,
        actor_key: &str,
        date: &str,
        timezone: &str,
    ) -> Result<Option<i64>> {
        let url = format!(
            "{}/counts?actor={}&date={}&timezone={}",
            self.base_url,
            urlencoding::encode(actor_key),
            urlencoding::encode(date),
            urlencoding::encode(timezone),
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, "Count query returned error status");
            return Ok(None);
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Count response was not valid JSON");
                return Ok(None);
            }
        };

        Ok(parse_count(&body))
    }
}

/// Request body for POST /events: the event minus store bookkeeping, plus
/// the stable key the collector dedups on.
#[derive(Serialize)]
struct EventPayload<'a> {
    event_key: String,
    text: &'a str,
    actor_name: &'a str,
    actor_key: &'a str,
    occurred_at: DateTime<Utc>,
    source_locator: &'a str,
    context_id: &'a str,
    context_author: &'a str,
    context_body: &'a [Fragment],
}

impl<'a> EventPayload<'a> {
    fn from_record(record: &'a StoredComment) -> Self {
        let event = &record.event;
        Self {
            event_key: event.event_key(),
            text: &event.text,
            actor_name: &event.actor_name,
            actor_key: &event.actor_key,
            occurred_at: event.occurred_at,
            source_locator: &event.source_locator,
            context_id: &event.context_id,
            context_author: &event.context_author,
            context_body: &event.context_body,
        }
    }
}

/// Pull a count out of a collector response, tolerating numeric strings.
fn parse_count(body: &serde_json::Value) -> Option<i64> {
    match body.get("count") {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommentEvent;

    #[test]
    fn test_client_requires_endpoint() {
        let config = DeliveryConfig::default();
        assert!(CollectorClient::new(&config).is_err());
    }

    #[test]
    fn test_client_with_valid_config() {
        let config = DeliveryConfig {
            endpoint_url: Some("https://collector.example.com/".to_string()),
            bearer_token: Some("tok_test".to_string()),
            ..Default::default()
        };
        let client = CollectorClient::new(&config).unwrap();
        assert_eq!(client.base_url, "https://collector.example.com");
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(&serde_json::json!({"count": 7})), Some(7));
        assert_eq!(parse_count(&serde_json::json!({"count": "12"})), Some(12));
        assert_eq!(parse_count(&serde_json::json!({"count": "nope"})), None);
        assert_eq!(parse_count(&serde_json::json!({"total": 7})), None);
        assert_eq!(parse_count(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_payload_omits_store_bookkeeping() {
        let record = StoredComment {
            local_id: 99,
            synced: false,
            retry_count: 3,
            event: CommentEvent {
                external_id: Some("urn:comment:1".to_string()),
                text: "hi".to_string(),
                actor_name: "Jane".to_string(),
                actor_key: "/in/jane".to_string(),
                occurred_at: Utc::now(),
                source_locator: "loc".to_string(),
                context_id: "ctx".to_string(),
                context_author: "Bob".to_string(),
                context_body: vec![],
            },
        };

        let json = serde_json::to_value(EventPayload::from_record(&record)).unwrap();
        assert_eq!(json["event_key"], "urn:comment:1");
        assert_eq!(json["text"], "hi");
        assert!(json.get("local_id").is_none());
        assert!(json.get("synced").is_none());
        assert!(json.get("retry_count").is_none());
    }
}
