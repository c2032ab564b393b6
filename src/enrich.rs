//! Per-record enrichment: concurrent lookups merged onto the input row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::time::timeout;
use url::form_urlencoded::byte_serialize;
use url::Url;

use crate::fetch::RetryingFetcher;
use crate::record::{EnrichedRecord, Field, WorkItem};

/// Capability that turns one input row into an output row. Implementations must not fail:
/// unavailable data degrades to fallback fields.
#[async_trait]
pub trait Enrich: Send + Sync {
    /// Enriches one item.
    async fn enrich(&self, item: &WorkItem) -> EnrichedRecord;
}

/// One upstream lookup: request template plus the JSON pointer that selects the answer.
///
/// Templates may contain `{address}` and `{id}`; both are substituted (percent-encoded in URLs)
/// in the URL and in every string of the optional JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupEndpoint {
    method: Method,
    url_template: String,
    body_template: Option<Value>,
    pointer: String,
}

impl LookupEndpoint {
    /// A lookup with an arbitrary method and optional JSON body template.
    pub fn new(
        method: Method,
        url_template: impl Into<String>,
        body_template: Option<Value>,
        pointer: impl Into<String>,
    ) -> Self {
        Self {
            method,
            url_template: url_template.into(),
            body_template,
            pointer: pointer.into(),
        }
    }

    /// A `GET` lookup.
    pub fn get(url_template: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::new(Method::GET, url_template, None, pointer)
    }

    /// A `POST` lookup with a JSON body template.
    pub fn post(
        url_template: impl Into<String>,
        body_template: Value,
        pointer: impl Into<String>,
    ) -> Self {
        Self::new(Method::POST, url_template, Some(body_template), pointer)
    }

    /// Resolves the request URL for `item`.
    pub fn url_for(&self, item: &WorkItem) -> Result<Url, url::ParseError> {
        let address: String = byte_serialize(item.address.as_bytes()).collect();
        let id: String = byte_serialize(item.id.as_bytes()).collect();
        Url::parse(
            &self
                .url_template
                .replace("{address}", &address)
                .replace("{id}", &id),
        )
    }

    /// Resolves the request body for `item`, if the lookup sends one.
    pub fn body_for(&self, item: &WorkItem) -> Option<Value> {
        self.body_template
            .as_ref()
            .map(|template| substitute(template, item))
    }

    /// Picks the answer out of a response document.
    pub fn select<'a>(&self, response: &'a Value) -> Option<&'a Value> {
        if self.pointer.is_empty() {
            return Some(response);
        }
        response.pointer(&self.pointer).filter(|value| !value.is_null())
    }
}

fn substitute(template: &Value, item: &WorkItem) -> Value {
    match template {
        Value::String(text) => Value::String(
            text.replace("{address}", &item.address)
                .replace("{id}", &item.id),
        ),
        Value::Array(values) => Value::Array(values.iter().map(|v| substitute(v, item)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), substitute(value, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Reads a count from a JSON number, a decimal string, or a `0x` hex string (JSON-RPC style).
pub fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => {
            let text = text.trim();
            match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => text.parse().ok(),
            }
        }
        _ => None,
    }
}

fn parse_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Runs the profile and activity lookups for a record concurrently and merges the answers.
pub struct EnrichmentWorker {
    fetcher: Arc<RetryingFetcher>,
    profile: Option<LookupEndpoint>,
    activity: Option<LookupEndpoint>,
    lookup_timeout: Duration,
}

impl EnrichmentWorker {
    /// Creates a worker. A `None` endpoint leaves that field at its fallback value.
    pub fn new(
        fetcher: Arc<RetryingFetcher>,
        profile: Option<LookupEndpoint>,
        activity: Option<LookupEndpoint>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            profile,
            activity,
            lookup_timeout,
        }
    }

    async fn lookup<T>(
        &self,
        endpoint: Option<&LookupEndpoint>,
        item: &WorkItem,
        parse: fn(&Value) -> Option<T>,
    ) -> Option<T> {
        let endpoint = endpoint?;
        let url = match endpoint.url_for(item) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(id = %item.id, error = %err, "invalid lookup URL");
                return None;
            }
        };
        let body = endpoint.body_for(item);
        let request = self.fetcher.fetch(endpoint.method.clone(), &url, body.as_ref());
        match timeout(self.lookup_timeout, request).await {
            Ok(Some(response)) => {
                let parsed = endpoint.select(&response).and_then(parse);
                if parsed.is_none() {
                    tracing::warn!(id = %item.id, %url, "lookup response had no usable value");
                }
                parsed
            }
            Ok(None) => None,
            Err(_) => {
                tracing::warn!(id = %item.id, %url, timeout = ?self.lookup_timeout, "lookup timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Enrich for EnrichmentWorker {
    async fn enrich(&self, item: &WorkItem) -> EnrichedRecord {
        let (avatar, activity) = tokio::join!(
            self.lookup(self.profile.as_ref(), item, parse_text),
            self.lookup(self.activity.as_ref(), item, parse_count),
        );

        EnrichedRecord {
            avatar: avatar.map_or_else(|| Field::fallback(item.avatar_url.clone()), Field::fetched),
            activity: activity.map_or_else(|| Field::fallback(item.activity_count), Field::fetched),
            item: item.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_template_encodes_placeholders() {
        let endpoint = LookupEndpoint::get("https://api.test/profile/{address}?ref={id}", "/avatar");
        let item = WorkItem::new("row 1", "0xAbC");
        let url = endpoint.url_for(&item).expect("valid url");
        assert_eq!(url.as_str(), "https://api.test/profile/0xAbC?ref=row+1");
    }

    #[test]
    fn body_template_substitutes_nested_strings() {
        let endpoint = LookupEndpoint::post(
            "https://rpc.test",
            json!({"method": "eth_getTransactionCount", "params": ["{address}", "latest"], "id": 1}),
            "/result",
        );
        let body = endpoint.body_for(&WorkItem::new("x", "0x42")).expect("body");
        assert_eq!(body["params"][0], "0x42");
        assert_eq!(body["params"][1], "latest");
        assert_eq!(body["id"], 1);
    }

    #[test]
    fn parses_counts_in_every_encoding() {
        assert_eq!(parse_count(&json!(12)), Some(12));
        assert_eq!(parse_count(&json!("34")), Some(34));
        assert_eq!(parse_count(&json!("0x1a")), Some(26));
        assert_eq!(parse_count(&json!(0)), Some(0));
        assert_eq!(parse_count(&json!(-1)), None);
        assert_eq!(parse_count(&json!("many")), None);
    }

    #[test]
    fn select_skips_nulls_and_blank_text() {
        let endpoint = LookupEndpoint::get("https://api.test/{address}", "/data/avatar");
        let response = json!({"data": {"avatar": null}});
        assert_eq!(endpoint.select(&response), None);
        assert_eq!(parse_text(&json!("   ")), None);
        assert_eq!(parse_text(&json!(" https://img ")), Some("https://img".to_string()));
    }
}
