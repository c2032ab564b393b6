mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{quick_policy, Upstream};
use fastenrich::{
    Enrich, EnrichmentWorker, FieldSource, LookupEndpoint, RetryingFetcher, WorkItem,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn upstream_router() -> Router {
    Router::new()
        .route(
            "/profiles/:address",
            get(|Path(address): Path<String>| async move {
                if address == "0xdead" {
                    (StatusCode::NOT_FOUND, Json(json!({"error": "unknown"})))
                } else {
                    (
                        StatusCode::OK,
                        Json(json!({"data": {"avatar": format!("https://img.test/{address}.png")}})),
                    )
                }
            }),
        )
        .route(
            "/rpc",
            post(|Json(body): Json<Value>| async move {
                let address = body["params"][0].as_str().unwrap_or_default().to_string();
                let count = if address == "0xdead" { "0x0" } else { "0x1a" };
                Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": count}))
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"count": 1}))
            }),
        )
}

fn worker(upstream: &Upstream, activity_path: &str, lookup_timeout: Duration) -> EnrichmentWorker {
    let fetcher = Arc::new(RetryingFetcher::new(quick_policy()).expect("client"));
    let profile = LookupEndpoint::get(upstream.url("/profiles/{address}"), "/data/avatar");
    let activity = if activity_path == "/rpc" {
        LookupEndpoint::post(
            upstream.url("/rpc"),
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_getTransactionCount", "params": ["{address}", "latest"]}),
            "/result",
        )
    } else {
        LookupEndpoint::get(upstream.url(activity_path), "/count")
    };
    EnrichmentWorker::new(fetcher, Some(profile), Some(activity), lookup_timeout)
}

#[tokio::test]
async fn merges_both_lookups() {
    let upstream = Upstream::start(upstream_router()).await;
    let worker = worker(&upstream, "/rpc", Duration::from_secs(5));

    let record = worker.enrich(&WorkItem::new("w-1", "0xabc")).await;

    assert_eq!(record.avatar.source, FieldSource::Fetched);
    assert_eq!(record.avatar.value.as_deref(), Some("https://img.test/0xabc.png"));
    assert_eq!(record.activity.source, FieldSource::Fetched);
    assert_eq!(record.activity.value, Some(26));
}

#[tokio::test]
async fn explicit_zero_is_fetched_and_failed_profile_keeps_prior() {
    let upstream = Upstream::start(upstream_router()).await;
    let worker = worker(&upstream, "/rpc", Duration::from_secs(5));
    let item = WorkItem {
        avatar_url: Some("https://img.test/cached.png".to_string()),
        ..WorkItem::new("w-2", "0xdead")
    };

    let record = worker.enrich(&item).await;

    assert_eq!(record.avatar.source, FieldSource::Fallback);
    assert_eq!(record.avatar.value.as_deref(), Some("https://img.test/cached.png"));
    assert_eq!(record.activity.source, FieldSource::Fetched);
    assert_eq!(record.activity.value, Some(0));
    assert_eq!(record.item, item);
}

#[tokio::test]
async fn slow_lookup_times_out_to_fallback() {
    let upstream = Upstream::start(upstream_router()).await;
    let worker = worker(&upstream, "/slow", Duration::from_millis(200));
    let item = WorkItem {
        activity_count: Some(9),
        ..WorkItem::new("w-3", "0xabc")
    };

    let record = worker.enrich(&item).await;

    assert_eq!(record.avatar.source, FieldSource::Fetched);
    assert_eq!(record.activity.source, FieldSource::Fallback);
    assert_eq!(record.activity.value, Some(9));
}

#[tokio::test]
async fn missing_endpoint_marks_field_missing() {
    let fetcher = Arc::new(RetryingFetcher::new(quick_policy()).expect("client"));
    let worker = EnrichmentWorker::new(fetcher, None, None, Duration::from_secs(1));

    let record = worker.enrich(&WorkItem::new("w-4", "0x4")).await;

    assert_eq!(record.avatar.source, FieldSource::Missing);
    assert_eq!(record.activity.source, FieldSource::Missing);
    assert_eq!(record.activity.value, None);
}
