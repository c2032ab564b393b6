mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use common::{quick_policy, Scripted, Upstream};
use fastenrich::{RetryPolicy, RetryingFetcher};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

async fn fetch_from(script: &Scripted, policy: RetryPolicy) -> Option<serde_json::Value> {
    let upstream = Upstream::start(script.router()).await;
    let fetcher = RetryingFetcher::new(policy).expect("client");
    let url = Url::parse(&upstream.url("/profile/0x1")).expect("url");
    fetcher.get_json(&url).await
}

/// Bare TCP listener that counts connections and closes each one after `hold` without answering.
struct SilentUpstream {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SilentUpstream {
    async fn start(hold: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(hold).await;
                    drop(socket);
                });
            }
        });
        Self {
            addr,
            accepts,
            task,
        }
    }

    fn url(&self) -> Url {
        Url::parse(&format!("http://{}/profile/0x1", self.addr)).expect("url")
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

impl Drop for SilentUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[tokio::test]
async fn dropped_connections_are_retried_then_given_up() {
    let upstream = SilentUpstream::start(Duration::ZERO).await;
    let policy = RetryPolicy {
        network_delay: Duration::from_millis(50),
        ..quick_policy()
    };
    let fetcher = RetryingFetcher::new(policy.clone()).expect("client");
    let started = Instant::now();

    assert_eq!(fetcher.get_json(&upstream.url()).await, None);

    assert_eq!(upstream.accepts(), policy.max_retries as usize + 1);
    assert!(started.elapsed() >= policy.network_delay * policy.max_retries);
}

#[tokio::test]
async fn stalled_responses_time_out_and_are_retried() {
    let upstream = SilentUpstream::start(Duration::from_secs(5)).await;
    let policy = RetryPolicy {
        network_delay: Duration::from_millis(50),
        request_timeout: Duration::from_millis(100),
        ..quick_policy()
    };
    let fetcher = RetryingFetcher::new(policy.clone()).expect("client");
    let started = Instant::now();

    assert_eq!(fetcher.get_json(&upstream.url()).await, None);

    let attempts = policy.max_retries + 1;
    assert_eq!(upstream.accepts(), attempts as usize);
    let elapsed = started.elapsed();
    assert!(elapsed >= policy.network_delay * policy.max_retries + policy.request_timeout * attempts);
    assert!(elapsed < Duration::from_secs(5), "gave up after {elapsed:?}");
}

#[tokio::test]
async fn throttled_twice_then_succeeds_with_linear_backoff() {
    let script = Scripted::new(vec![
        (StatusCode::TOO_MANY_REQUESTS, "{}"),
        (StatusCode::TOO_MANY_REQUESTS, "{}"),
        (StatusCode::OK, r#"{"count": 5}"#),
    ]);
    let policy = quick_policy();
    let started = Instant::now();

    let value = fetch_from(&script, policy.clone()).await;

    assert_eq!(value, Some(json!({"count": 5})));
    assert_eq!(script.hits(), 3);
    let expected = policy.throttle_backoff(0) + policy.throttle_backoff(1);
    assert_eq!(expected, Duration::from_millis(150));
    assert!(started.elapsed() >= expected);
}

#[tokio::test]
async fn permanent_throttling_gives_up_after_max_retries() {
    let script = Scripted::new(vec![(StatusCode::TOO_MANY_REQUESTS, "{}")]);
    let policy = RetryPolicy {
        rate_limit_delay: Duration::from_millis(5),
        ..quick_policy()
    };
    assert_eq!(fetch_from(&script, policy).await, None);
    assert_eq!(script.hits(), 4);
}

#[tokio::test]
async fn not_found_is_terminal() {
    let script = Scripted::new(vec![(StatusCode::NOT_FOUND, r#"{"error": "no profile"}"#)]);
    assert_eq!(fetch_from(&script, quick_policy()).await, None);
    assert_eq!(script.hits(), 1);
}

#[tokio::test]
async fn server_error_is_not_retried() {
    let script = Scripted::new(vec![
        (StatusCode::INTERNAL_SERVER_ERROR, "{}"),
        (StatusCode::OK, r#"{"count": 1}"#),
    ]);
    assert_eq!(fetch_from(&script, quick_policy()).await, None);
    assert_eq!(script.hits(), 1);
}

#[tokio::test]
async fn malformed_body_resolves_to_none() {
    let script = Scripted::new(vec![(StatusCode::OK, "<html>oops</html>")]);
    assert_eq!(fetch_from(&script, quick_policy()).await, None);
    assert_eq!(script.hits(), 1);
}
