#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use fastenrich::{RetryPolicy, WorkItem};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Local HTTP server standing in for an upstream API. Aborted on drop.
pub struct Upstream {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Upstream {
    pub async fn start(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        Self { addr, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Replies from a fixed script, then repeats the last reply forever.
#[derive(Clone)]
pub struct Scripted {
    replies: Arc<Mutex<VecDeque<(StatusCode, String)>>>,
    last: Arc<Mutex<(StatusCode, String)>>,
    hits: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn new(replies: Vec<(StatusCode, &str)>) -> Self {
        let replies: VecDeque<(StatusCode, String)> = replies
            .into_iter()
            .map(|(status, body)| (status, body.to_string()))
            .collect();
        let last = replies
            .back()
            .cloned()
            .unwrap_or((StatusCode::OK, "{}".to_string()));
        Self {
            replies: Arc::new(Mutex::new(replies)),
            last: Arc::new(Mutex::new(last)),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        Router::new().fallback(reply).with_state(self.clone())
    }
}

async fn reply(State(script): State<Scripted>) -> impl IntoResponse {
    script.hits.fetch_add(1, Ordering::SeqCst);
    let next = script.replies.lock().expect("script lock").pop_front();
    let (status, body) = match next {
        Some(reply) => reply,
        None => script.last.lock().expect("last lock").clone(),
    };
    (status, [(header::CONTENT_TYPE, "application/json")], body)
}

/// Fast retry policy for tests.
pub fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        rate_limit_delay: Duration::from_millis(50),
        network_delay: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
    }
}

pub fn wallets(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(format!("w-{i}"), format!("0x{i:040x}")))
        .collect()
}
