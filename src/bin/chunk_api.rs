use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fastenrich::api::{serve, ApiState};
use fastenrich::controls::init_tracing;
use fastenrich::rate_limit::DEFAULT_SWEEP_INTERVAL;
use fastenrich::{JsonlStore, RateLimiter, ServiceArgs};

#[derive(Parser, Debug)]
#[command(
    name = "fastenrich-chunk-api",
    about = "HTTP endpoint that enriches one chunk of a dataset per call"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "FASTENRICH_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Shared secret callers present as `Authorization: Bearer <secret>`.
    #[arg(long, env = "FASTENRICH_API_SECRET", hide_env_values = true)]
    secret: String,

    /// Items processed per chunk call.
    #[arg(long, env = "FASTENRICH_CHUNK_SIZE", default_value_t = 100)]
    chunk_size: usize,

    /// Max chunk calls per client IP per minute (0 disables rate limiting).
    #[arg(long, env = "FASTENRICH_API_MAX_RPM", default_value_t = 60)]
    max_requests_per_minute: usize,

    #[command(flatten)]
    service: ServiceArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = ApiCli::parse();
    if cli.secret.trim().is_empty() {
        bail!("FASTENRICH_API_SECRET must not be empty");
    }
    let controls = cli
        .service
        .build_controls()
        .context("invalid configuration")?;
    let worker = controls
        .build_worker()
        .context("failed to build HTTP client")?;
    let store = Arc::new(JsonlStore::new(controls.data_dir()));

    let mut state = ApiState::new(
        Arc::new(worker),
        store.clone(),
        store,
        cli.secret.trim(),
        cli.chunk_size.max(1),
        controls.batch().item_delay,
    );
    if cli.max_requests_per_minute > 0 {
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_secs(60),
            cli.max_requests_per_minute,
        ));
        let _sweeper = limiter.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);
        state = state.with_limiter(limiter);
    }

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("fastenrich-chunk-api listening on http://{addr}");
    serve(listener, state).await.context("server error")?;
    Ok(())
}
