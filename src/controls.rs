//! Enrichment throttle, retry and lookup controls shared by the binaries.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use reqwest::Method;
use tracing_subscriber::EnvFilter;

use crate::batch::BatchConfig;
use crate::enrich::{EnrichmentWorker, LookupEndpoint};
use crate::error::ConfigError;
use crate::fetch::{RetryPolicy, RetryingFetcher};
use crate::rate_limit::RateLimiter;
use crate::record::WorkItem;

/// Installs the stderr log subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Immutable knobs for one enrichment process.
#[derive(Clone, Debug, PartialEq)]
pub struct EnrichControls {
    data_dir: PathBuf,
    batch: BatchConfig,
    retry: RetryPolicy,
    lookup_timeout: Duration,
    outbound_limit: Option<(Duration, usize)>,
    profile: Option<LookupEndpoint>,
    activity: Option<LookupEndpoint>,
}

impl EnrichControls {
    /// Directory holding dataset inputs, outputs and checkpoints.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Batch sizing and per-item pacing.
    pub fn batch(&self) -> BatchConfig {
        self.batch
    }

    /// Retry policy for every upstream request.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Upper bound on one lookup, retries included.
    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// Outbound pacing as `(window, max requests per host)`, if enabled.
    pub fn outbound_limit(&self) -> Option<(Duration, usize)> {
        self.outbound_limit
    }

    /// Builds a fetcher, paced per upstream host when an outbound limit is configured.
    pub fn build_fetcher(&self) -> Result<RetryingFetcher, reqwest::Error> {
        let fetcher = RetryingFetcher::new(self.retry.clone())?;
        Ok(match self.outbound_limit {
            Some((window, max)) => fetcher.with_limiter(Arc::new(RateLimiter::new(window, max))),
            None => fetcher,
        })
    }

    /// Builds the per-record enrichment worker.
    pub fn build_worker(&self) -> Result<EnrichmentWorker, reqwest::Error> {
        Ok(EnrichmentWorker::new(
            Arc::new(self.build_fetcher()?),
            self.profile.clone(),
            self.activity.clone(),
            self.lookup_timeout,
        ))
    }
}

/// Command-line and environment arguments for enrichment tunables.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Directory holding `<dataset>.jsonl` inputs and enriched outputs
    #[arg(long, env = "FASTENRICH_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Items processed between checkpoints
    #[arg(long, env = "FASTENRICH_BATCH_SIZE", default_value_t = 50)]
    pub batch_size: usize,

    /// Milliseconds to wait between consecutive item enrichments
    #[arg(long, env = "FASTENRICH_ITEM_DELAY_MS", default_value_t = 100)]
    pub item_delay_ms: u64,

    /// Retries for network failures, and separately for 429 responses
    #[arg(long, env = "FASTENRICH_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay in milliseconds for the linear 429 backoff
    #[arg(long, env = "FASTENRICH_RATE_LIMIT_DELAY_MS", default_value_t = 1000)]
    pub rate_limit_delay_ms: u64,

    /// Milliseconds to wait before retrying a network failure
    #[arg(long, env = "FASTENRICH_NETWORK_DELAY_MS", default_value_t = 500)]
    pub network_delay_ms: u64,

    /// Seconds before a single upstream request times out
    #[arg(long, env = "FASTENRICH_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Seconds allowed for one lookup including its retries
    #[arg(long, env = "FASTENRICH_LOOKUP_TIMEOUT_SECS", default_value_t = 30)]
    pub lookup_timeout_secs: u64,

    /// Maximum outbound requests per host and window (0 disables pacing)
    #[arg(long, env = "FASTENRICH_OUTBOUND_MAX_REQUESTS", default_value_t = 0)]
    pub outbound_max_requests: usize,

    /// Outbound pacing window in milliseconds
    #[arg(long, env = "FASTENRICH_OUTBOUND_WINDOW_MS", default_value_t = 1000)]
    pub outbound_window_ms: u64,

    /// Profile lookup URL template; `{address}` and `{id}` are substituted
    #[arg(long, env = "FASTENRICH_PROFILE_URL")]
    pub profile_url: Option<String>,

    /// HTTP method for the profile lookup
    #[arg(long, env = "FASTENRICH_PROFILE_METHOD", default_value = "GET")]
    pub profile_method: String,

    /// JSON body template for the profile lookup
    #[arg(long, env = "FASTENRICH_PROFILE_BODY")]
    pub profile_body: Option<String>,

    /// JSON pointer selecting the avatar URL in the profile response
    #[arg(long, env = "FASTENRICH_PROFILE_POINTER", default_value = "/avatar")]
    pub profile_pointer: String,

    /// Activity lookup URL template; `{address}` and `{id}` are substituted
    #[arg(long, env = "FASTENRICH_ACTIVITY_URL")]
    pub activity_url: Option<String>,

    /// HTTP method for the activity lookup
    #[arg(long, env = "FASTENRICH_ACTIVITY_METHOD", default_value = "GET")]
    pub activity_method: String,

    /// JSON body template for the activity lookup
    #[arg(long, env = "FASTENRICH_ACTIVITY_BODY")]
    pub activity_body: Option<String>,

    /// JSON pointer selecting the count in the activity response
    #[arg(long, env = "FASTENRICH_ACTIVITY_POINTER", default_value = "/count")]
    pub activity_pointer: String,
}

impl ServiceArgs {
    /// Converts the parsed arguments into `EnrichControls`.
    pub fn build_controls(&self) -> Result<EnrichControls, ConfigError> {
        Ok(EnrichControls {
            data_dir: self.data_dir.clone(),
            batch: BatchConfig {
                batch_size: self.batch_size.max(1),
                item_delay: Duration::from_millis(self.item_delay_ms),
            },
            retry: RetryPolicy {
                max_retries: self.max_retries,
                rate_limit_delay: Duration::from_millis(self.rate_limit_delay_ms),
                network_delay: Duration::from_millis(self.network_delay_ms),
                request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            },
            lookup_timeout: Duration::from_secs(self.lookup_timeout_secs.max(1)),
            outbound_limit: (self.outbound_max_requests > 0).then(|| {
                (
                    Duration::from_millis(self.outbound_window_ms.max(1)),
                    self.outbound_max_requests,
                )
            }),
            profile: lookup(
                "profile",
                self.profile_url.as_deref(),
                &self.profile_method,
                self.profile_body.as_deref(),
                &self.profile_pointer,
            )?,
            activity: lookup(
                "activity",
                self.activity_url.as_deref(),
                &self.activity_method,
                self.activity_body.as_deref(),
                &self.activity_pointer,
            )?,
        })
    }

    /// Renders the arguments back into flags, for forwarding to worker processes.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: OsString| {
            args.push(flag.into());
            args.push(value);
        };
        push("--data-dir", self.data_dir.clone().into_os_string());
        push("--batch-size", self.batch_size.to_string().into());
        push("--item-delay-ms", self.item_delay_ms.to_string().into());
        push("--max-retries", self.max_retries.to_string().into());
        push("--rate-limit-delay-ms", self.rate_limit_delay_ms.to_string().into());
        push("--network-delay-ms", self.network_delay_ms.to_string().into());
        push("--request-timeout-secs", self.request_timeout_secs.to_string().into());
        push("--lookup-timeout-secs", self.lookup_timeout_secs.to_string().into());
        push("--outbound-max-requests", self.outbound_max_requests.to_string().into());
        push("--outbound-window-ms", self.outbound_window_ms.to_string().into());
        push("--profile-method", self.profile_method.clone().into());
        push("--profile-pointer", self.profile_pointer.clone().into());
        push("--activity-method", self.activity_method.clone().into());
        push("--activity-pointer", self.activity_pointer.clone().into());
        let optional = [
            ("--profile-url", &self.profile_url),
            ("--profile-body", &self.profile_body),
            ("--activity-url", &self.activity_url),
            ("--activity-body", &self.activity_body),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                push(flag, value.clone().into());
            }
        }
        args
    }
}

fn lookup(
    name: &'static str,
    url: Option<&str>,
    method: &str,
    body: Option<&str>,
    pointer: &str,
) -> Result<Option<LookupEndpoint>, ConfigError> {
    let Some(url) = url.map(str::trim).filter(|url| !url.is_empty()) else {
        return Ok(None);
    };
    let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
        ConfigError::InvalidMethod {
            lookup: name,
            method: method.to_string(),
        }
    })?;
    let body = body
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|source| ConfigError::InvalidBody { lookup: name, source })?;

    let endpoint = LookupEndpoint::new(method, url, body, pointer);
    endpoint
        .url_for(&WorkItem::new("0", "0x0"))
        .map_err(|source| ConfigError::InvalidUrl { lookup: name, source })?;
    Ok(Some(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        service: ServiceArgs,
    }

    fn parse(args: &[&str]) -> ServiceArgs {
        Harness::try_parse_from(std::iter::once("fastenrich").chain(args.iter().copied()))
            .expect("parse")
            .service
    }

    #[test]
    fn defaults_match_documented_values() {
        let controls = parse(&[]).build_controls().expect("controls");
        assert_eq!(controls.batch().batch_size, 50);
        assert_eq!(controls.batch().item_delay, Duration::from_millis(100));
        assert_eq!(controls.retry(), &RetryPolicy::default());
        assert_eq!(controls.lookup_timeout(), Duration::from_secs(30));
        assert_eq!(controls.outbound_limit(), None);
    }

    #[test]
    fn forwarded_flags_reparse_to_the_same_controls() {
        let args = parse(&[
            "--batch-size",
            "7",
            "--activity-url",
            "http://rpc.test/",
            "--activity-method",
            "post",
            "--activity-body",
            r#"{"params":["{address}"]}"#,
            "--activity-pointer",
            "/result",
            "--outbound-max-requests",
            "5",
        ]);
        let forwarded: Vec<String> = args
            .to_args()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let forwarded: Vec<&str> = forwarded.iter().map(String::as_str).collect();
        let reparsed = parse(&forwarded);
        assert_eq!(
            reparsed.build_controls().expect("reparsed"),
            args.build_controls().expect("original")
        );
        assert_eq!(
            args.build_controls().expect("controls").outbound_limit(),
            Some((Duration::from_secs(1), 5))
        );
    }

    #[test]
    fn rejects_bad_lookup_definitions() {
        let bad_body = parse(&["--profile-url", "http://api.test/{address}", "--profile-body", "{"]);
        assert!(matches!(
            bad_body.build_controls(),
            Err(ConfigError::InvalidBody { lookup: "profile", .. })
        ));

        let bad_url = parse(&["--activity-url", "not a url"]);
        assert!(matches!(
            bad_url.build_controls(),
            Err(ConfigError::InvalidUrl { lookup: "activity", .. })
        ));
    }
}
