//! The `/monitor/status` endpoint.
//!
//! Requests to the status path run every registered reachability check and
//! get a JSON report back. Every other request passes through and is tallied
//! by response status.
//!
//! ```rust,no_run
//! use fulcrum::concerns::status::Status;
//!
//! let status = Status::new("orders").check("cache", |_cx| async { Ok::<_, fulcrum::BoxError>(()) });
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::Settings;
use crate::context::Context;
use crate::envelope::{BoxError, Envelope};
use crate::failure::Failure;
use crate::handler::{BoxFuture, BoxedHandler, from_outcome_fn};
use crate::middleware::Middleware;

pub const STATUS_PATH: &str = "/monitor/status";

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

type CheckFn = dyn Fn(Context) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// Status endpoint settings, and the middleware serving it.
#[derive(Clone)]
pub struct Status {
    service: String,
    git: Option<String>,
    checks: Vec<(String, Arc<CheckFn>)>,
    timeout: Duration,
}

impl Status {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), git: None, checks: Vec::new(), timeout: CHECK_TIMEOUT }
    }

    /// Service name and `GIT_COMMIT` from the process settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self { git: settings.git_commit.clone(), ..Self::new(settings.service_name.clone()) }
    }

    pub fn git(mut self, commit: impl Into<String>) -> Self {
        self.git = Some(commit.into());
        self
    }

    /// Registers a named reachability check. `Ok` reports healthy.
    pub fn check<F, Fut>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let erased: Arc<CheckFn> =
            Arc::new(move |cx: Context| -> BoxFuture<'static, Result<(), BoxError>> { Box::pin(check(cx)) });
        self.checks.push((name.into(), erased));
        self
    }

    /// How long each check may take before it is reported failed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("service", &self.service)
            .field("checks", &self.checks.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Report<'a> {
    git: Option<&'a str>,
    uptime: f64,
    service: &'a str,
    hostname: String,
    memory: BTreeMap<String, u64>,
    downstream: BTreeMap<String, Reachability>,
    stats: Stats,
}

#[derive(Debug, Serialize)]
struct Reachability {
    status: &'static str,
    error: Option<String>,
    latency: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    request_count: u64,
    statuses: BTreeMap<u16, u64>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    statuses: Mutex<BTreeMap<u16, u64>>,
}

async fn run_check(check: &CheckFn, cx: Context, timeout: Duration) -> Reachability {
    let start = Instant::now();
    let error = match tokio::time::timeout(timeout, check(cx)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
    };
    Reachability {
        status: if error.is_none() { "healthy" } else { "failed" },
        error,
        latency: start.elapsed().as_millis() as u64,
    }
}

fn machine_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Resident and virtual memory in bytes, where the platform reports them.
fn memory() -> BTreeMap<String, u64> {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return BTreeMap::new();
    };
    status
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let name = match key {
                "VmRSS" => "rss",
                "VmHWM" => "rssPeak",
                "VmSize" => "virtual",
                "RssAnon" => "heap",
                _ => return None,
            };
            let kb: u64 = value.trim().trim_end_matches("kB").trim().parse().ok()?;
            Some((name.to_owned(), kb * 1024))
        })
        .collect()
}

// ── Middleware ────────────────────────────────────────────────────────────────

impl Middleware for Status {
    fn name(&self) -> &str {
        "status"
    }

    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let config = Arc::new(self.clone());
        let counters = Arc::new(Counters::default());
        let started = Instant::now();
        let hostname: Arc<str> = Arc::from(machine_name());

        from_outcome_fn(move |cx| {
            let next = next.clone();
            let config = Arc::clone(&config);
            let counters = Arc::clone(&counters);
            let hostname = Arc::clone(&hostname);
            async move {
                if cx.path() != STATUS_PATH {
                    counters.requests.fetch_add(1, Ordering::Relaxed);
                    let envelope = next.call(cx).await?;
                    *counters.statuses.lock().entry(envelope.status_code().as_u16()).or_default() += 1;
                    return Ok(envelope);
                }

                let mut downstream = BTreeMap::new();
                for (name, check) in &config.checks {
                    let result = run_check(check.as_ref(), cx.clone(), config.timeout).await;
                    downstream.insert(name.clone(), result);
                }

                let report = Report {
                    git: config.git.as_deref(),
                    uptime: started.elapsed().as_secs_f64(),
                    service: &config.service,
                    hostname: hostname.to_string(),
                    memory: memory(),
                    downstream,
                    stats: Stats {
                        request_count: counters.requests.load(Ordering::Relaxed),
                        statuses: counters.statuses.lock().clone(),
                    },
                };
                let body = serde_json::to_value(&report)?;
                Ok::<_, Failure>(Envelope::json(body))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::testing::context;

    fn terminal() -> BoxedHandler {
        from_outcome_fn(|cx: Context| async move {
            if cx.path() == "/missing" {
                return Ok::<_, Failure>(Envelope::status(StatusCode::NOT_FOUND));
            }
            Ok(Envelope::text("ok").with_status(StatusCode::OK))
        })
    }

    #[tokio::test]
    async fn reports_checks_and_tallies() {
        let handler = Status::new("orders")
            .git("abc123")
            .check("up", |_cx| async { Ok::<_, BoxError>(()) })
            .check("down", |_cx| async { Err::<(), BoxError>("connection refused".into()) })
            .wrap(terminal());

        handler.call(context("GET", "/a")).await.unwrap();
        handler.call(context("GET", "/b")).await.unwrap();
        handler.call(context("GET", "/missing")).await.unwrap();

        let envelope = handler.call(context("GET", STATUS_PATH)).await.unwrap();
        let report = envelope.payload().as_json().unwrap();

        assert_eq!(report["service"], json!("orders"));
        assert_eq!(report["git"], json!("abc123"));
        assert_eq!(report["stats"], json!({"requestCount": 3, "statuses": {"200": 2, "404": 1}}));
        assert_eq!(report["downstream"]["up"]["status"], json!("healthy"));
        assert_eq!(report["downstream"]["up"]["error"], json!(null));
        assert_eq!(report["downstream"]["down"]["status"], json!("failed"));
        assert_eq!(report["downstream"]["down"]["error"], json!("connection refused"));
        assert!(report["uptime"].is_number());
        assert!(report["hostname"].is_string());
    }

    #[test]
    fn machine_name_comes_from_the_os() {
        let expected = hostname::get().unwrap().to_string_lossy().into_owned();
        assert_eq!(machine_name(), expected);
        assert_ne!(machine_name(), "unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_checks_time_out() {
        let handler = Status::new("orders")
            .timeout(Duration::from_millis(50))
            .check("stuck", |_cx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, BoxError>(())
            })
            .wrap(terminal());
        let envelope = handler.call(context("GET", STATUS_PATH)).await.unwrap();
        let report = envelope.payload().as_json().unwrap();
        assert_eq!(report["downstream"]["stuck"]["status"], json!("failed"));
        assert_eq!(report["downstream"]["stuck"]["error"], json!("timed out after 50ms"));
    }
}
