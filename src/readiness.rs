//! Readiness probing for a freshly spawned gateway.
//!
//! A cold gateway refuses connections for a while; individual probe failures
//! are expected and only the overall deadline decides the outcome.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Timing of one readiness poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Overall deadline
    pub timeout_total: Duration,
    /// Spacing between probes
    pub interval: Duration,
    /// Bound on a single probe
    pub per_request_timeout: Duration,
}

/// Issues health probes against the gateway over HTTP
pub struct ReadinessProber {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProber {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // No pooling: each probe should see the listener's current state
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client }
    }

    /// Poll `target + path` until it answers with a status below 500 or the
    /// deadline elapses.
    pub async fn poll(&self, target: &str, path: &str, settings: PollSettings) -> bool {
        let url = format!("{}{}", target.trim_end_matches('/'), path);
        debug!(%url, timeout_ms = settings.timeout_total.as_millis() as u64, "Waiting for gateway readiness");

        let probe_url = url.as_str();
        let ready = poll_until(settings, || self.probe(probe_url)).await;
        if !ready {
            warn!(%url, timeout_ms = settings.timeout_total.as_millis() as u64, "Gateway did not become ready in time");
        }
        ready
    }

    /// One probe; any transport error counts as "not ready yet"
    async fn probe(&self, url: &str) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(url)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match self.client.request(req).await {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                debug!(url, error = %e, "Readiness probe failed");
                false
            }
        }
    }
}

/// Drive `probe` until it returns true or `timeout_total` elapses.
///
/// Every probe is bounded by `per_request_timeout` (and by the remaining
/// budget); a timed-out probe counts as a failure. Probes are spaced by
/// `interval`.
pub async fn poll_until<F, Fut>(settings: PollSettings, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + settings.timeout_total;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }

        let budget = settings.per_request_timeout.min(deadline - now);
        if let Ok(true) = tokio::time::timeout(budget, probe()).await {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(settings.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings(total_ms: u64, interval_ms: u64, per_request_ms: u64) -> PollSettings {
        PollSettings {
            timeout_total: Duration::from_millis(total_ms),
            interval: Duration::from_millis(interval_ms),
            per_request_timeout: Duration::from_millis(per_request_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately() {
        let start = Instant::now();
        assert!(poll_until(settings(1_000, 100, 50), || async { true }).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_within_budget_after_backend_comes_up() {
        let start = Instant::now();
        let up_at = start + Duration::from_millis(730);

        let ready = poll_until(settings(5_000, 250, 100), || async move {
            Instant::now() >= up_at
        })
        .await;

        assert!(ready);
        // Observed no later than one interval after the backend came up
        assert!(start.elapsed() >= Duration::from_millis(730));
        assert!(start.elapsed() <= Duration::from_millis(730 + 250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();

        let ready = poll_until(settings(1_000, 100, 50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;

        assert!(!ready);
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
        // Failures are swallowed and retried until the budget is spent
        assert!(calls.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_is_bounded() {
        let start = Instant::now();

        let ready = poll_until(settings(600, 100, 200), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        })
        .await;

        assert!(!ready);
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_probe_refused_connection_is_not_ready() {
        // Bind then drop to obtain a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = ReadinessProber::new();
        let ready = prober
            .poll(
                &format!("http://127.0.0.1:{}", port),
                "/healthz",
                settings(300, 50, 100),
            )
            .await;
        assert!(!ready);
    }
}
