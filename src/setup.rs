//! Routes served by the wrapper itself under `/setup`, plus the landing page
//! shown while the gateway is not configured.

use crate::error::{text_error_response, ProxyErrorCode};
use crate::pool::PoolStats;
use crate::supervisor::Supervisor;
use crate::token::AccessToken;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version information for the wrapper
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Prefix of every wrapper-owned route
pub const SETUP_PREFIX: &str = "/setup";

const LANDING_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Setup required</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 36rem; margin: 4rem auto; padding: 0 1rem; color: #222; }
code { background: #f2f2f2; padding: 0 .25rem; }
</style>
</head>
<body>
<h1>Setup required</h1>
<p>The gateway has not been configured yet. Complete setup, then reload this page.</p>
<p>Status: <code>/setup/healthz</code></p>
</body>
</html>
"#;

fn full(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, "no-store")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody<Bytes, hyper::Error>> {
    full(status, "application/json", value.to_string())
}

/// Page returned for every HTTP request while unconfigured
pub fn landing_page() -> Response<BoxBody<Bytes, hyper::Error>> {
    full(StatusCode::OK, "text/html; charset=utf-8", LANDING_PAGE)
}

/// Whether `path` belongs to the wrapper rather than the gateway
pub fn is_setup_path(path: &str) -> bool {
    path == SETUP_PREFIX
        || path
            .strip_prefix(SETUP_PREFIX)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

fn check_auth<B>(req: &Request<B>, token: &AccessToken) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|presented| token.matches(presented.trim()))
        .unwrap_or(false)
}

/// Serve a `/setup` route
pub async fn handle<B>(
    req: Request<B>,
    supervisor: &Arc<Supervisor>,
    token: &AccessToken,
    pool: &PoolStats,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Setup request");

    match (method, path) {
        (&Method::GET, "/setup/healthz") | (&Method::HEAD, "/setup/healthz") => {
            let status = supervisor.status();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "ok": true,
                    "name": PKG_NAME,
                    "version": VERSION,
                    "configured": status.configured,
                    "gateway": status,
                    "proxy": {
                        "total_requests": pool.get_total_requests(),
                        "failed_requests": pool.get_failed_requests(),
                    },
                }),
            )
        }

        (&Method::POST, "/setup/api/restart") => {
            if !check_auth(&req, token) {
                warn!(path, "Unauthorized restart request");
                return text_error_response(ProxyErrorCode::Unauthorized, "Unauthorized");
            }

            info!("Gateway restart requested");
            match supervisor.restart().await {
                Ok(()) => json_response(
                    StatusCode::OK,
                    serde_json::json!({ "ok": true, "gateway": supervisor.status() }),
                ),
                Err(e) => {
                    error!(error = %e, "Gateway restart failed");
                    text_error_response(ProxyErrorCode::from(&e), format!("Restart failed: {}", e))
                }
            }
        }

        (&Method::GET, "/setup") | (&Method::GET, "/setup/") => landing_page(),

        _ => full(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "not found\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, ReadinessConfig};

    fn unconfigured_supervisor(dir: &std::path::Path) -> Arc<Supervisor> {
        let gateway = GatewayConfig::new("true", 1).with_state_dir(dir);
        Supervisor::new(gateway, ReadinessConfig::default(), AccessToken::new("tok"))
    }

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_is_setup_path() {
        assert!(is_setup_path("/setup"));
        assert!(is_setup_path("/setup/"));
        assert!(is_setup_path("/setup/api/restart"));
        assert!(!is_setup_path("/setupx"));
        assert!(!is_setup_path("/ui/setup"));
        assert!(!is_setup_path("/"));
    }

    #[test]
    fn test_check_auth() {
        let token = AccessToken::new("tok");
        let req = |value: Option<&str>| {
            let mut builder = Request::builder().method(Method::POST).uri("/setup/api/restart");
            if let Some(value) = value {
                builder = builder.header(AUTHORIZATION, value);
            }
            builder.body(()).unwrap()
        };

        assert!(check_auth(&req(Some("Bearer tok")), &token));
        assert!(!check_auth(&req(Some("Bearer nope")), &token));
        assert!(!check_auth(&req(Some("tok")), &token));
        assert!(!check_auth(&req(None), &token));
    }

    #[tokio::test]
    async fn test_healthz_reports_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let sup = unconfigured_supervisor(dir.path());
        let req = Request::get("/setup/healthz").body(()).unwrap();
        let pool = PoolStats::default();
        pool.record_request();
        pool.record_request();
        pool.record_failure();

        let response = handle(req, &sup, &AccessToken::new("tok"), &pool).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["configured"], false);
        assert_eq!(body["gateway"]["running"], false);
        assert_eq!(body["gateway"]["spawns"], 0);
        assert_eq!(body["proxy"]["total_requests"], 2);
        assert_eq!(body["proxy"]["failed_requests"], 1);
    }

    #[tokio::test]
    async fn test_restart_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let sup = unconfigured_supervisor(dir.path());
        let req = Request::post("/setup/api/restart").body(()).unwrap();

        let response = handle(req, &sup, &AccessToken::new("tok"), &PoolStats::default()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(sup.status().restarts, 0);
    }

    #[tokio::test]
    async fn test_restart_unconfigured_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sup = unconfigured_supervisor(dir.path());
        let req = Request::post("/setup/api/restart")
            .header(AUTHORIZATION, "Bearer tok")
            .body(())
            .unwrap();

        let response = handle(req, &sup, &AccessToken::new("tok"), &PoolStats::default()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NOT_CONFIGURED");
        assert_eq!(sup.status().spawns, 0);
    }

    #[tokio::test]
    async fn test_landing_page() {
        let response = landing_page();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert!(body_string(response).await.contains("Setup required"));
    }
}
