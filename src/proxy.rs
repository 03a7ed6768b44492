use crate::config::WebSocketConfig;
use crate::error::{text_error_response, ConnectionRejected, ProxyErrorCode};
use crate::gate::{self, AccessGate};
use crate::headers;
use crate::net;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::setup;
use crate::supervisor::Supervisor;
use crate::ws::{self, BridgeOptions};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Everything a connection needs, shared across connections
struct ProxyState {
    supervisor: Arc<Supervisor>,
    gate: AccessGate,
    pool: ConnectionPool,
    websocket: WebSocketConfig,
}

/// The public-facing reverse proxy in front of the gateway
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        gate: AccessGate,
        websocket: WebSocketConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(
            bind_addr,
            supervisor,
            gate,
            websocket,
            shutdown_rx,
            PoolConfig::default(),
        )
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        gate: AccessGate,
        websocket: WebSocketConfig,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(ProxyState {
                supervisor,
                gate,
                pool: ConnectionPool::new(pool_config),
                websocket,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, gateway = %self.state.supervisor.gateway().target(), "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = net::harden(&stream, self.state.websocket.keepalive()) {
                                debug!(addr = %addr, error = %e, "Failed to tune client socket");
                            }

                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, ConnectionRejected> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let is_upgrade = ws::is_upgrade_request(req.headers());
    debug!(client = %client_addr, method = %req.method(), uri = %req.uri(), request_id, is_upgrade, "Incoming request");

    if !is_upgrade && setup::is_setup_path(req.uri().path()) {
        return Ok(setup::handle(req, &state.supervisor, state.gate.token(), &state.pool.stats()).await);
    }

    if !state.supervisor.is_configured() {
        if is_upgrade {
            debug!(request_id, "Gateway not configured, dropping upgrade");
            return Err(ConnectionRejected("gateway not configured".to_string()));
        }
        return Ok(setup::landing_page());
    }

    if is_upgrade {
        return handle_upgrade(req, state, request_id).await;
    }

    if let Some(location) = state.gate.check(&req) {
        debug!(request_id, path = req.uri().path(), "Redirecting navigation to tokenized UI");
        return Ok(gate::redirect_response(&location));
    }

    headers::sanitize(req.headers_mut());

    if let Err(e) = state.supervisor.ensure_running().await {
        error!(request_id, error = %e, "Gateway unavailable");
        return Ok(text_error_response(
            ProxyErrorCode::from(&e),
            format!("Gateway is not available: {}. Try again shortly.", e),
        ));
    }

    let gateway = state.supervisor.gateway();
    let port = gateway.port;
    let request_timeout = gateway.request_timeout();

    let result = tokio::time::timeout(request_timeout, state.pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(request_id, port, error = %e, "Failed to forward request to gateway");
            Ok(text_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to gateway",
            ))
        }
        Err(_) => {
            warn!(
                request_id,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(text_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Answer a WebSocket upgrade and pair it with a fresh upstream connection
async fn handle_upgrade(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    request_id: String,
) -> Result<ProxyResponse, ConnectionRejected> {
    headers::sanitize(req.headers_mut());

    if let Err(e) = state.supervisor.ensure_running().await {
        warn!(request_id, error = %e, "Gateway unavailable, dropping upgrade");
        return Err(ConnectionRejected(e.to_string()));
    }

    let Some(response) = ws::accept_response(req.headers()) else {
        return Ok(bad_request("Invalid WebSocket handshake"));
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let upstream_headers = headers::upstream_ws_headers(req.headers());
    let subprotocols = headers::parse_subprotocols(req.headers());
    let port = state.supervisor.gateway().port;
    let keepalive = state.websocket.keepalive();
    let options = BridgeOptions {
        ping_interval: state.websocket.ping_interval(),
        close_timeout: state.websocket.close_timeout(),
    };

    let upgrade = hyper::upgrade::on(req);

    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(request_id, error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        let pairing = Uuid::new_v4();
        let upstream = match ws::connect_upstream(
            port,
            &path_and_query,
            &upstream_headers,
            &subprotocols,
            keepalive,
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                // Dropping the client stream destroys the socket
                error!(request_id, %pairing, error = %e, "Upstream WebSocket connection failed");
                return;
            }
        };

        info!(request_id, %pairing, path = %path_and_query, "WebSocket paired");
        let outcome = ws::bridge(client, upstream, options).await;
        info!(
            request_id,
            %pairing,
            closed_by = %outcome.closed_by,
            code = ?outcome.code,
            graceful = outcome.graceful,
            client_to_upstream = outcome.client_to_upstream,
            upstream_to_client = outcome.upstream_to_client,
            "WebSocket pairing closed"
        );
    });

    Ok(response)
}

fn bad_request(message: &str) -> ProxyResponse {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(format!("{}\n", message)))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}
