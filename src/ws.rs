//! WebSocket bridging between a browser and the gateway.
//!
//! The wrapper terminates the client's WebSocket itself and opens a second,
//! independent connection to the gateway. [`bridge`] then relays frames
//! between the two until either side goes away.
//!
//! A pairing moves through `Upgrading -> Paired -> Closing -> Closed`:
//! the upgrade handshake is answered by [`accept_response`], the upstream leg
//! is opened by [`connect_upstream`], and [`bridge`] covers the rest.
//! Whichever side closes or fails first decides the close frame the other
//! side receives; a peer that does not finish its close handshake within
//! the close timeout is dropped.

use crate::headers;
use crate::net;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Failure to establish the upstream leg of a pairing
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("upstream connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("upstream handshake failed: {0}")]
    Handshake(#[from] WsError),
}

/// Timing of a pairing
#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    /// Application-level ping period, run independently per side
    pub ping_interval: Duration,
    /// Bound on the graceful close of the surviving side
    pub close_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pairing ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    /// Side that closed or failed first
    pub closed_by: Side,
    /// Close code received from that side, if any
    pub code: Option<u16>,
    /// Whether the other side completed its close handshake in time
    pub graceful: bool,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Whether the request asks for a WebSocket upgrade
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// Build the `101 Switching Protocols` answer to a client handshake.
///
/// Echoes the first requested subprotocol. Returns `None` when the request
/// is not a valid version 13 handshake.
pub fn accept_response(request_headers: &HeaderMap) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    let key = request_headers.get(SEC_WEBSOCKET_KEY)?;
    let version_ok = request_headers
        .get(SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes() == b"13")
        .unwrap_or(false);
    if !version_ok {
        return None;
    }

    let accept = derive_accept_key(key.as_bytes());
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept);

    if let Some(protocol) = headers::parse_subprotocols(request_headers).into_iter().next() {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .ok()
}

/// Open the upstream leg to the gateway on loopback.
///
/// `extra_headers` must already be sanitized and stripped of handshake
/// headers (see [`headers::upstream_ws_headers`]); the handshake headers
/// and `Host` are generated here.
pub async fn connect_upstream(
    port: u16,
    path_and_query: &str,
    extra_headers: &HeaderMap,
    subprotocols: &[String],
    keepalive: Duration,
) -> Result<WebSocketStream<TcpStream>, BridgeError> {
    let url = format!("ws://127.0.0.1:{}{}", port, path_and_query);
    let mut request = url.as_str().into_client_request()?;

    for (name, value) in extra_headers.iter() {
        request.headers_mut().append(name, value.clone());
    }
    if !subprotocols.is_empty() {
        let value = HeaderValue::from_str(&subprotocols.join(", "))
            .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    net::harden(&stream, keepalive)?;

    let (ws, response) = tokio_tungstenite::client_async(request, stream).await?;
    debug!(%url, status = %response.status(), "Upstream WebSocket connected");
    Ok(ws)
}

enum Inbound {
    Data(Message),
    Control,
    Closed(Option<CloseFrame>),
}

fn classify(side: Side, item: Option<Result<Message, WsError>>) -> Inbound {
    match item {
        Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => Inbound::Data(msg),
        Some(Ok(Message::Close(frame))) => Inbound::Closed(frame),
        Some(Ok(_)) => Inbound::Control,
        Some(Err(e)) => {
            debug!(side = side.as_str(), error = %e, "WebSocket read error");
            Inbound::Closed(None)
        }
        None => Inbound::Closed(None),
    }
}

/// Close frame to send to the surviving side. Codes that must never appear
/// on the wire (1005, 1006, 1015) become an empty close.
fn forwardable_close(frame: Option<CloseFrame>) -> Message {
    match frame {
        Some(frame)
            if !matches!(
                frame.code,
                CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls
            ) =>
        {
            Message::Close(Some(frame))
        }
        _ => Message::Close(None),
    }
}

/// Relay frames between `client` and `upstream` until one side goes away,
/// then close the other.
pub async fn bridge<C, U>(
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    options: BridgeOptions,
) -> BridgeOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let start = Instant::now() + options.ping_interval;
    let mut client_ping = interval_at(start, options.ping_interval);
    let mut upstream_ping = interval_at(start, options.ping_interval);
    client_ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    upstream_ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;

    // Paired. Every send is bounded so a peer that stops reading cannot
    // stall the other direction or the ping timers.
    let stall = options.close_timeout;
    let (closed_by, frame) = loop {
        tokio::select! {
            item = client_rx.next() => match classify(Side::Client, item) {
                Inbound::Data(msg) => {
                    client_to_upstream += 1;
                    if !relay(&mut upstream_tx, msg, Side::Upstream, stall).await {
                        break (Side::Upstream, None);
                    }
                }
                Inbound::Control => {}
                Inbound::Closed(frame) => break (Side::Client, frame),
            },
            item = upstream_rx.next() => match classify(Side::Upstream, item) {
                Inbound::Data(msg) => {
                    upstream_to_client += 1;
                    if !relay(&mut client_tx, msg, Side::Client, stall).await {
                        break (Side::Client, None);
                    }
                }
                Inbound::Control => {}
                Inbound::Closed(frame) => break (Side::Upstream, frame),
            },
            _ = client_ping.tick() => {
                if !relay(&mut client_tx, Message::Ping(Bytes::new()), Side::Client, stall).await {
                    break (Side::Client, None);
                }
            }
            _ = upstream_ping.tick() => {
                if !relay(&mut upstream_tx, Message::Ping(Bytes::new()), Side::Upstream, stall).await {
                    break (Side::Upstream, None);
                }
            }
        }
    };

    // Closing: ping timers are dropped with the loop
    let code = frame.as_ref().map(|f| u16::from(f.code));
    debug!(closed_by = closed_by.as_str(), ?code, "WebSocket pairing closing");

    let close = forwardable_close(frame);
    let graceful = match closed_by {
        Side::Client => {
            let graceful =
                close_peer(&mut upstream_tx, &mut upstream_rx, close, options.close_timeout).await;
            finish(&mut client_tx, options.close_timeout).await;
            graceful
        }
        Side::Upstream => {
            let graceful =
                close_peer(&mut client_tx, &mut client_rx, close, options.close_timeout).await;
            finish(&mut upstream_tx, options.close_timeout).await;
            graceful
        }
    };

    // Closed: both halves drop here, which releases the sockets
    BridgeOutcome {
        closed_by,
        code,
        graceful,
        client_to_upstream,
        upstream_to_client,
    }
}

/// Best-effort send to `to`. Send errors are swallowed; `false` means the
/// send did not complete within `timeout` and the peer is treated as gone.
async fn relay<S>(
    tx: &mut SplitSink<WebSocketStream<S>, Message>,
    msg: Message,
    to: Side,
    timeout: Duration,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(side = to.as_str(), error = %e, "Relay send failed");
            true
        }
        Err(_) => {
            debug!(side = to.as_str(), timeout_ms = timeout.as_millis() as u64, "Peer stopped reading, closing pairing");
            false
        }
    }
}

/// Send `close` and wait for the peer's reply. `false` means the peer is
/// abandoned and will be dropped.
async fn close_peer<S>(
    tx: &mut SplitSink<WebSocketStream<S>, Message>,
    rx: &mut SplitStream<WebSocketStream<S>>,
    close: Message,
    timeout: Duration,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = async {
        tx.send(close).await?;
        while let Some(msg) = rx.next().await {
            if let Message::Close(_) = msg? {
                break;
            }
        }
        Ok::<_, WsError>(())
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(())) => true,
        Ok(Err(WsError::ConnectionClosed)) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Graceful close failed, terminating");
            false
        }
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "Close handshake timed out, terminating");
            false
        }
    }
}

/// Flush the closing side's half of the close handshake
async fn finish<S>(tx: &mut SplitSink<WebSocketStream<S>, Message>, timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(timeout, tx.close()).await;
}
