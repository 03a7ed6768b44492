//! Header hygiene for traffic forwarded to the gateway.
//!
//! The gateway treats connections from the wrapper as local. Forwarding
//! headers set by external clients or intermediaries would make it treat the
//! peer as remote behind an untrusted proxy, so they never reach it.

use hyper::header::{HeaderMap, HeaderName};

/// Forwarding/trust headers removed from every request and upgrade
pub const FORWARDING_HEADERS: [&str; 11] = [
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-proto",
    "x-forwarded-server",
    "x-forwarded-ssl",
    "x-real-ip",
    "x-client-ip",
    "cf-connecting-ip",
    "true-client-ip",
];

/// Handshake headers regenerated by the outbound WebSocket client
pub const WS_HANDSHAKE_HEADERS: [&str; 6] = [
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

/// Remove all forwarding/trust headers. Idempotent.
///
/// `HeaderMap` stores names lowercased, so removal is case-insensitive with
/// respect to what the client sent.
pub fn sanitize(headers: &mut HeaderMap) {
    for name in FORWARDING_HEADERS {
        headers.remove(name);
    }
}

/// Headers for the upstream WebSocket handshake: the sanitized client headers
/// minus the handshake set and `host`, which the outbound client fills in.
pub fn upstream_ws_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    sanitize(&mut out);
    for name in WS_HANDSHAKE_HEADERS {
        out.remove(name);
    }
    out.remove(hyper::header::HOST);
    out
}

/// Parse a `Sec-WebSocket-Protocol` header set into its protocol list
pub fn parse_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(HeaderName::from_static("sec-websocket-protocol"))
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn dirty_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("Forwarded", HeaderValue::from_static("for=1.2.3.4"));
        headers.append("X-Forwarded-For", HeaderValue::from_static("1.2.3.4"));
        headers.append("x-forwarded-for", HeaderValue::from_static("5.6.7.8"));
        headers.insert("X-FORWARDED-PROTO", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("evil.com"));
        headers.insert("x-forwarded-port", HeaderValue::from_static("443"));
        headers.insert("x-forwarded-server", HeaderValue::from_static("edge"));
        headers.insert("x-forwarded-ssl", HeaderValue::from_static("on"));
        headers.insert("X-Real-IP", HeaderValue::from_static("1.2.3.4"));
        headers.insert("x-client-ip", HeaderValue::from_static("1.2.3.4"));
        headers.insert("CF-Connecting-IP", HeaderValue::from_static("1.2.3.4"));
        headers.insert("True-Client-IP", HeaderValue::from_static("1.2.3.4"));
        headers
    }

    #[test]
    fn test_sanitize_removes_all_forwarding_headers() {
        let mut headers = dirty_headers();
        sanitize(&mut headers);

        for name in FORWARDING_HEADERS {
            assert!(!headers.contains_key(name), "{} survived", name);
        }
        assert_eq!(headers.get("host").unwrap(), "example.com");
        assert_eq!(headers.get("accept").unwrap(), "text/html");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let mut once = dirty_headers();
        sanitize(&mut once);
        let mut twice = once.clone();
        sanitize(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_upstream_ws_headers_strip_handshake() {
        let mut headers = dirty_headers();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        headers.insert("sec-websocket-version", HeaderValue::from_static("13"));
        headers.insert("sec-websocket-extensions", HeaderValue::from_static("permessage-deflate"));
        headers.insert("sec-websocket-protocol", HeaderValue::from_static("a, b"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("origin", HeaderValue::from_static("https://example.com"));

        let out = upstream_ws_headers(&headers);
        assert_eq!(out.len(), 3);
        assert_eq!(out.get("cookie").unwrap(), "session=1");
        assert_eq!(out.get("origin").unwrap(), "https://example.com");
        assert_eq!(out.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_parse_subprotocols() {
        let mut headers = HeaderMap::new();
        headers.append("sec-websocket-protocol", HeaderValue::from_static("chat, json ,"));
        headers.append("sec-websocket-protocol", HeaderValue::from_static("v2"));
        assert_eq!(parse_subprotocols(&headers), vec!["chat", "json", "v2"]);

        assert!(parse_subprotocols(&HeaderMap::new()).is_empty());
    }
}
