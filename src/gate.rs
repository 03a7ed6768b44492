//! Token redirect for browser navigations to the UI entry points.

use crate::token::AccessToken;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, LOCATION};
use hyper::{Method, Request, Response, StatusCode};

/// Decides whether a top-level navigation carries the access token and, if
/// not, where to send the browser instead.
#[derive(Debug, Clone)]
pub struct AccessGate {
    ui_base_path: String,
    token: AccessToken,
}

impl AccessGate {
    pub fn new(ui_base_path: impl Into<String>, token: AccessToken) -> Self {
        let mut ui_base_path = ui_base_path.into();
        while ui_base_path.len() > 1 && ui_base_path.ends_with('/') {
            ui_base_path.pop();
        }
        Self { ui_base_path, token }
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    /// Canonical tokenized UI location
    pub fn redirect_location(&self) -> String {
        format!(
            "{}?token={}",
            self.ui_base_path,
            urlencoding::encode(self.token.as_str())
        )
    }

    /// Returns the redirect target when the request must be redirected, or
    /// `None` when it may proceed unchanged.
    pub fn check<B>(&self, req: &Request<B>) -> Option<String> {
        if !self.is_ui_navigation(req) {
            return None;
        }

        match query_param(req.uri().query(), "token") {
            Some(presented) if self.token.matches(&presented) => None,
            _ => Some(self.redirect_location()),
        }
    }

    fn is_ui_navigation<B>(&self, req: &Request<B>) -> bool {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return false;
        }

        let path = req.uri().path();
        let targets_ui = path == "/"
            || path == self.ui_base_path
            || path.strip_prefix(self.ui_base_path.as_str()) == Some("/");
        if !targets_ui {
            return false;
        }

        is_navigation(req)
    }
}

/// A navigation is a request for an HTML document, or one without an accept
/// header at all.
pub fn is_navigation<B>(req: &Request<B>) -> bool {
    match req.headers().get(ACCEPT) {
        None => true,
        Some(accept) => accept
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false),
    }
}

/// Build the redirect response (302 Found) for a gate decision
pub fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid redirect response")
}

/// First value of a query parameter, percent-decoded
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
        .next()
        .map(|value| {
            let value = value.replace('+', " ");
            urlencoding::decode(&value)
                .map(|v| v.into_owned())
                .unwrap_or(value)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AccessGate {
        AccessGate::new("/ui/", AccessToken::new("tok3n"))
    }

    fn request(method: Method, uri: &str, accept: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        builder.body(()).unwrap()
    }

    const HTML: Option<&str> = Some("text/html,application/xhtml+xml,*/*;q=0.8");

    #[test]
    fn test_root_without_token_redirects() {
        let req = request(Method::GET, "/", HTML);
        assert_eq!(gate().check(&req), Some("/ui?token=tok3n".to_string()));
    }

    #[test]
    fn test_wrong_token_redirects() {
        let req = request(Method::GET, "/ui?token=stale", HTML);
        assert_eq!(gate().check(&req), Some("/ui?token=tok3n".to_string()));

        let req = request(Method::GET, "/ui/?token=", HTML);
        assert!(gate().check(&req).is_some());
    }

    #[test]
    fn test_correct_token_passes() {
        let req = request(Method::GET, "/ui?foo=1&token=tok3n", HTML);
        assert_eq!(gate().check(&req), None);

        let req = request(Method::GET, "/?token=tok3n", None);
        assert_eq!(gate().check(&req), None);
    }

    #[test]
    fn test_missing_accept_counts_as_navigation() {
        let req = request(Method::GET, "/ui", None);
        assert!(gate().check(&req).is_some());
    }

    #[test]
    fn test_non_navigation_is_exempt() {
        let req = request(Method::GET, "/", Some("application/json"));
        assert_eq!(gate().check(&req), None);

        let req = request(Method::POST, "/", HTML);
        assert_eq!(gate().check(&req), None);
    }

    #[test]
    fn test_other_paths_are_exempt() {
        for uri in ["/assets/app.js", "/ui/settings", "/uix", "/api/status"] {
            let req = request(Method::GET, uri, HTML);
            assert_eq!(gate().check(&req), None, "{} should not be gated", uri);
        }
    }

    #[test]
    fn test_token_is_percent_encoded() {
        let gate = AccessGate::new("/ui", AccessToken::new("a b&c"));
        assert_eq!(gate.redirect_location(), "/ui?token=a%20b%26c");

        let req = request(Method::GET, "/ui?token=a%20b%26c", HTML);
        assert_eq!(gate.check(&req), None);
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect_response("/ui?token=x");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/ui?token=x");
    }
}
