//! Inbound request snapshot handed from the HTTP layer to the dispatcher.

use axum::http::{HeaderMap, Method, Uri, header};
use bytes::Bytes;
use url::Url;

/// The inbound request that started an invocation.
///
/// Immutable once captured; the forwarder replays it against the sandbox.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub method: Method,
    pub headers: HeaderMap,
    /// `None` when the caller sent no bytes.
    pub body: Option<Bytes>,
    /// Path plus optional query, e.g. `/api/cron?x=1`.
    pub path_and_query: String,
    /// Never sent over the wire by HTTP clients, but kept so the resolved
    /// target matches the caller's URL.
    pub fragment: Option<String>,
}

impl TriggerRequest {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            method,
            headers,
            body: (!body.is_empty()).then_some(body),
            path_and_query,
            fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = Some(fragment.into());
        self
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(p, _)| p)
    }

    pub fn query(&self) -> Option<&str> {
        self.path_and_query.split_once('?').map(|(_, q)| q)
    }

    /// Replace path, query and fragment of `base` with the trigger's.
    pub fn resolve_against(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_path(self.path());
        url.set_query(self.query());
        url.set_fragment(self.fragment.as_deref());
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(uri: &str) -> TriggerRequest {
        TriggerRequest::new(
            Method::GET,
            &uri.parse::<Uri>().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn empty_body_becomes_none() {
        assert!(trigger("/").body.is_none());
    }

    #[test]
    fn resolves_path_query_and_fragment() {
        let base = Url::parse("https://sbx-1.example.run").unwrap();
        let resolved = trigger("/api/cron?run=nightly&x=1")
            .with_fragment("top")
            .resolve_against(&base);
        assert_eq!(
            resolved.as_str(),
            "https://sbx-1.example.run/api/cron?run=nightly&x=1#top"
        );
    }

    #[test]
    fn base_path_is_replaced_not_joined() {
        let base = Url::parse("http://localhost:3000/ignored/").unwrap();
        let resolved = trigger("/jobs").resolve_against(&base);
        assert_eq!(resolved.as_str(), "http://localhost:3000/jobs");
    }

    #[test]
    fn reads_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer x".parse().unwrap());
        let req = TriggerRequest::new(Method::POST, &"/".parse().unwrap(), headers, Bytes::new());
        assert_eq!(req.authorization(), Some("Bearer x"));
    }
}
