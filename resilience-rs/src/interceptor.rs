//! # Call Interception
//!
//! Explicit decorator that routes outbound HTTP calls through the
//! [`RetryExecutor`]. Call sites opt in by sending through an
//! [`InterceptingClient`] instead of the raw transport.
//!
//! For each request the client derives a stable operation id
//! (`"<VERB> <path>"`), picks a policy from the destination with
//! [`RouteRules`], and turns non-2xx responses into [`CallError::Status`]
//! so the classifier can see them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::executor::{OperationContext, RetryExecutor};
use crate::policy::{API_POLICY, DATABASE_POLICY, NETWORK_POLICY};
use crate::types::{CallError, Error, Result};

/// Default timeout of the reqwest client, above every built-in policy timeout
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(120);

/// A fully resolved request handed to the transport
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// A response as returned by the transport
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl CallResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Sends a single request, with no retries of its own
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> std::result::Result<CallResponse, CallError>;
}

/// [`Transport`] backed by a `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Builds a client with [`DEFAULT_TRANSPORT_TIMEOUT`]
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TRANSPORT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// Wraps an existing client; `timeout` is only used for error reporting
    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn map_error(&self, err: reqwest::Error) -> CallError {
        if err.is_timeout() {
            CallError::Timeout(self.timeout)
        } else if err.is_builder() {
            CallError::invalid_request(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            CallError::connectivity(err.to_string())
        } else if err.is_redirect() {
            CallError::connectivity(format!("Too many redirects: {}", err))
        } else {
            CallError::other(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> std::result::Result<CallResponse, CallError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        Ok(CallResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// An outbound call, before routing
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub method: Method,
    /// Absolute URL, or a path relative to the client's base URL
    pub target: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Bypass the executor; for calls whose caller presents its own cancel control
    pub skip_retry: bool,
    /// Explicit policy, overriding the route rules
    pub policy: Option<String>,
    /// Human readable name for notifications
    pub label: Option<String>,
}

impl CallRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
            skip_retry: false,
            policy: None,
            label: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Serializes `body` as the JSON payload
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Maps a destination substring to a policy name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub policy: String,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            policy: policy.into(),
        }
    }
}

/// Ordered route rules; the first rule whose pattern occurs in the
/// destination wins, anything unmatched uses the network policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteRules(Vec<RouteRule>);

impl Default for RouteRules {
    fn default() -> Self {
        let api = [
            "themoviedb.org",
            "thetvdb.com",
            "omdbapi.com",
            "tvmaze.com",
            "/api/analyze-series",
        ];
        let database = ["/api/load-database", "/api/scan", "/api/get-series"];

        let rules = api
            .iter()
            .map(|pattern| RouteRule::new(*pattern, API_POLICY))
            .chain(
                database
                    .iter()
                    .map(|pattern| RouteRule::new(*pattern, DATABASE_POLICY)),
            )
            .collect();
        Self(rules)
    }
}

impl RouteRules {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self(rules)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.0
    }

    /// Policy for a destination URL
    pub fn policy_for(&self, destination: &str) -> &str {
        self.0
            .iter()
            .find(|rule| destination.contains(&rule.pattern))
            .map(|rule| rule.policy.as_str())
            .unwrap_or(NETWORK_POLICY)
    }
}

/// Derives the operation id: `"<VERB> <path>"` for paths under the base
/// URL, `"<VERB> <host>[:<port>]<path>"` for absolute URLs. A port is only
/// included when it is not the scheme's default. Queries are dropped.
pub fn operation_id(method: &Method, url: &Url, relative: bool) -> String {
    if relative {
        return format!("{} {}", method, url.path());
    }

    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{} {}:{}{}", method, host, port, url.path()),
        None => format!("{} {}{}", method, host, url.path()),
    }
}

/// Routes requests through the retry executor
pub struct InterceptingClient<T> {
    transport: Arc<T>,
    executor: RetryExecutor,
    routes: RouteRules,
    base_url: Option<Url>,
}

impl<T> fmt::Debug for InterceptingClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptingClient")
            .field("routes", &self.routes)
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .finish()
    }
}

impl<T> Clone for InterceptingClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            executor: self.executor.clone(),
            routes: self.routes.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

impl<T: Transport> InterceptingClient<T> {
    pub fn new(transport: T, executor: RetryExecutor) -> Self {
        Self {
            transport: Arc::new(transport),
            executor,
            routes: RouteRules::default(),
            base_url: None,
        }
    }

    pub fn with_routes(mut self, routes: RouteRules) -> Self {
        self.routes = routes;
        self
    }

    /// Base for relative targets such as `/api/get-series`
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Resolves the URL, operation id and policy of a request
    pub fn route(&self, request: &CallRequest) -> std::result::Result<(Url, OperationContext), CallError> {
        let (url, relative) = match Url::parse(&request.target) {
            Ok(url) => (url, false),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_ref().ok_or_else(|| {
                    CallError::invalid_request(format!(
                        "relative target '{}' without a base URL",
                        request.target
                    ))
                })?;
                let url = base
                    .join(&request.target)
                    .map_err(|e| CallError::invalid_request(e.to_string()))?;
                (url, true)
            }
            Err(e) => return Err(CallError::invalid_request(e.to_string())),
        };

        let policy = request
            .policy
            .clone()
            .unwrap_or_else(|| self.routes.policy_for(url.as_str()).to_string());
        let mut context = OperationContext::new(operation_id(&request.method, &url, relative), policy);
        context.label = request.label.clone();

        Ok((url, context))
    }

    /// Sends a request under its routed policy
    pub async fn send(&self, request: CallRequest) -> Result<CallResponse> {
        self.send_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`send`](Self::send), abortable through `cancel`
    pub async fn send_with_cancel(
        &self,
        request: CallRequest,
        cancel: &CancellationToken,
    ) -> Result<CallResponse> {
        let (url, context) = self.route(&request).map_err(|source| Error::Client {
            operation_id: format!("{} {}", request.method, request.target),
            attempts: 0,
            source,
        })?;

        let prepared = TransportRequest {
            method: request.method,
            url,
            headers: request.headers,
            body: request.body,
        };

        if request.skip_retry {
            debug!(operation_id = %context.operation_id, "Sending without retry");
            return self
                .dispatch(prepared)
                .await
                .map_err(|source| Error::Unretried {
                    operation_id: context.operation_id,
                    source,
                });
        }

        self.executor
            .execute_with_cancel(&context, cancel, || self.dispatch(prepared.clone()))
            .await
    }

    async fn dispatch(&self, request: TransportRequest) -> std::result::Result<CallResponse, CallError> {
        let response = self.transport.send(request).await?;
        if response.is_success() {
            return Ok(response);
        }

        let reason = StatusCode::from_u16(response.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("unexpected status");
        Err(CallError::status(response.status, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let routes = RouteRules::default();

        assert_eq!(
            routes.policy_for("https://api.themoviedb.org/3/search/tv?query=x"),
            API_POLICY
        );
        assert_eq!(routes.policy_for("http://localhost:8080/api/scan"), DATABASE_POLICY);
        assert_eq!(
            routes.policy_for("http://localhost:8080/api/analyze-series"),
            API_POLICY
        );
        assert_eq!(routes.policy_for("http://localhost:8080/api/health"), NETWORK_POLICY);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let routes = RouteRules::new(vec![
            RouteRule::new("/api/", "network"),
            RouteRule::new("/api/scan", "database"),
        ]);
        assert_eq!(routes.policy_for("http://host/api/scan"), "network");
    }

    #[test]
    fn test_operation_id_strips_query() {
        let url = Url::parse("http://localhost:8080/api/get-series?refresh=1").unwrap();
        assert_eq!(
            operation_id(&Method::POST, &url, true),
            "POST /api/get-series"
        );

        let url = Url::parse("https://api.tvmaze.com/shows/1?embed=episodes").unwrap();
        assert_eq!(
            operation_id(&Method::GET, &url, false),
            "GET api.tvmaze.com/shows/1"
        );
    }

    #[test]
    fn test_operation_id_keeps_explicit_port() {
        let backend = Url::parse("http://localhost:3000/status").unwrap();
        let other = Url::parse("http://localhost:8080/status").unwrap();
        assert_eq!(operation_id(&Method::GET, &backend, false), "GET localhost:3000/status");
        assert_eq!(operation_id(&Method::GET, &other, false), "GET localhost:8080/status");

        let default_port = Url::parse("https://api.tvmaze.com:443/shows").unwrap();
        assert_eq!(
            operation_id(&Method::GET, &default_port, false),
            "GET api.tvmaze.com/shows"
        );
    }

    #[test]
    fn test_response_helpers() {
        let response = CallResponse {
            status: 204,
            headers: HeaderMap::new(),
            body: b"[1,2]".to_vec(),
        };
        assert!(response.is_success());
        assert_eq!(response.json::<Vec<u32>>().unwrap(), vec![1, 2]);
    }
}
