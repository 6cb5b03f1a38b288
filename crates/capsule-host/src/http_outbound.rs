//! Outbound HTTP for hosted programs.
//!
//! [`FetchService`] is the only way a script reaches the network. It checks
//! each request against the host [`Permissions`], optionally answers bodyless
//! requests from the durable cache tier, and counts every network
//! round-trip. The same service is used by the load pipeline to fetch
//! program sources from the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use reqwest::blocking::Client;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::Permissions;
use capsule_common::{HostFunctionError, HttpConfig, RuntimeError};
use capsule_core::{DurableEntry, Headers, ResponseMeta, ScriptCache};

/// Content type applied to bodies encoded from a key/value mapping.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// HTTP method enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl HttpMethod {
    /// Parse a method name, ignoring case.
    pub fn parse(method: &str) -> Result<Self, HttpError> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(HttpError::UnsupportedMethod {
                method: method.to_string(),
            }),
        }
    }

    /// Methods whose data travels in the request body.
    pub fn has_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }

    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Head => reqwest::Method::HEAD,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Data supplied with a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestData {
    /// No data.
    #[default]
    None,
    /// Key/value pairs, form-encoded.
    Form(Vec<(String, String)>),
    /// A literal string used as-is.
    Raw(String),
}

impl RequestData {
    fn encode(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Form(pairs) => Some(
                form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish(),
            ),
            Self::Raw(raw) => Some(raw.clone()),
        }
        .filter(|encoded| !encoded.is_empty())
    }
}

/// Per-request options recognized from scripts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestOptions {
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Consult and populate the durable cache (bodyless methods only).
    pub cache: bool,
}

/// A fully built outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Target URI, query string included.
    pub uri: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Use the durable cache for this request.
    pub cache: bool,
}

impl HttpRequest {
    /// A plain GET.
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            uri: uri.into(),
            headers: Vec::new(),
            body: None,
            cache: false,
        }
    }

    /// Build a request the way scripts describe one.
    ///
    /// For bodyless methods the encoded data is appended to the query
    /// string; otherwise it becomes the body, with a form content type when
    /// it came from a mapping and no content type was given.
    pub fn from_script(method: HttpMethod, url: &str, data: &RequestData, options: RequestOptions) -> Self {
        let encoded = data.encode();
        let mut uri = url.to_string();
        let mut headers = options.headers;
        let mut body = None;

        if let Some(encoded) = encoded {
            if method.has_body() {
                if matches!(data, RequestData::Form(_))
                    && !headers
                        .iter()
                        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                {
                    headers.push(("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string()));
                }
                body = Some(encoded.into_bytes());
            } else {
                let sep = if uri.contains('?') { '&' } else { '?' };
                uri.push(sep);
                uri.push_str(&encoded);
            }
        }

        Self {
            method,
            uri,
            headers,
            body,
            cache: options.cache && !method.has_body(),
        }
    }
}

/// A response, from the network or from the durable cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: Headers,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Cache metadata for this response.
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
        }
    }

    /// Body decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns `true` for a status in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<DurableEntry> for HttpResponse {
    fn from(entry: DurableEntry) -> Self {
        Self {
            url: entry.url,
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
        }
    }
}

/// Outbound request failures. None of these carry an HTTP status; a
/// response with a bad status is still a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// The host policy refused the destination.
    #[error("Permission denied: HTTP access to {url}")]
    PermissionDenied { url: String },

    /// The method is not one the service knows.
    #[error("Unsupported HTTP method '{method}'")]
    UnsupportedMethod { method: String },

    /// Connecting, sending, or reading failed.
    #[error("{message}")]
    Transport { url: String, message: String },
}

impl HttpError {
    fn transport(url: &str, err: &reqwest::Error) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<HttpError> for RuntimeError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::PermissionDenied { url } => {
                RuntimeError::HostFunction(HostFunctionError::PermissionDenied {
                    resource: format!("HTTP access to {url}"),
                })
            }
            HttpError::UnsupportedMethod { method } => {
                RuntimeError::HostFunction(HostFunctionError::InvalidArgument {
                    reason: format!("unsupported HTTP method '{method}'"),
                })
            }
            HttpError::Transport { url, message } => RuntimeError::transport(url, message),
        }
    }
}

/// Reject any status outside `[200, 300)`, carrying the body as the message.
pub fn validate(response: &HttpResponse) -> Result<(), HostFunctionError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(HostFunctionError::HttpStatus {
            status: response.status,
            body: response.text(),
        })
    }
}

/// The HTTP capability.
///
/// Clones share the client, the cache, and the request counter.
#[derive(Debug, Clone)]
pub struct FetchService {
    /// HTTP client (shared, connection pooled).
    client: Client,

    /// Cache consulted by `cache: true` requests.
    cache: Arc<ScriptCache>,

    /// Destinations scripts may reach.
    permissions: Permissions,

    /// Network round-trips performed.
    request_count: Arc<AtomicU32>,
}

impl FetchService {
    /// Create a service from configuration.
    pub fn new(config: &HttpConfig, cache: Arc<ScriptCache>) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, cache, Permissions::from_config(config)))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client, cache: Arc<ScriptCache>, permissions: Permissions) -> Self {
        Self {
            client,
            cache,
            permissions,
            request_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The cache shared with this service.
    pub fn cache(&self) -> &Arc<ScriptCache> {
        &self.cache
    }

    /// The host policy.
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Perform a script-initiated request.
    ///
    /// The destination is checked against the host policy first. With
    /// `cache` set, a durable entry for the final URL answers the request
    /// without touching the network, and a successful network response is
    /// written back.
    pub fn send_request(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.permissions.check(&request.uri)?;

        if request.cache {
            if let Ok(entry) = self.cache.cached_entry(&request.uri) {
                debug!(uri = %request.uri, "Cached response");
                return Ok(entry.into());
            }
        }

        let response = self.fetch(request)?;

        if request.cache && response.is_success() {
            if let Err(e) = self.cache.cache_data(&request.uri, &response.body, &response.meta()) {
                debug!(uri = %request.uri, error = %e, "Failed to cache response");
            }
        }

        Ok(response)
    }

    /// Perform one network round-trip, bypassing policy and cache.
    pub fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);

        debug!(
            method = request.method.as_str(),
            uri = %request.uri,
            "Executing HTTP request"
        );

        let mut req_builder = self
            .client
            .request(request.method.to_reqwest(), &request.uri);

        for (key, value) in &request.headers {
            req_builder = req_builder.header(key, value);
        }

        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().map_err(|e| {
            warn!(uri = %request.uri, error = %e, "HTTP request failed");
            HttpError::transport(&request.uri, &e)
        })?;

        let status = response.status().as_u16();
        let url = response.url().to_string();

        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let body = response
            .bytes()
            .map_err(|e| HttpError::transport(&request.uri, &e))?
            .to_vec();

        info!(
            uri = %request.uri,
            status = status,
            body_size = body.len(),
            "HTTP request completed"
        );

        Ok(HttpResponse {
            url,
            status,
            headers,
            body,
        })
    }

    /// Convenience GET straight to the network.
    pub fn get(&self, uri: &str) -> Result<HttpResponse, HttpError> {
        self.fetch(&HttpRequest::get(uri))
    }

    /// Get the number of network round-trips made.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }
}
