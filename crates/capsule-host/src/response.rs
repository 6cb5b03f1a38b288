//! The `Response` value handed to scripts.
//!
//! A [`ScriptResponse`] is always constructed, whatever happened to the
//! request. Failures are carried in its `error` field rather than raised,
//! so scripts handle success and failure with one branch structure.

use rhai::{Dynamic, Map};

use crate::http_outbound::{self, HttpError, HttpResponse};

/// Script-facing view of an HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptResponse {
    /// Final URL after redirects. Empty if no response arrived.
    pub url: String,
    /// Body text. Empty if no response arrived.
    pub body: String,
    /// HTTP status code, `0` if no response arrived.
    pub status: u16,
    /// The URL the script asked for.
    pub request_url: String,
    /// Header name to value; repeated headers are joined by `", "`.
    pub headers: Vec<(String, String)>,
    /// Failure description, if any.
    pub error: Option<String>,
}

impl ScriptResponse {
    /// Build the script value for the outcome of a request.
    ///
    /// Responses with a non-2xx status keep their status and body and also
    /// carry the validation message as `error`.
    pub fn from_outcome(request_url: &str, outcome: Result<HttpResponse, HttpError>) -> Self {
        match outcome {
            Ok(response) => {
                let error = http_outbound::validate(&response)
                    .err()
                    .map(|e| e.to_string());
                Self {
                    body: response.text(),
                    url: response.url,
                    status: response.status,
                    request_url: request_url.to_string(),
                    headers: response
                        .headers
                        .into_iter()
                        .map(|(name, values)| (name, values.join(", ")))
                        .collect(),
                    error,
                }
            }
            Err(e) => Self::error(request_url, e.to_string()),
        }
    }

    /// A response carrying only a failure.
    pub fn error(request_url: &str, message: impl Into<String>) -> Self {
        Self {
            request_url: request_url.to_string(),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Returns `true` when no error was recorded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// `error` as a script value: `()` or the message.
    pub fn error_value(&self) -> Dynamic {
        self.error
            .as_ref()
            .map_or(Dynamic::UNIT, |message| Dynamic::from(message.clone()))
    }

    /// Headers as a script object map.
    pub fn headers_map(&self) -> Map {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str().into(), Dynamic::from(value.clone())))
            .collect()
    }

    /// Plain structured form of the response.
    pub fn to_map(&self) -> Map {
        let mut map = Map::new();
        map.insert("url".into(), Dynamic::from(self.url.clone()));
        map.insert("body".into(), Dynamic::from(self.body.clone()));
        map.insert("status".into(), Dynamic::from(i64::from(self.status)));
        map.insert("request_url".into(), Dynamic::from(self.request_url.clone()));
        map.insert("headers".into(), Dynamic::from_map(self.headers_map()));
        map.insert("error".into(), self.error_value());
        map
    }
}

impl std::fmt::Display for ScriptResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(error) => write!(f, "Response({} error: {error})", self.request_url),
            None => write!(f, "Response({} {})", self.status, self.url),
        }
    }
}
