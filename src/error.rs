//! Error types for Engine API calls.
//!
//! This module separates the ways a call can fail so callers can react to each
//! one programmatically: the network never produced a response, the API
//! reported a structured error, the API reported an error we could not
//! understand, or a page traversal ran out of items.

use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// The main error type for Engine API calls.
///
/// # Examples
///
/// ```no_run
/// use anxcloud::{Client, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder().token("secret").build()?;
///
/// match client.get::<serde_json::Value>("/api/vlan/v1/vlan.json").await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(Error::Response(api)) => {
///         eprintln!("Engine rejected the request with code {}", api.code);
///         for (field, problem) in &api.validation {
///             eprintln!("  {field}: {problem}");
///         }
///     }
///     Err(Error::ErrorBody { status, raw_response, .. }) => {
///         eprintln!("Unreadable error body (status {status}): {raw_response}");
///     }
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A network-level error occurred (connection failed, DNS lookup failed, etc.).
    ///
    /// No status code exists for this failure. Deadline expiry of a caller-imposed
    /// timeout inside the HTTP stack also surfaces here.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The API answered with a non-2xx status and a well-formed error body.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The API answered with a non-2xx status but the body was not the
    /// expected error document.
    #[error("Failed to decode error response (status {status}): {source}")]
    ErrorBody {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body that failed to decode
        raw_response: String,
        /// The JSON error raised while decoding
        #[source]
        source: serde_json::Error,
    },

    /// The server returned a non-2xx HTTP status code and error parsing is
    /// disabled on the client.
    #[error("HTTP error {status}: {raw_response}")]
    HttpError {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
    },

    /// Failed to deserialize a successful response body into the expected type.
    ///
    /// This error preserves both the raw response text and the serde error message.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// A page traversal visited every item without the predicate succeeding.
    ///
    /// This is the normal outcome of an exhaustive scan, not a failure of the API.
    #[error("Condition never met while iterating pages")]
    ConditionNeverMet,

    /// The request could not be signed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Invalid configuration was provided.
    ///
    /// This indicates a problem with how the client or request was configured,
    /// such as a missing credential or an invalid header value.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Response(err) => Some(err.status),
            Error::ErrorBody { status, .. }
            | Error::HttpError { status, .. }
            | Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Response(err) => Some(&err.raw_response),
            Error::ErrorBody { raw_response, .. }
            | Error::HttpError { raw_response, .. }
            | Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the structured API error, if the API reported one.
    pub fn as_response_error(&self) -> Option<&ResponseError> {
        match self {
            Error::Response(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` for the sentinel ending an exhaustive page scan.
    pub fn is_condition_never_met(&self) -> bool {
        matches!(self, Error::ConditionNeverMet)
    }
}

/// A specialized `Result` type for Engine API calls.
pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the Engine in a non-2xx response.
///
/// Besides the decoded error document, it keeps enough of the original
/// exchange (method, URL, status, headers, raw body) to inspect what was
/// sent and what came back.
#[derive(Debug, Clone)]
pub struct ResponseError {
    /// Error code from the response body; zero when absent.
    pub code: i64,
    /// Human readable message; empty when absent.
    pub message: String,
    /// Per-field validation failures.
    pub validation: BTreeMap<String, String>,
    /// Server-side debug source; empty when absent.
    pub debug_source: String,
    /// The HTTP status of the response.
    pub status: StatusCode,
    /// Method of the failed request.
    pub method: Method,
    /// URL of the failed request.
    pub url: Url,
    /// Response headers.
    pub headers: HeaderMap,
    /// The raw response body.
    pub raw_response: String,
}

impl ResponseError {
    /// Decodes an error document of the shape
    /// `{"error":{"code","message","validation"},"debug":{"source"}}`.
    ///
    /// Missing fields take their zero values; a body that is not such a JSON
    /// object is returned as the JSON error.
    pub fn from_body(
        method: Method,
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: &[u8],
    ) -> std::result::Result<Self, serde_json::Error> {
        let document: ErrorDocument = serde_json::from_slice(body)?;
        let detail = document.error.unwrap_or_default();
        let debug = document.debug.unwrap_or_default();

        Ok(Self {
            code: detail.code.unwrap_or_default(),
            message: detail.message.unwrap_or_default(),
            validation: detail.validation.unwrap_or_default(),
            debug_source: debug.source.unwrap_or_default(),
            status,
            method,
            url,
            headers,
            raw_response: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed with status {} (code {}): {}",
            self.method,
            self.url,
            self.status.as_u16(),
            self.code,
            self.message
        )?;
        if !self.validation.is_empty() {
            let fields: Vec<String> = self
                .validation
                .iter()
                .map(|(field, problem)| format!("{field}: {problem}"))
                .collect();
            write!(f, " [{}]", fields.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ResponseError {}

/// Classifies a non-2xx response body into [`Error::Response`] or [`Error::ErrorBody`].
pub(crate) fn classify_failure(
    method: Method,
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: &[u8],
) -> Error {
    match ResponseError::from_body(method, url, status, headers, body) {
        Ok(err) => Error::Response(err),
        Err(source) => Error::ErrorBody {
            status,
            raw_response: String::from_utf8_lossy(body).into_owned(),
            source,
        },
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDocument {
    error: Option<ErrorDetail>,
    debug: Option<DebugDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    code: Option<i64>,
    message: Option<String>,
    validation: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct DebugDetail {
    source: Option<String>,
}
