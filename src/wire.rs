//! Wire-level request and response tracing.
//!
//! Every record goes to the [`WIRE_TARGET`] target at `TRACE` level, so it can
//! be switched on independently of the rest of the crate's logs, e.g. with
//! `RUST_LOG=anxcloud::wire=trace`. Nothing is read or rendered unless that
//! target is enabled.
//!
//! Secrets never reach a subscriber: the request `Authorization` header and
//! the response `Set-Cookie` header are replaced by [`REDACTED`].

use bytes::Bytes;
use http::header::{AUTHORIZATION, SET_COOKIE};
use http::{HeaderMap, HeaderName};
use http_body_util::BodyExt;
use tracing::Level;

/// Target of all wire-level records.
pub const WIRE_TARGET: &str = "anxcloud::wire";

/// Replacement for redacted header values.
pub const REDACTED: &str = "[REDACTED]";

/// Returns `true` if a subscriber wants wire-level records.
pub fn enabled() -> bool {
    tracing::enabled!(target: WIRE_TARGET, Level::TRACE)
}

/// Records an outgoing request. `None` is ignored.
pub fn log_request(request: Option<&reqwest::Request>) {
    let Some(request) = request else {
        return;
    };
    if !enabled() {
        return;
    }

    let body = request.body().map(|body| match body.as_bytes() {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "<streaming body>".to_string(),
    });

    tracing::trace!(
        target: WIRE_TARGET,
        method = %request.method(),
        url = %request.url(),
        headers = %render_headers(request.headers(), &AUTHORIZATION),
        body = body.as_deref().unwrap_or_default(),
        "Outgoing request"
    );
}

/// Records a response and hands it back with its body intact.
///
/// The body is buffered and replaced by a fresh body over the same bytes. If
/// reading it fails, a warning is logged and the returned response yields the
/// same failure when the caller reads it.
pub async fn log_response(response: reqwest::Response) -> reqwest::Response {
    if !enabled() {
        return response;
    }

    let status = response.status();
    let headers = render_headers(response.headers(), &SET_COOKIE);
    let (parts, body) = http::Response::<reqwest::Body>::from(response).into_parts();

    let (captured, body) = match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (Some(text), reqwest::Body::from(bytes))
        }
        Err(err) => {
            tracing::warn!(
                target: WIRE_TARGET,
                error = %err,
                "Could not capture response body for logging"
            );
            (None, failed_body(err))
        }
    };

    tracing::trace!(
        target: WIRE_TARGET,
        status = status.as_u16(),
        headers = %headers,
        body = captured.as_deref().unwrap_or_default(),
        "Incoming response"
    );

    reqwest::Response::from(http::Response::from_parts(parts, body))
}

/// Records a dispatch that produced no response.
pub fn log_failure(error: &reqwest::Error) {
    tracing::trace!(target: WIRE_TARGET, error = %error, "Request failed without response");
}

/// Renders headers deterministically, redacting the values of `redact`.
///
/// Names are sorted; the values of one header are sorted and bracketed:
/// `{accept: [application/json], x-multi: [a, b]}`.
pub fn render_headers(headers: &HeaderMap, redact: &HeaderName) -> String {
    let mut names: Vec<&HeaderName> = headers.keys().collect();
    names.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let rendered: Vec<String> = names
        .into_iter()
        .map(|name| {
            let mut values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|value| {
                    if name == redact {
                        REDACTED.to_string()
                    } else {
                        String::from_utf8_lossy(value.as_bytes()).into_owned()
                    }
                })
                .collect();
            values.sort();
            format!("{}: [{}]", name, values.join(", "))
        })
        .collect();

    format!("{{{}}}", rendered.join(", "))
}

fn failed_body(err: reqwest::Error) -> reqwest::Body {
    reqwest::Body::wrap_stream(futures::stream::once(async move {
        Err::<Bytes, reqwest::Error>(err)
    }))
}
