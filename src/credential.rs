//! Request authentication.
//!
//! A client authenticates with exactly one [`Credential`]: either a bearer
//! token or an HMAC-SHA512 signing key. The variant is chosen when the client
//! is built and cannot change afterwards.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE};
use http::{HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};
use std::fmt;
use std::time::SystemTime;

type HmacSha512 = Hmac<Sha512>;

/// Signed header names for requests without a body.
pub const BODYLESS_HEADERS: &str = "(request-target) host date";

/// Signed header names for requests carrying a body.
pub const BODY_HEADERS: &str = "(request-target) host date content-type content-length digest";

/// Algorithm name placed in the `Authorization` header.
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha512";

const DIGEST: HeaderName = HeaderName::from_static("digest");
const SIGNED_CONTENT_TYPE: &str = "application/json";

/// The credential attached to every request of a client.
#[derive(Debug, Clone)]
pub enum Credential {
    /// `Authorization: Token <token>`.
    Token(TokenCredential),
    /// `Authorization: Signature keyId=...` over an HMAC-SHA512 of selected headers.
    Signature(SignatureCredential),
}

impl Credential {
    /// Creates a bearer token credential.
    pub fn token(token: impl Into<String>) -> Self {
        Credential::Token(TokenCredential::new(token))
    }

    /// Creates a signing credential from a key id and its shared secret.
    pub fn signature(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Credential::Signature(SignatureCredential::new(key_id, secret))
    }

    /// Attaches the authentication headers to `request`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] when the token is not a valid header
    /// value and [`Error::Signing`] when the request cannot be signed.
    pub fn authorize(&self, request: &mut reqwest::Request) -> Result<()> {
        match self {
            Credential::Token(token) => token.authorize(request),
            Credential::Signature(key) => key.sign(request, SystemTime::now()),
        }
    }
}

/// A bearer token.
#[derive(Clone)]
pub struct TokenCredential {
    token: SecretString,
}

impl TokenCredential {
    /// Wraps a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Sets `Authorization: Token <token>` on the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the token contains characters not allowed in a header.
    pub fn authorize(&self, request: &mut reqwest::Request) -> Result<()> {
        let mut value = HeaderValue::try_from(format!("Token {}", self.token.expose_secret()))
            .map_err(|e| Error::ConfigurationError(format!("Invalid token: {}", e)))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

impl fmt::Debug for TokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCredential")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// An HMAC-SHA512 signing key pair.
///
/// The signature covers the request target, host and date, and for requests
/// with a body also the content type, length and a SHA-512 digest of the body.
#[derive(Clone)]
pub struct SignatureCredential {
    key_id: String,
    secret: SecretString,
}

impl SignatureCredential {
    /// Creates a signing key pair.
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// Returns the public key id.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signs `request` as if it were sent at `now`.
    ///
    /// Sets `Date`, and for non-empty bodies `Content-Type`, `Content-Length`
    /// and `Digest`, then the `Authorization` header. The body is read in place
    /// and stays available for sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] for streaming bodies and URLs without a host.
    pub fn sign(&self, request: &mut reqwest::Request, now: SystemTime) -> Result<()> {
        let payload = payload_of(request)?;
        let target = request_target(request);
        let host = host_of(request.url())?;
        let date = httpdate::fmt_http_date(now);

        let canonical = canonical_string(&target, &host, &date, payload.as_ref());
        let signature = BASE64.encode(self.mac(canonical.as_bytes())?.finalize().into_bytes());
        let signed_headers = if payload.is_some() {
            BODY_HEADERS
        } else {
            BODYLESS_HEADERS
        };

        let headers = request.headers_mut();
        headers.insert(DATE, header_value(&date)?);
        if let Some(payload) = &payload {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(SIGNED_CONTENT_TYPE));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(payload.length));
            headers.insert(DIGEST, header_value(&payload.digest)?);
        }

        let mut authorization = header_value(&format!(
            "Signature keyId=\"{}\",algorithm=\"{}\",signature=\"{}\",headers=\"{}\"",
            self.key_id, SIGNATURE_ALGORITHM, signature, signed_headers
        ))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        Ok(())
    }

    /// Checks the `Authorization` signature of a request signed with this key.
    ///
    /// Returns `Ok(false)` when the signature, digest or key id does not match.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] when the signature header is missing or malformed.
    pub fn verify(&self, request: &reqwest::Request) -> Result<bool> {
        let header = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Signing("missing Authorization header".to_string()))?;
        let params = parse_signature_header(header)?;

        if params.key_id != self.key_id || params.algorithm != SIGNATURE_ALGORITHM {
            return Ok(false);
        }

        let date = header_str(request, DATE)?;
        let target = request_target(request);
        let host = host_of(request.url())?;

        let payload = match params.headers.as_str() {
            BODYLESS_HEADERS => None,
            BODY_HEADERS => {
                let Some(actual) = payload_of(request)? else {
                    return Ok(false);
                };
                let claimed = header_str(request, DIGEST)?;
                let length = header_str(request, CONTENT_LENGTH)?;
                if claimed != actual.digest || length != actual.length.to_string() {
                    return Ok(false);
                }
                Some(actual)
            }
            other => {
                return Err(Error::Signing(format!("unsupported signed headers: {other}")));
            }
        };

        let canonical = canonical_string(&target, &host, date, payload.as_ref());
        let Ok(signature) = BASE64.decode(params.signature.as_bytes()) else {
            return Ok(false);
        };
        Ok(self
            .mac(canonical.as_bytes())?
            .verify_slice(&signature)
            .is_ok())
    }

    fn mac(&self, message: &[u8]) -> Result<HmacSha512> {
        let mut mac = HmacSha512::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| Error::Signing(e.to_string()))?;
        mac.update(message);
        Ok(mac)
    }
}

impl fmt::Debug for SignatureCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureCredential")
            .field("key_id", &self.key_id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Length and digest of a non-empty request body.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Payload {
    length: usize,
    digest: String,
}

/// Returns `SHA-512=<base64>` of `body`.
pub fn body_digest(body: &[u8]) -> String {
    format!("SHA-512={}", BASE64.encode(Sha512::digest(body)))
}

fn payload_of(request: &reqwest::Request) -> Result<Option<Payload>> {
    let Some(body) = request.body() else {
        return Ok(None);
    };
    let bytes = body
        .as_bytes()
        .ok_or_else(|| Error::Signing("streaming request bodies cannot be signed".to_string()))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Payload {
        length: bytes.len(),
        digest: body_digest(bytes),
    }))
}

fn request_target(request: &reqwest::Request) -> String {
    let url = request.url();
    let method = request.method().as_str().to_lowercase();
    match url.query() {
        Some(query) => format!("{} {}?{}", method, url.path(), query),
        None => format!("{} {}", method, url.path()),
    }
}

fn host_of(url: &url::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Signing(format!("URL has no host: {url}")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn canonical_string(target: &str, host: &str, date: &str, payload: Option<&Payload>) -> String {
    let mut lines = vec![
        format!("(request-target): {target}"),
        format!("host: {host}"),
        format!("date: {date}"),
    ];
    if let Some(payload) = payload {
        lines.push(format!("content-type: {SIGNED_CONTENT_TYPE}"));
        lines.push(format!("content-length: {}", payload.length));
        lines.push(format!("digest: {}", payload.digest));
    }
    lines.join("\n")
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value)
        .map_err(|e| Error::Signing(format!("Invalid header value: {}", e)))
}

fn header_str(request: &reqwest::Request, name: HeaderName) -> Result<&str> {
    request
        .headers()
        .get(&name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Signing(format!("missing {name} header")))
}

struct SignatureParams {
    key_id: String,
    algorithm: String,
    signature: String,
    headers: String,
}

fn parse_signature_header(header: &str) -> Result<SignatureParams> {
    let params = header
        .strip_prefix("Signature ")
        .ok_or_else(|| Error::Signing("not a Signature authorization".to_string()))?;

    let mut key_id = None;
    let mut algorithm = None;
    let mut signature = None;
    let mut headers = None;
    for pair in params.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Signing(format!("malformed signature parameter: {pair}")))?;
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "keyId" => key_id = Some(value),
            "algorithm" => algorithm = Some(value),
            "signature" => signature = Some(value),
            "headers" => headers = Some(value),
            _ => {}
        }
    }

    let missing = |name: &str| Error::Signing(format!("signature parameter {name} missing"));
    Ok(SignatureParams {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        algorithm: algorithm.ok_or_else(|| missing("algorithm"))?,
        signature: signature.ok_or_else(|| missing("signature"))?,
        headers: headers.ok_or_else(|| missing("headers"))?,
    })
}
