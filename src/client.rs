//! Authenticated HTTP transport.
//!
//! The [`Client`] turns a caller-built request into a signed, logged and
//! classified response. Resource wrappers either build a `reqwest::Request`
//! and hand it to [`Client::execute`], or use the typed helpers
//! ([`Client::call`], [`Client::get`], ...) which decode JSON bodies.
//!
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    credential::Credential,
    error::classify_failure,
    execute::Execute,
    metadata::RequestMetadata,
    metrics::{Instrumented, MetricReceiver},
    wire, Error, Response, Result,
};
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::HeaderValue;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Base URL used when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://engine.anexia-it.com";

const USER_AGENT_PRODUCT: &str = "anxcloud";

/// Returns the default user agent, `anxcloud/<version> (<os>)`.
pub fn default_user_agent(version: &str) -> String {
    format!(
        "{}/{} ({})",
        USER_AGENT_PRODUCT,
        version,
        std::env::consts::OS
    )
}

/// An authenticated client for the Engine API.
///
/// The client is cheap to clone and designed to be shared. Its configuration
/// is fixed at [`ClientBuilder::build`] and never changes afterwards.
///
/// # Examples
///
/// ```no_run
/// use anxcloud::{Client, Response};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize)]
/// struct CreateVlan {
///     location: String,
///     vm_provisioning: bool,
/// }
///
/// #[derive(Deserialize)]
/// struct Vlan {
///     identifier: String,
/// }
///
/// # async fn example() -> Result<(), anxcloud::Error> {
/// let client = Client::builder()
///     .token("my-api-token")
///     .build()?;
///
/// let request = CreateVlan {
///     location: "52b5f6b2fd3a4a7eaaedf1a7c019e9ea".to_string(),
///     vm_provisioning: true,
/// };
/// let created: Response<Vlan> = client.post("/api/vlan/v1/vlan.json", &request).await?;
/// println!("Created VLAN {}", created.data.identifier);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    credential: Credential,
    executor: Arc<dyn Execute>,
    user_agent: HeaderValue,
    parse_engine_errors: bool,
    wire_logging: bool,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Returns the base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Returns the `User-Agent` sent with every request.
    pub fn user_agent(&self) -> &str {
        self.inner.user_agent.to_str().unwrap_or_default()
    }

    /// Builds a request for `metadata` relative to the base URL.
    ///
    /// Query parameters are appended in key order. A body is serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailed`] if the body cannot be serialized.
    pub fn request<Req>(
        &self,
        metadata: &RequestMetadata,
        body: Option<&Req>,
    ) -> Result<reqwest::Request>
    where
        Req: Serialize + ?Sized,
    {
        let mut url = self.inner.base_url.clone();
        url.set_path(&metadata.path);

        let query: BTreeMap<&String, &String> = metadata.query_params.iter().collect();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let mut request = reqwest::Request::new(metadata.method.clone(), url);
        for (name, value) in &metadata.headers {
            request.headers_mut().insert(name, value.clone());
        }

        if let Some(body) = body {
            let json =
                serde_json::to_vec(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            *request.body_mut() = Some(json.into());
        }

        Ok(request)
    }

    /// Sends a request and classifies the response.
    ///
    /// The credential and user agent are attached, the exchange is traced on
    /// the wire target, and the request goes through the configured executor
    /// (wrapped for metrics if a receiver was configured).
    ///
    /// When error parsing is enabled (the default), a status outside
    /// `200..300` is decoded into [`Error::Response`], or [`Error::ErrorBody`]
    /// if the body is not an error document. Otherwise the live response is
    /// returned with its body unread.
    ///
    /// Redirects are left to the underlying executor; the client does not
    /// inspect or re-sign redirected requests. No timeout is applied here:
    /// wrap the future in `tokio::time::timeout` or configure one on the
    /// `reqwest::Client` passed to [`ClientBuilder::http_client`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when no response was obtained, plus the
    /// classification errors above.
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        self.inner.credential.authorize(&mut request)?;
        request
            .headers_mut()
            .insert(USER_AGENT, self.inner.user_agent.clone());

        let method = request.method().clone();
        let url = request.url().clone();

        tracing::debug!(method = %method, url = %url, "Executing HTTP request");
        if self.inner.wire_logging {
            wire::log_request(Some(&request));
        }

        let start = Instant::now();
        let response = match self.inner.executor.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                if self.inner.wire_logging {
                    wire::log_failure(&e);
                }
                tracing::warn!(error = %e, method = %method, url = %url, "Request failed");
                return Err(Error::Network(e));
            }
        };
        let response = if self.inner.wire_logging {
            wire::log_response(response).await
        } else {
            response
        };

        let status = response.status();
        tracing::info!(
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis(),
            "Received HTTP response"
        );

        if !self.inner.parse_engine_errors || status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let error = classify_failure(method, url, status, headers, &body);

        if status.is_client_error() {
            tracing::error!(status = status.as_u16(), error = %error, "Client error (4xx)");
        } else {
            tracing::warn!(status = status.as_u16(), error = %error, "Server error");
        }

        Err(error)
    }

    /// Makes a typed HTTP request.
    ///
    /// Builds the request from `metadata`, runs it through [`Client::execute`]
    /// and decodes the JSON body. An empty body decodes as JSON `null`, so
    /// `()` works for endpoints answering without content.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use anxcloud::{Client, metadata::RequestMetadata};
    /// use http::Method;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Zone { name: String }
    ///
    /// # async fn example() -> Result<(), anxcloud::Error> {
    /// let client = Client::builder().token("secret").build()?;
    ///
    /// let metadata = RequestMetadata::new(Method::GET, "/api/clouddns/v1/zone.json")
    ///     .with_query_param("search", "example");
    /// let zones = client.call::<(), Vec<Zone>>(metadata, None).await?;
    /// println!("Found {} zones", zones.data.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<Req, Res>(
        &self,
        metadata: RequestMetadata,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let start_time = Instant::now();
        let request = self.request(&metadata, body)?;

        let response = self.execute(request).await.inspect_err(|e| {
            tracing::warn!(
                error = %e,
                method = %metadata.method,
                path = %metadata.path,
                "Request failed"
            );
        })?;

        self.parse_response(response, start_time).await
    }

    async fn parse_response<Res>(
        &self,
        response: reqwest::Response,
        start_time: Instant,
    ) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let status = response.status();
        let headers = response.headers().clone();

        // Only reachable with error parsing disabled.
        if !status.is_success() {
            let raw_response = response.text().await.unwrap_or_default();
            return Err(Error::HttpError {
                status,
                raw_response,
                headers,
            });
        }

        let raw_body = response.text().await?;
        let json = if raw_body.trim().is_empty() {
            "null"
        } else {
            raw_body.as_str()
        };

        match serde_json::from_str::<Res>(json) {
            Ok(data) => Ok(Response::new(
                data,
                raw_body,
                status,
                headers,
                latency(start_time),
            )),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    raw_response = %raw_body,
                    "Failed to deserialize response"
                );

                Err(Error::DeserializationFailed {
                    raw_response: raw_body,
                    serde_error: e.to_string(),
                    status,
                })
            }
        }
    }

    /// Makes a GET request to the specified path.
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(http::Method::GET, path);
        self.call::<(), Res>(metadata, None).await
    }

    /// Makes a POST request to the specified path with a JSON body.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(http::Method::POST, path);
        self.call(metadata, Some(body)).await
    }

    /// Makes a PUT request to the specified path with a JSON body.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(http::Method::PUT, path);
        self.call(metadata, Some(body)).await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(http::Method::DELETE, path);
        self.call::<(), Res>(metadata, None).await
    }

    /// Makes a PATCH request to the specified path with a JSON body.
    pub async fn patch<Req, Res>(
        &self,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(http::Method::PATCH, path);
        self.call(metadata, Some(body)).await
    }
}

fn latency(start_time: Instant) -> Duration {
    start_time.elapsed()
}

/// Builder for configuring and creating a [`Client`].
///
/// Exactly one credential is kept: setting a token after a signing key (or the
/// other way round) replaces it.
///
/// # Examples
///
/// ```no_run
/// use anxcloud::{ClientBuilder, LabelName, MetricName, MetricReceiver};
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), anxcloud::Error> {
/// let receiver: MetricReceiver = Arc::new(
///     |metrics: HashMap<MetricName, f64>, labels: HashMap<LabelName, String>| {
///         println!("{metrics:?} {labels:?}");
///     },
/// );
///
/// let client = ClientBuilder::new()
///     .base_url("https://engine.example.com")?
///     .signature("key-id", "shared-secret")
///     .version("1.4.2")
///     .metric_receiver(receiver)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    credential: Option<Credential>,
    executor: Option<Arc<dyn Execute>>,
    user_agent: Option<String>,
    version: Option<String>,
    parse_engine_errors: bool,
    wire_logging: bool,
    metric_receiver: Option<MetricReceiver>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            credential: None,
            executor: None,
            user_agent: None,
            version: None,
            parse_engine_errors: true,
            wire_logging: true,
            metric_receiver: None,
        }
    }

    /// Sets the base URL for all requests. Defaults to [`DEFAULT_BASE_URL`].
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Authenticates with `Authorization: Token <token>`.
    pub fn token(self, token: impl Into<String>) -> Self {
        self.credential(Credential::token(token))
    }

    /// Authenticates by signing every request with an HMAC-SHA512 key.
    pub fn signature(self, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credential(Credential::signature(key_id, secret))
    }

    /// Sets the credential, replacing any previously configured one.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Uses `client` to perform the HTTP exchanges.
    pub fn http_client(self, client: reqwest::Client) -> Self {
        self.executor(Arc::new(client))
    }

    /// Uses a custom execution primitive to perform the HTTP exchanges.
    pub fn executor(mut self, executor: Arc<dyn Execute>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Overrides the `User-Agent` header entirely.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the version reported in the default user agent.
    ///
    /// Defaults to this crate's version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Enables or disables decoding of non-2xx responses into errors.
    ///
    /// Enabled by default. When disabled, [`Client::execute`] returns every
    /// response as-is.
    pub fn parse_engine_errors(mut self, enabled: bool) -> Self {
        self.parse_engine_errors = enabled;
        self
    }

    /// Enables or disables wire-level tracing.
    ///
    /// Enabled by default; records are only produced when a subscriber
    /// enables the `anxcloud::wire` target at `TRACE`.
    pub fn wire_logging(mut self, enabled: bool) -> Self {
        self.wire_logging = enabled;
        self
    }

    /// Reports per-request metric events to `receiver`.
    pub fn metric_receiver(mut self, receiver: MetricReceiver) -> Self {
        self.metric_receiver = Some(receiver);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no credential was provided, the user agent is not
    /// a valid header value, or the default HTTP client cannot be created.
    pub fn build(self) -> Result<Client> {
        let credential = self
            .credential
            .ok_or_else(|| Error::ConfigurationError("A credential is required".to_string()))?;

        let base_url = match self.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL)?,
        };

        let executor: Arc<dyn Execute> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(reqwest::Client::builder().build().map_err(|e| {
                Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
            })?),
        };
        let executor: Arc<dyn Execute> = match self.metric_receiver {
            Some(receiver) => Arc::new(Instrumented::new(executor, receiver)),
            None => executor,
        };

        let user_agent = self.user_agent.unwrap_or_else(|| {
            default_user_agent(self.version.as_deref().unwrap_or(env!("CARGO_PKG_VERSION")))
        });
        let user_agent = HeaderValue::try_from(user_agent)
            .map_err(|e| Error::ConfigurationError(format!("Invalid user agent: {}", e)))?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                credential,
                executor,
                user_agent,
                parse_engine_errors: self.parse_engine_errors,
                wire_logging: self.wire_logging,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn build_requires_credential() {
        let result = Client::builder().build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn defaults_to_engine_base_url_and_crate_version() {
        let client = Client::builder().token("T").build().unwrap();

        assert_eq!(client.base_url().as_str(), "https://engine.anexia-it.com/");
        assert_eq!(
            client.user_agent(),
            format!("anxcloud/{} ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS)
        );
    }

    #[test]
    fn version_and_user_agent_overrides() {
        let versioned = Client::builder().token("T").version("9.9.9").build().unwrap();
        assert!(versioned.user_agent().starts_with("anxcloud/9.9.9 ("));

        let custom = Client::builder()
            .token("T")
            .version("9.9.9")
            .user_agent("my-tool/1.0")
            .build()
            .unwrap();
        assert_eq!(custom.user_agent(), "my-tool/1.0");
    }

    #[test]
    fn invalid_user_agent_is_rejected() {
        let result = Client::builder().token("T").user_agent("bad\nagent").build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn later_credential_replaces_earlier() {
        let builder = Client::builder().signature("id", "secret").token("T");
        assert!(matches!(builder.credential, Some(Credential::Token(_))));
    }

    #[test]
    fn request_resolves_path_query_and_body() {
        let client = Client::builder()
            .base_url("https://engine.example.com")
            .unwrap()
            .token("T")
            .build()
            .unwrap();
        let metadata = RequestMetadata::new(Method::POST, "/api/vlan/v1/vlan.json")
            .with_query_param("limit", "20")
            .with_query_param("page", "2");

        let request = client
            .request(&metadata, Some(&serde_json::json!({"name": "v"})))
            .unwrap();

        assert_eq!(
            request.url().as_str(),
            "https://engine.example.com/api/vlan/v1/vlan.json?limit=20&page=2"
        );
        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            request.body().unwrap().as_bytes(),
            Some(br#"{"name":"v"}"#.as_slice())
        );
    }

    #[tokio::test]
    async fn wire_log_redacts_credentials() {
        use crate::wire::{tests::capture_wire_logs, REDACTED};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/vlan/v1/vlan.json/abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "session=c00k13")
                    .set_body_string(r#"{"name":"prod"}"#),
            )
            .mount(&mock_server)
            .await;

        let (capture, _guard) = capture_wire_logs();
        let client = Client::builder()
            .base_url(mock_server.uri())
            .unwrap()
            .token("T0PS3CR3T")
            .build()
            .unwrap();
        let response = client
            .get::<serde_json::Value>("/api/vlan/v1/vlan.json/abc")
            .await
            .unwrap();
        assert_eq!(response.data["name"], "prod");

        let output = capture.contents();
        assert!(output.contains("Outgoing request"), "{output}");
        assert!(output.contains("Incoming response"), "{output}");
        assert!(output.contains(REDACTED), "{output}");
        assert!(!output.contains("T0PS3CR3T"), "{output}");
        assert!(!output.contains("c00k13"), "{output}");
    }

    #[test]
    fn request_without_body_has_none() {
        let client = Client::builder().token("T").build().unwrap();
        let request = client
            .request::<()>(&RequestMetadata::new(Method::GET, "/x"), None)
            .unwrap();

        assert!(request.body().is_none());
        assert_eq!(request.url().path(), "/x");
        assert_eq!(request.url().query(), None);
    }
}
