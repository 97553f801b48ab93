//! # anxcloud - transport and iteration core for the Anexia Engine API
//!
//! This crate is the layer every resource wrapper of the Engine SDK sits on. It
//! authenticates requests (API token or HMAC request signing), sends them
//! through a replaceable execution primitive, records wire-level traces with
//! secrets redacted, reports per-request metrics, turns non-2xx answers into
//! structured errors, and walks paged list endpoints.
//!
//! ## Quick Start
//!
//! ```no_run
//! use anxcloud::Client;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize)]
//! struct CreateZone {
//!     zone_name: String,
//!     admin_email: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct Zone {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), anxcloud::Error> {
//!     let client = Client::builder()
//!         .token(std::env::var("ANEXIA_TOKEN").unwrap_or_default())
//!         .build()?;
//!
//!     let zone = client.get::<Zone>("/api/clouddns/v1/zone.json/example.com").await?;
//!     println!("Zone: {}", zone.data.name);
//!     println!("Request took {:?}", zone.latency);
//!
//!     let request = CreateZone {
//!         zone_name: "example.org".to_string(),
//!         admin_email: "admin@example.org".to_string(),
//!     };
//!     let created = client
//!         .post::<_, Zone>("/api/clouddns/v1/zone.json", &request)
//!         .await?;
//!     println!("Created zone {}", created.data.name);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Two credentials** - `Authorization: Token <token>` or an HMAC-SHA512 request signature with body digest
//! - **Raw transport** - [`Client::execute`] takes any `reqwest::Request` for wrappers that build their own
//! - **Structured API errors** - Non-2xx answers become [`ResponseError`] with code, message and field validation
//! - **Wire tracing** - Full requests and responses on the `anxcloud::wire` target, credentials and cookies redacted
//! - **Metrics** - Inflight, duration and count events per request through a plain callback
//! - **Pagination** - [`loop_until`] for early-exit searches, [`as_stream`] for cancellable background iteration
//!
//! ## Error Handling
//!
//! ```no_run
//! use anxcloud::{Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().token("secret").build()?;
//! match client.get::<serde_json::Value>("/api/vlan/v1/vlan.json/abc").await {
//!     Ok(response) => {
//!         println!("Success: {:?}", response.data);
//!     }
//!     Err(Error::Response(api)) => {
//!         eprintln!("{} answered {}: {}", api.url, api.status, api.message);
//!     }
//!     Err(Error::ErrorBody { status, raw_response, .. }) => {
//!         eprintln!("Unexpected error body for {}: {}", status, raw_response);
//!     }
//!     Err(Error::Network(e)) => {
//!         eprintln!("No response: {}", e);
//!     }
//!     Err(e) => {
//!         eprintln!("Other error: {}", e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Iterating Lists
//!
//! ```no_run
//! use anxcloud::{as_stream, Client, ListPageable, QueryParam};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct Vlan {
//!     identifier: String,
//! }
//!
//! # async fn example(client: Client) -> Result<(), anxcloud::Error> {
//! let vlans = Arc::new(ListPageable::<Vlan>::new(client, "/api/vlan/v1/vlan.json"));
//! let (mut stream, cancel) = as_stream(vlans, 50, vec![QueryParam::pair("search", "prod")]);
//!
//! while let Some(vlan) = stream.next().await {
//!     let vlan = vlan?;
//!     if vlan.identifier.starts_with("ff") {
//!         cancel.cancel();
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod credential;
mod error;
pub mod execute;
pub mod metadata;
pub mod metrics;
pub mod pagination;
mod response;
pub mod wire;

pub use client::{default_user_agent, Client, ClientBuilder, DEFAULT_BASE_URL};
pub use credential::Credential;
pub use error::{Error, ResponseError, Result};
pub use execute::Execute;
pub use metadata::RequestMetadata;
pub use metrics::{LabelName, MetricName, MetricReceiver};
pub use pagination::{
    as_stream, loop_until, loop_until_with, CancelHandle, ListPageable, Page, PageStream,
    Pageable, QueryParam,
};
pub use response::Response;
