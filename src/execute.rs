//! The raw HTTP execution step.
//!
//! [`Execute`] is the single capability the transport dispatches through.
//! Decorators such as [`crate::metrics::Instrumented`] wrap another executor
//! and are composed by nesting.

use async_trait::async_trait;
use std::sync::Arc;

/// Sends a fully built request and returns whatever the HTTP stack produced.
#[async_trait]
pub trait Execute: Send + Sync {
    /// Performs one HTTP exchange.
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error>;
}

#[async_trait]
impl Execute for reqwest::Client {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        reqwest::Client::execute(self, request).await
    }
}

#[async_trait]
impl<E> Execute for Arc<E>
where
    E: Execute + ?Sized,
{
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        (**self).execute(request).await
    }
}
