//! Origin HTTP Client
//!
//! Fetches resources from the origin server on behalf of the cache agent.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use super::errors::FetchError;
use super::types::{OriginResponse, ResourceRequest};

/// Default HTTP client timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that can answer a resource request on behalf of the origin
///
/// A non-success status is still `Ok`: the origin was reached and answered.
/// `Err` is reserved for requests that produced no response at all.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<OriginResponse, FetchError>;
}

/// Origin client backed by reqwest
#[derive(Clone)]
pub struct HttpOrigin {
    /// HTTP client for making requests
    http_client: Client,
}

impl HttpOrigin {
    /// Create a client with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, request: &ResourceRequest) -> Result<OriginResponse, FetchError> {
        debug!(method = %request.method, url = %request.url, "Fetching from origin");

        let response = self
            .http_client
            .request(request.method.clone(), request.url.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let body = response.bytes().await?;

        debug!(url = %request.url, status = status, size = body.len(), "Origin responded");

        Ok(OriginResponse {
            status,
            content_type,
            body,
        })
    }
}
