//! HTTP fetcher
//!
//! Fetches from the origin with reqwest. No request timeout is set: a hung
//! origin stalls the request that is waiting on it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{Fetcher, NetworkError, Request, Response};

/// Fetcher backed by a reqwest client
#[derive(Clone)]
pub struct HttpFetcher {
    http_client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let http_client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        debug!(method = %request.method, url = %request.url, "Fetching from network");

        let response = self
            .http_client
            .request(request.method.clone(), request.url.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        debug!(url = %request.url, status = status, size = body.len(), "Network response");
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
