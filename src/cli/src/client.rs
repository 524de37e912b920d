//! HTTP client for communicating with the Causeway API server.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// HTTP client for the Causeway API.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(url: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            anyhow::bail!("API error ({status}) from {url}: {message}");
        }
        Ok(resp)
    }

    /// Perform a GET request and deserialize the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        Self::check(&url, resp)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {url}"))
    }

    /// Perform a POST request with a JSON body and deserialize the response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authorized(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        Self::check(&url, resp)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {url}"))
    }

    /// Perform a bodyless POST request and deserialize the response.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authorized(self.client.post(&url))
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        Self::check(&url, resp)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {url}"))
    }

    /// PUT raw bytes to an absolute URL (signed upload URLs carry their own
    /// authorization, so no bearer token is attached).
    pub async fn put_bytes(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
        let resp = self
            .client
            .put(url)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("PUT {url} failed"))?;

        Self::check(url, resp).await?;
        Ok(())
    }
}
