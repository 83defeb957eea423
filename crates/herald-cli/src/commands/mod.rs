//! CLI command implementations.

pub mod jobs;

use anyhow::{Context, Result, bail};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

/// Thin client for the admin API.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("invalid API URL: {}", api_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    /// Absolute URL for a path under `/api/v1`.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let relative = format!("api/v1/{}", path.trim_start_matches('/'));
        Ok(self.base.join(&relative)?)
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.endpoint(path)?;
        debug!(%method, %url, "API request");
        Ok(self.http.request(method, url))
    }

    /// Send and decode a JSON response, surfacing the API's `error` field.
    pub async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.context("failed to reach the Herald API")?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    match body.get("error").and_then(|e| e.as_str()) {
        Some(message) => bail!("{} ({})", message, status),
        None => bail!("request failed with {}", status),
    }
}

/// `load_config` runs the cross-field checks, so a parsed config is valid.
pub fn validate(path: &str) -> Result<()> {
    match herald_config::load_config(path) {
        Ok(_config) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
