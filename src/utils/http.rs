// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::Config;

/// Status and body of one GET.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Single-method network interface used by the fetcher.
#[async_trait]
pub trait HttpSource: Send + Sync {
    /// Issue one GET. Non-2xx statuses are returned, not raised.
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpResponse>;
}

/// `reqwest`-backed source with redirect following.
#[derive(Debug, Clone)]
pub struct ReqwestSource {
    client: reqwest::Client,
}

impl ReqwestSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a source from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(create_async_client(config)?))
    }
}

#[async_trait]
impl HttpSource for ReqwestSource {
    async fn get(&self, url: &Url, timeout: Duration) -> Result<HttpResponse> {
        let request = async {
            let response = self
                .client
                .get(url.clone())
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify(url, timeout, e))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| classify(url, timeout, e))?;
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
            })
        };

        // Guards against a body that trickles in past the client timeout
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                context: url.to_string(),
                after: timeout,
            }),
        }
    }
}

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &Config) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.request_timeout())
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;
    Ok(client)
}

fn classify(url: &Url, timeout: Duration, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::Timeout {
            context: url.to_string(),
            after: timeout,
        }
    } else if error.is_connect() || error.is_request() || error.is_body() {
        AppError::transient(url.as_str(), error)
    } else {
        AppError::Http(error)
    }
}
