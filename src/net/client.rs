use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{redirect::Policy, Client};
use tracing::debug;

use super::{FetchError, Network, Request, Response};

/// Network transport backed by reqwest.
/// Clone is cheap - reqwest::Client shares its connection pool.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = Client::builder()
      .user_agent(concat!("offgrid/", env!("CARGO_PKG_VERSION")))
      // Redirects belong to the application, not the proxy
      .redirect(Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_connect() || e.is_timeout() {
        FetchError::Unreachable(format!("{}: {}", request.url, e))
      } else {
        FetchError::Network(e)
      }
    })?;
    let status = response.status().as_u16();

    // Non-UTF-8 header values are dropped rather than failing the response
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|value| (name.as_str().to_string(), value.to_string()))
      })
      .collect();

    let body = response.bytes().await?.to_vec();

    debug!(method = %request.method, url = %request.url, status, "Fetched from network");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
