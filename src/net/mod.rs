//! Network seam for the interception layer.
//!
//! Everything that leaves the process goes through the [`Network`] trait, so
//! the caching strategies can be exercised against an in-memory fake.

mod client;
mod error;
mod interceptor;
#[cfg(test)]
pub mod testing;
mod types;

use async_trait::async_trait;

pub use client::HttpNetwork;
pub use error::FetchError;
pub use interceptor::Interceptor;
pub use types::{is_forwardable, Request, Response};

/// Transport that turns a request into a response.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}
