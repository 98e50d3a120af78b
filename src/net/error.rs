use thiserror::Error;

/// Failure to obtain a response from the network.
///
/// A response with an error status is still a response; only the install
/// pre-warm treats a non-2xx status as a failure.
#[derive(Error, Debug)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Network unreachable: {0}")]
  Unreachable(String),

  #[error("Unexpected status {status} for {url}")]
  Status { status: u16, url: String },

  #[error("Background fetch for {0} did not complete")]
  Aborted(String),
}
