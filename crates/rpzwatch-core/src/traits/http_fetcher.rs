// # HTTP Fetcher Trait
//
// One GET per call, redirects never followed, so the redirect tracer can
// observe every hop explicitly.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// What the tracer needs from a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopResponse {
    /// HTTP status code
    pub status: u16,
    /// Raw `Location` header, if any
    pub location: Option<String>,
}

impl HopResponse {
    pub fn new(status: u16, location: Option<String>) -> Self {
        Self { status, location }
    }
}

/// Transport-level failure of a single hop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The host could not be reached
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request did not complete in time
    #[error("timed out")]
    Timeout,

    /// Anything else (protocol errors, invalid responses)
    #[error("{0}")]
    Other(String),
}

/// Trait for HTTP fetcher implementations
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Issue a GET for `url` without following redirects
    async fn fetch(&self, url: &Url) -> Result<HopResponse, FetchError>;
}
