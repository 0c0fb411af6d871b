//! Transports that deliver owner requests to the system under test.
//!
//! A [`Remote`] sends exactly one attempt of a request and reports what came back. Retries,
//! metrics and error sampling are layered on top by the [`Executor`](crate::executor::Executor).

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

mod http;
mod in_memory;

pub use self::http::HttpRemote;
pub use self::in_memory::InMemoryRemote;

/// Base URL scheme that selects the in-process [`InMemoryRemote`].
pub const MEMORY_SCHEME: &str = "memory://";

/// A type-erased, shareable [`Remote`] instance.
pub type SharedRemote = Arc<dyn Remote>;

/// HTTP methods used against the owners API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// All methods, in reporting order.
    pub const ALL: [Method; 4] = [Method::Get, Method::Post, Method::Put, Method::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical endpoints of the owners API.
///
/// Metrics are keyed by endpoint rather than by concrete path, so owner ids never leak into
/// metric names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    #[serde(rename = "GET /owners")]
    ListOwners,
    #[serde(rename = "GET /owners/{id}")]
    GetOwner,
    #[serde(rename = "POST /owners")]
    CreateOwner,
    #[serde(rename = "PUT /owners/{id}")]
    UpdateOwner,
    #[serde(rename = "DELETE /owners/{id}")]
    DeleteOwner,
}

impl Endpoint {
    /// All endpoints, in reporting order.
    pub const ALL: [Endpoint; 5] = [
        Endpoint::ListOwners,
        Endpoint::GetOwner,
        Endpoint::CreateOwner,
        Endpoint::UpdateOwner,
        Endpoint::DeleteOwner,
    ];

    pub fn method(self) -> Method {
        match self {
            Endpoint::ListOwners | Endpoint::GetOwner => Method::Get,
            Endpoint::CreateOwner => Method::Post,
            Endpoint::UpdateOwner => Method::Put,
            Endpoint::DeleteOwner => Method::Delete,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::ListOwners => "GET /owners",
            Endpoint::GetOwner => "GET /owners/{id}",
            Endpoint::CreateOwner => "POST /owners",
            Endpoint::UpdateOwner => "PUT /owners/{id}",
            Endpoint::DeleteOwner => "DELETE /owners/{id}",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single request attempt.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// Path relative to the base URL, e.g. `/owners/42`.
    pub path: String,
    /// JSON encoded body.
    pub body: Option<Bytes>,
}

/// What the remote answered to one attempt.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
    /// A correlation id assigned by the gateway in front of the system under test.
    pub request_id: Option<String>,
}

/// Failures to obtain any HTTP status for an attempt.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// All errors stemming from the reqwest client: connect failures, timeouts, broken bodies.
    #[error("reqwest error: {context}")]
    Reqwest {
        context: String,
        #[source]
        cause: reqwest::Error,
    },

    /// The request path does not resolve against the base URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Convenience alias for remote results.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Sends single request attempts to the owners API.
#[async_trait::async_trait]
pub trait Remote: Debug + Send + Sync + 'static {
    /// The remote name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Performs one attempt of `request`.
    async fn send(&self, request: &Request) -> RemoteResult<RawResponse>;
}

/// Builds the remote addressed by `base_url`.
///
/// `memory://` selects a fresh [`InMemoryRemote`], anything else is treated as an HTTP base URL.
pub fn from_base_url(base_url: &str, timeout: Duration) -> Result<SharedRemote> {
    if base_url.starts_with(MEMORY_SCHEME) {
        tracing::info!("using in-memory owners store");
        return Ok(Arc::new(InMemoryRemote::new()));
    }

    Ok(Arc::new(HttpRemote::new(base_url, timeout)?))
}
