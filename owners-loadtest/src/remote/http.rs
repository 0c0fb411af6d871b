//! Contains a remote implementation using HTTP to interact with the owners API.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};

use super::{Method, RawResponse, Remote, RemoteError, RemoteResult, Request};
use crate::error::{Error, Result};

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("owners-loadtest/", env!("CARGO_PKG_VERSION"));

/// Headers carrying a correlation id, checked in order.
const REQUEST_ID_HEADERS: &[&str] = &[
    "x-amzn-requestid",
    "x-amzn-trace-id",
    "x-amz-apigw-id",
    "x-request-id",
];

/// A remote implementation using HTTP to interact with the owners API.
#[derive(Debug)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Creates a new `HttpRemote` for the given base URL, e.g. `https://api.example.com/dev`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        reqwest::Url::parse(base_url)
            .map_err(|err| Error::InvalidConfig(format!("invalid base_url `{base_url}`: {err}")))?;

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    /// The base URL all request paths are appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl Remote for HttpRemote {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, request: &Request) -> RemoteResult<RawResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let url = reqwest::Url::parse(&url).map_err(|_| RemoteError::InvalidUrl(url))?;

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|cause| RemoteError::Reqwest {
                context: format!("failed to send {} {}", request.method, request.path),
                cause,
            })?;

        let status = response.status().as_u16();
        let request_id = request_id(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|cause| RemoteError::Reqwest {
                context: format!("failed to read body of {} {}", request.method, request.path),
                cause,
            })?;

        Ok(RawResponse {
            status,
            body,
            request_id,
        })
    }
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find(|value| !value.is_empty())
        .map(str::to_owned)
}
