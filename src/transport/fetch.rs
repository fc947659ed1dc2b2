//! High-level transport backed by `reqwest`.
//!
//! Fallback path for upstreams the raw socket cannot reach, and the primary
//! path for routes that prefer it. Redirects are followed by the client;
//! header hygiene beyond the envelope filter is not guaranteed here.

use crate::error::ProxyError;
use crate::transport::{RequestEnvelope, UpstreamResponse};
use futures_util::StreamExt;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FetchTransport {
    client: reqwest::Client,
}

impl FetchTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }

    pub async fn send(&self, envelope: &RequestEnvelope) -> Result<UpstreamResponse, ProxyError> {
        let target = &envelope.target;
        // The client only speaks http(s); ws targets are the relay's job.
        let scheme = match target.scheme.as_str() {
            "wss" => "https",
            "ws" => "http",
            s => s,
        };
        let url = format!(
            "{}://{}:{}{}",
            scheme, target.host, target.port, target.path_and_query
        );

        let mut request = self
            .client
            .request(envelope.method.clone(), &url)
            .headers(envelope.headers.clone());
        if let Some(body) = &envelope.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout
            } else {
                ProxyError::Fetch(e)
            }
        })?;

        let status = response.status();
        let reason = status.canonical_reason().unwrap_or("").to_string();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(ProxyError::Fetch));

        Ok(UpstreamResponse {
            status: status.as_u16(),
            reason,
            headers,
            body: Box::pin(body),
        })
    }
}

impl Default for FetchTransport {
    fn default() -> Self {
        Self::new()
    }
}
