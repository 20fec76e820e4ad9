//! WHEP signaling client
//!
//! HTTP side of the WebRTC-HTTP Egress Protocol: the offer is POSTed to the
//! endpoint, the answer comes back in the body and the session resource in
//! the `Location` header. Trickled candidates are PATCHed to that resource
//! (RFC 8840 fragments) and a DELETE ends the session.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::signaling::WhepAnswer;
use crate::config::SignalingConfig;
use crate::error::{PlayerError, Result};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// Signaling transport used by the session manager
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// POST the local offer and return the server's answer
    async fn send_offer(&self, endpoint_url: &str, local_sdp: &str) -> Result<WhepAnswer>;

    /// PATCH an `application/trickle-ice-sdpfrag` body to the session resource
    async fn send_candidates(&self, resource_url: &str, fragment: &str) -> Result<()>;

    /// DELETE the session resource
    async fn terminate(&self, resource_url: &str) -> Result<()>;
}

/// reqwest-based WHEP client
#[derive(Clone)]
pub struct WhepClient {
    client: Client,
    auth_token: Option<String>,
    timeout: Duration,
}

impl WhepClient {
    pub fn new(config: &SignalingConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PlayerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
            timeout,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    fn transport_error(&self, action: &str, e: reqwest::Error) -> PlayerError {
        if e.is_timeout() {
            PlayerError::SignalingTransport(format!(
                "WHEP {} timed out after {}ms",
                action,
                self.timeout.as_millis()
            ))
        } else {
            PlayerError::SignalingTransport(format!("WHEP {} failed: {}", action, e))
        }
    }
}

/// Resolve a `Location` value against the endpoint it came from
pub fn resolve_resource_url(endpoint_url: &str, location: &str) -> Result<String> {
    let base = Url::parse(endpoint_url)
        .map_err(|e| PlayerError::InvalidTarget(format!("{}: {}", endpoint_url, e)))?;
    base.join(location.trim())
        .map(String::from)
        .map_err(|e| PlayerError::SignalingProtocol {
            status: None,
            message: format!("invalid Location header '{}': {}", location, e),
        })
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) if !body.trim().is_empty() => body.trim().to_string(),
        _ => status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    }
}

#[async_trait]
impl SignalingClient for WhepClient {
    async fn send_offer(&self, endpoint_url: &str, local_sdp: &str) -> Result<WhepAnswer> {
        debug!("WHEP POST {} ({} bytes)", endpoint_url, local_sdp.len());

        let request = self
            .client
            .post(endpoint_url)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .header(ACCEPT, SDP_CONTENT_TYPE)
            .body(local_sdp.to_owned());

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error("POST", e))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let message = error_body(response).await;
            return Err(PlayerError::protocol(status.as_u16(), message));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error("POST", e))?;
        let sdp = String::from_utf8(body.to_vec()).map_err(|_| {
            PlayerError::protocol(status.as_u16(), "answer body is not valid UTF-8")
        })?;
        if sdp.trim().is_empty() {
            return Err(PlayerError::protocol(status.as_u16(), "empty SDP answer"));
        }

        let resource_url = match location {
            Some(location) => Some(resolve_resource_url(endpoint_url, &location)?),
            None => {
                warn!(
                    "WHEP {} without Location header, trickle ICE unavailable",
                    status.as_u16()
                );
                None
            }
        };

        info!(
            "WHEP answer received (HTTP {}, resource: {})",
            status.as_u16(),
            resource_url.as_deref().unwrap_or("none")
        );

        Ok(WhepAnswer::new(sdp, resource_url))
    }

    async fn send_candidates(&self, resource_url: &str, fragment: &str) -> Result<()> {
        debug!("WHEP PATCH {} ({} bytes)", resource_url, fragment.len());

        let request = self
            .client
            .patch(resource_url)
            .header(CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
            .body(fragment.to_owned());

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error("PATCH", e))?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => {
                let message = error_body(response).await;
                Err(PlayerError::protocol(status.as_u16(), message))
            }
        }
    }

    async fn terminate(&self, resource_url: &str) -> Result<()> {
        debug!("WHEP DELETE {}", resource_url);

        let request = self.client.delete(resource_url);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error("DELETE", e))?;

        if response.status().is_success() {
            info!("WHEP session deleted: {}", resource_url);
        } else {
            warn!(
                "WHEP DELETE returned {}, session may still exist server-side",
                response.status()
            );
        }
        Ok(())
    }
}
