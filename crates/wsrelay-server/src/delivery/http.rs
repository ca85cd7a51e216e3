//! Push through the gateway's connection management endpoint.
//!
//! `POST {scheme}://{domain}/{stage}/@connections/{connection_id}` with the
//! raw bytes as body. `410 Gone` and `404 Not Found` mean the connection is
//! no longer there; any other non-2xx status or a network failure is a
//! transport error.

use super::{Delivery, DeliveryError};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};
use wsrelay_core::Client;

pub struct HttpDelivery {
    http_client: reqwest::Client,
    scheme: String,
    auth_token: Option<String>,
}

impl HttpDelivery {
    pub fn new(scheme: impl Into<String>, auth_token: Option<String>, timeout_secs: u64) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            scheme: scheme.into(),
            auth_token,
        }
    }

    /// Management URL for `client`, with each path segment escaped.
    pub fn connection_url(&self, client: &Client) -> Result<Url, DeliveryError> {
        let mut url = Url::parse(&format!("{}://{}/", self.scheme, client.domain))
            .map_err(|e| DeliveryError::Transport(format!("bad endpoint {}: {e}", client.domain)))?;
        url.path_segments_mut()
            .map_err(|_| {
                DeliveryError::Transport(format!("endpoint cannot be a base: {}", client.domain))
            })?
            .pop_if_empty()
            .push(&client.stage)
            .push("@connections")
            .push(&client.connection_id);
        Ok(url)
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn push(&self, client: &Client, data: &[u8]) -> Result<(), DeliveryError> {
        let url = self.connection_url(client)?;
        let mut req = self.http_client.post(url).body(data.to_vec());
        if let Some(ref token) = self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|e| {
            warn!(connection_id = %client.connection_id, error = %e, "push request failed");
            DeliveryError::Transport(e.to_string())
        })?;

        match response.status() {
            s if s.is_success() => {
                debug!(connection_id = %client.connection_id, bytes = data.len(), "pushed");
                Ok(())
            }
            StatusCode::GONE | StatusCode::NOT_FOUND => {
                Err(DeliveryError::Gone(client.connection_id.clone()))
            }
            s => Err(DeliveryError::Transport(format!(
                "push to {} returned {s}",
                client.connection_id
            ))),
        }
    }
}
