//! Invocation primitive: fire-and-forget dispatch of a business function.
//!
//! The caller only learns whether the dispatch was accepted; the function's
//! result comes back later as a `Response` through the backend handler.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("invocation of {function} rejected with status {status}")]
    Rejected { function: String, status: u16 },

    #[error("invocation transport error: {0}")]
    Transport(String),

    #[error("no invocation endpoint configured")]
    Disabled,
}

#[async_trait]
pub trait Invoker: Send + Sync {
    /// Dispatch `payload` to `function` without waiting for its result.
    async fn invoke_async(&self, function: &str, payload: Vec<u8>) -> Result<(), InvokeError>;
}

/// Dispatches by `POST {base_url}/{function}`; any 2xx (normally `202
/// Accepted`) counts as dispatched.
pub struct HttpInvoker {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpInvoker {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    pub fn function_url(&self, function: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), function)
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke_async(&self, function: &str, payload: Vec<u8>) -> Result<(), InvokeError> {
        let url = self.function_url(function);
        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                warn!(function = %function, error = %e, "invoke request failed");
                InvokeError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(function = %function, status = status.as_u16(), "function invoked");
            Ok(())
        } else {
            Err(InvokeError::Rejected {
                function: function.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

/// Invoker used when no endpoint is configured; every dispatch fails.
pub struct DisabledInvoker;

#[async_trait]
impl Invoker for DisabledInvoker {
    async fn invoke_async(&self, function: &str, _payload: Vec<u8>) -> Result<(), InvokeError> {
        warn!(function = %function, "request dropped: invocation disabled");
        Err(InvokeError::Disabled)
    }
}
