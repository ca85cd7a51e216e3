//! Static `api name → function name` routing map, loaded once at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use wsrelay_core::{RelayError, RelayResult};

/// Environment variable holding the routing map as a JSON object.
pub const ROUTES_ENV: &str = "WSRELAY_ROUTES";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingMap {
    routes: HashMap<String, String>,
}

impl RoutingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"api": "function", ...}`.
    pub fn from_json(json: &str) -> RelayResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| RelayError::Other(format!("invalid routing map: {e}")))
    }

    /// Read [`ROUTES_ENV`]; `None` if unset.
    pub fn from_env() -> RelayResult<Option<Self>> {
        match std::env::var(ROUTES_ENV) {
            Ok(json) => {
                let map = Self::from_json(&json)?;
                info!(routes = map.len(), "routing map loaded from {ROUTES_ENV}");
                Ok(Some(map))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn insert(&mut self, api: impl Into<String>, function: impl Into<String>) {
        self.routes.insert(api.into(), function.into());
    }

    /// Function for the first `.`-separated segment of `uri`.
    pub fn resolve(&self, uri: &str) -> RelayResult<&str> {
        let api = uri.split('.').next().unwrap_or_default();
        self.routes
            .get(api)
            .map(String::as_str)
            .ok_or_else(|| RelayError::MissingFunctionMapping(api.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<A: Into<String>, F: Into<String>> FromIterator<(A, F)> for RoutingMap {
    fn from_iter<I: IntoIterator<Item = (A, F)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (api, function) in iter {
            map.insert(api, function);
        }
        map
    }
}
