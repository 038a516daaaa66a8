// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Network collaborator
//!
//! Guest network requests go through an [`HttpClient`]. Requests issued by
//! the `httpRequest` import are parked in the instance's [`RequestTable`] as
//! unstarted futures; only the async call bridge polls them.

use crate::config::NetworkConfig;
use crate::error::{CoreError, CoreResult, GuestError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const NETWORK_ERROR: &str = "NetworkError";
pub const CAPABILITY_DENIED: &str = "CapabilityDenied";

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// A bare string is a GET of that URL.
    pub fn from_json(value: serde_json::Value) -> CoreResult<Self> {
        match value {
            serde_json::Value::String(url) => Ok(Self::get(url)),
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Lowercased host of the request URL.
    pub fn hostname(&self) -> CoreResult<String> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| CoreError::Decode(format!("invalid request URL {}: {}", self.url, e)))?;
        url.host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| CoreError::Decode(format!("request URL has no host: {}", self.url)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }
}

/// Network layer used by guest modules
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform one request. Failures carry a `NetworkError` payload.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, GuestError>;
}

/// Rejection payload for a failed request.
pub fn network_error(message: impl Into<String>, hostname: Option<String>, status: Option<u16>) -> GuestError {
    GuestError {
        name: NETWORK_ERROR.to_string(),
        message: message.into(),
        hostname,
        status,
        ..Default::default()
    }
}

/// Default client backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(config: &NetworkConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CoreError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, GuestError> {
        let hostname = request.hostname().ok();
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| network_error(format!("invalid method: {}", e), hostname.clone(), None))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            network_error(
                e.to_string(),
                hostname.clone(),
                e.status().map(|s| s.as_u16()),
            )
        })?;

        let url = response.url().to_string();
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| network_error(e.to_string(), hostname.clone(), Some(status)))?;

        tracing::debug!(url = %url, status, "guest request completed");
        Ok(HttpResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

/// Settlement of a guest request: the response object or a rejection.
pub type RequestOutcome = Result<serde_json::Value, GuestError>;

/// Unstarted request future.
pub type RequestFuture = BoxFuture<'static, RequestOutcome>;

/// Requests issued during the current call, keyed by pending id
#[derive(Default)]
pub struct RequestTable {
    next_id: u64,
    pending: HashMap<u64, RequestFuture>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, future: RequestFuture) -> u64 {
        self.next_id += 1;
        self.pending.insert(self.next_id, future);
        self.next_id
    }

    /// Register an already settled request.
    pub fn register_ready(&mut self, outcome: RequestOutcome) -> u64 {
        self.register(Box::pin(futures::future::ready(outcome)))
    }

    pub fn take(&mut self, id: u64) -> Option<RequestFuture> {
        self.pending.remove(&id)
    }

    /// Remove every registered request.
    pub fn drain(&mut self) -> Vec<(u64, RequestFuture)> {
        let mut drained: Vec<_> = self.pending.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop unfinished requests.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl std::fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTable")
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_from_json() {
        let req = HttpRequest::from_json(json!("https://Example.com/search?q=batman")).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.hostname().unwrap(), "example.com");

        let req = HttpRequest::from_json(json!({
            "url": "https://api.example.com/x",
            "method": "POST",
            "headers": {"content-type": "application/json"},
            "body": "{}"
        }))
        .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body.as_deref(), Some("{}"));

        assert!(HttpRequest::get("not a url").hostname().is_err());
    }

    #[tokio::test]
    async fn test_request_table_ids() {
        let mut table = RequestTable::new();
        let a = table.register_ready(Ok(json!(1)));
        let b = table.register_ready(Err(network_error("down", None, None)));
        assert_eq!((a, b), (1, 2));

        let outcome = table.take(a).unwrap().await;
        assert_eq!(outcome.unwrap(), json!(1));
        assert!(table.take(a).is_none());

        let mut drained = table.drain();
        assert_eq!(drained.len(), 1);
        let (id, future) = drained.remove(0);
        assert_eq!(id, b);
        assert_eq!(future.await.unwrap_err().name, NETWORK_ERROR);
        assert!(table.is_empty());
    }
}
