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

//! Per-instance host state shared between the adapter and host functions.

use crate::arena::HostObjectArena;
use crate::capabilities::{Capability, GrantedCapabilities};
use crate::codec;
use crate::error::{CoreError, GuestError};
use crate::net::{network_error, HttpClient, HttpRequest, RequestOutcome, RequestTable, CAPABILITY_DENIED};
use crate::sink::{EventKind, InstanceSink, LogLevel};
use crate::value::Handle;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// State reachable from host functions
pub struct HostState {
    pub module_id: String,
    pub arena: HostObjectArena,
    pub capabilities: GrantedCapabilities,
    /// Network collaborator; `None` rejects every request.
    pub http: Option<Arc<dyn HttpClient>>,
    pub requests: RequestTable,
    pub sink: Arc<InstanceSink>,
    pub metrics: InstanceMetrics,
    /// Host-originated error raised while guest code was on the stack.
    pub host_fault: Option<CoreError>,
    /// Entry point currently executing.
    pub current_entry: Option<String>,
}

pub type SharedState = Arc<Mutex<HostState>>;

impl HostState {
    pub fn new(
        capabilities: GrantedCapabilities,
        http: Option<Arc<dyn HttpClient>>,
        sink: Arc<InstanceSink>,
    ) -> Self {
        let module_id = capabilities.module_id().to_string();
        Self {
            metrics: InstanceMetrics::new(&module_id),
            module_id,
            arena: HostObjectArena::new(),
            capabilities,
            http,
            requests: RequestTable::new(),
            sink,
            host_fault: None,
            current_entry: None,
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn entry_name(&self) -> &str {
        self.current_entry.as_deref().unwrap_or("")
    }

    /// Register a guest network request and return its pending id.
    ///
    /// Denied or impossible requests are still registered, already
    /// rejected, so the guest observes the failure through its continuation.
    pub fn issue_request(&mut self, request: HttpRequest) -> u64 {
        self.metrics.record_request();
        let hostname = match request.hostname() {
            Ok(host) => host,
            Err(e) => {
                return self
                    .requests
                    .register_ready(Err(network_error(e.to_string(), None, None)))
            }
        };

        if !self.capabilities.can_network(&hostname) {
            let capability = Capability::NetworkHost(hostname.clone()).to_string();
            self.sink.emit(
                LogLevel::Warn,
                EventKind::CapabilityDenied {
                    capability: capability.clone(),
                },
                format!("request to {} denied", hostname),
            );
            let denied = GuestError {
                name: CAPABILITY_DENIED.to_string(),
                message: format!("module may not access {}", hostname),
                hostname: Some(hostname),
                ..Default::default()
            };
            return self.requests.register_ready(Err(denied));
        }

        let Some(client) = self.http.clone() else {
            return self.requests.register_ready(Err(network_error(
                "network unavailable",
                Some(hostname),
                None,
            )));
        };

        tracing::debug!(
            module_id = %self.module_id,
            url = %request.url,
            method = %request.method,
            "guest request issued"
        );
        self.requests.register(Box::pin(async move {
            let response = client.execute(request).await?;
            serde_json::to_value(response)
                .map_err(|e| network_error(e.to_string(), Some(hostname), None))
        }))
    }

    /// Insert a settled request into the arena. Rejections become error
    /// objects carrying the guest error payload.
    pub fn settle(&mut self, outcome: RequestOutcome) -> (Handle, bool) {
        match outcome {
            Ok(value) => (codec::insert_json(&mut self.arena, &value), true),
            Err(error) => {
                let value = serde_json::to_value(&error).unwrap_or(serde_json::Value::Null);
                (codec::insert_json(&mut self.arena, &value), false)
            }
        }
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("module_id", &self.module_id)
            .field("requests", &self.requests)
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Metrics collected across calls
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceMetrics {
    pub module_id: String,

    /// Entry point calls completed
    pub call_count: u64,

    /// Total time spent in calls (microseconds)
    pub total_call_time_us: u64,

    /// Number of host function calls
    pub host_call_count: u64,

    /// Calls that ended in an error
    pub error_count: u64,

    /// Network requests issued
    pub request_count: u64,
}

impl InstanceMetrics {
    pub fn new(module_id: &str) -> Self {
        Self {
            module_id: module_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record_call(&mut self, duration_us: u64, ok: bool) {
        self.call_count += 1;
        self.total_call_time_us += duration_us;
        if !ok {
            self.error_count += 1;
        }
    }

    pub fn record_host_call(&mut self) {
        self.host_call_count += 1;
    }

    pub fn record_request(&mut self) {
        self.request_count += 1;
    }

    pub fn average_call_time_us(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.total_call_time_us as f64 / self.call_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilitySet;
    use crate::sink::MemorySink;
    use crate::view;

    fn state(caps: &[&str]) -> (HostState, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        let sink = Arc::new(InstanceSink::new(memory.clone(), "m", "i"));
        let granted = GrantedCapabilities::new("m", CapabilitySet::parse(caps.iter().copied()).unwrap());
        (HostState::new(granted, None, sink), memory)
    }

    #[tokio::test]
    async fn test_denied_request_is_rejected_not_raised() {
        let (mut state, memory) = state(&["json"]);
        let id = state.issue_request(HttpRequest::get("https://example.com/"));
        let outcome = state.requests.take(id).unwrap().await;
        let error = outcome.unwrap_err();
        assert_eq!(error.name, CAPABILITY_DENIED);
        assert_eq!(error.hostname.as_deref(), Some("example.com"));
        assert!(matches!(
            memory.events()[0].kind,
            EventKind::CapabilityDenied { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_client_rejects_with_network_error() {
        let (mut state, _) = state(&["network"]);
        let id = state.issue_request(HttpRequest::get("https://example.com/"));
        let outcome = state.requests.take(id).unwrap().await;

        let (handle, ok) = state.settle(outcome);
        assert!(!ok);
        let message = view::get(&state.arena, handle, "message").unwrap();
        assert_eq!(
            view::to_str(&state.arena, message).unwrap(),
            "network unavailable"
        );
    }

    #[test]
    fn test_metrics() {
        let mut metrics = InstanceMetrics::new("m");
        metrics.record_call(100, true);
        metrics.record_call(300, false);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.average_call_time_us(), 200.0);
    }
}
