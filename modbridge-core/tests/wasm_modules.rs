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

//! End-to-end scenarios for WebAssembly modules. Guests are written in WAT
//! and compiled by wasmtime at load time.

use async_trait::async_trait;
use modbridge_core::codec::encode_json;
use modbridge_core::{
    Capability, CoreError, EventKind, GuestError, HostFunction, HttpClient, HttpRequest,
    HttpResponse, InstanceState, MemorySink, Module, ModuleFormat, ModuleHost, ModuleInstance,
    ModuleLoader, ModuleManifest, RuntimeConfig, WireType,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Alternates its answers between offset 1024 and the last two bytes of
/// the first page, so every second host write lands at the very end of
/// memory.
const EDGE_ALLOC_WAT: &str = r#"
(module
  (import "modbridge" "parseBuffer" (func $parse (param i32 i32) (result i64)))
  (import "modbridge" "at" (func $at (param i64 i32) (result i64)))
  (import "modbridge" "toStringBuf" (func $to_string (param i64) (result i64)))
  (memory (export "memory") 1)
  (global $allocs (mut i32) (i32.const 0))
  (func (export "modbridge_alloc") (param $size i32) (result i32)
    global.get $allocs
    i32.const 1
    i32.add
    global.set $allocs
    global.get $allocs
    i32.const 1
    i32.and
    if (result i32)
      i32.const 1024
    else
      i32.const 65534
    end)
  (func (export "search") (param i32 i32) (result i64)
    local.get 0
    local.get 1
    call $parse
    i32.const 0
    call $at
    call $to_string
    drop
    i64.const 0))
"#;

fn data_segment(value: &Value) -> (String, usize) {
    let bytes = encode_json(value);
    let escaped = bytes.iter().map(|b| format!("\\{:02x}", b)).collect();
    (escaped, bytes.len())
}

fn faulty_wat() -> String {
    let (error, len) = data_segment(&json!({
        "name": "TypeError",
        "message": "no results",
        "status": 404
    }));
    format!(
        r#"
(module
  (import "modbridge" "throwError" (func $throw (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{error}")
  (func (export "modbridge_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "search") (param i32 i32) (result i64)
    i32.const 16
    i32.const {len}
    call $throw
    drop
    i64.const 0)
  (func (export "searchFilters") (param i32 i32) (result i64)
    unreachable)
  (func (export "discoverListings") (param i32 i32) (result i64)
    i32.const 70000
    i64.load
    drop
    i64.const 0)
  (func (export "playlistItems") (param i32 i32) (result i64)
    i64.const 0))
"#
    )
}

fn listings_wat() -> String {
    let (error, len) = data_segment(&json!({"name": "Error", "message": "network unavailable"}));
    format!(
        r#"
(module
  (import "modbridge" "throwError" (func $throw (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{error}")
  (func (export "modbridge_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "discoverListings") (param i32 i32) (result i64)
    i32.const 16
    i32.const {len}
    call $throw
    drop
    i64.const 0)
  (func (export "searchFilters") (param i32 i32) (result i64)
    i64.const 0))
"#
    )
}

const PANIC_WAT: &str = r#"
(module
  (import "modbridge" "explode" (func $explode (result i32)))
  (memory (export "memory") 1)
  (func (export "modbridge_alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "search") (param i32 i32) (result i64)
    call $explode
    drop
    i64.const 0))
"#;

fn request_wat(resume: bool) -> String {
    let (request, len) = data_segment(&json!({"url": "https://films.example/search?q=batman"}));
    let resume = if resume {
        r#"(func (export "modbridge_resume") (param i64 i64 i32) (result i64)
    local.get 1)"#
    } else {
        ""
    };
    format!(
        r#"
(module
  (import "modbridge" "httpRequest" (func $request (param i32 i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{request}")
  (func (export "modbridge_alloc") (param i32) (result i32)
    i32.const 1024)
  {resume}
  (func (export "search") (param i32 i32) (result i64)
    i32.const 16
    i32.const {len}
    call $request))
"#
    )
}

fn module(wat: &str, capabilities: &[&str]) -> Module {
    let manifest = ModuleManifest {
        id: "wasm-films".into(),
        name: "Wasm Films".into(),
        version: "0.2.0".into(),
        entry_file: "module.wasm".into(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        description: None,
        icon: None,
        authors: vec![],
    };
    Module::new(manifest, wat.as_bytes().to_vec()).unwrap()
}

fn loader(config: RuntimeConfig, events: Arc<MemorySink>) -> ModuleLoader {
    ModuleLoader::new(config).unwrap().with_sink(events)
}

fn load(wat: &str) -> ModuleInstance {
    loader(RuntimeConfig::default(), Arc::new(MemorySink::new()))
        .without_network()
        .load(module(wat, &["json"]))
        .unwrap()
}

struct FixedClient;

#[async_trait]
impl HttpClient for FixedClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, GuestError> {
        Ok(HttpResponse::ok(request.url, "[]"))
    }
}

#[tokio::test]
async fn test_host_write_past_memory_end() {
    let instance = load(EDGE_ALLOC_WAT);
    assert_eq!(instance.format(), ModuleFormat::Wasm);

    let err = instance
        .call("search", vec![json!("batman")], None)
        .await
        .unwrap_err();
    match err {
        CoreError::OutOfBounds { offset, length, size } => {
            assert_eq!(offset, 65534);
            assert_eq!(length, 6);
            assert_eq!(size, 65536);
        }
        other => panic!("expected OutOfBounds, got {other:?}"),
    }
    assert_eq!(instance.state(), InstanceState::Ready);

    // Two bytes at 65534 end exactly at the memory boundary.
    let value = instance.call("search", vec![json!("ab")], None).await.unwrap();
    assert_eq!(value, Value::Null);
}

#[tokio::test]
async fn test_thrown_error_has_no_stack() {
    let instance = load(&faulty_wat());

    let err = instance.call("search", vec![], None).await.unwrap_err();
    let guest = err.guest().expect("guest error");
    assert_eq!(guest.name, "TypeError");
    assert_eq!(guest.message, "no results");
    assert_eq!(guest.status, Some(404));
    assert_eq!(guest.function_name, "search");
    assert!(guest.stack.is_none());
    assert_eq!(instance.state(), InstanceState::Ready);
}

#[tokio::test]
async fn test_thrown_network_error_leaves_instance_ready() {
    let instance = load(&listings_wat());

    let err = instance.call("discoverListings", vec![], None).await.unwrap_err();
    assert!(!err.is_fatal());
    let guest = err.guest().expect("guest error");
    assert_eq!(guest.name, "Error");
    assert_eq!(guest.message, "network unavailable");
    assert_eq!(guest.function_name, "discoverListings");
    assert_eq!(instance.state(), InstanceState::Ready);

    let value = instance.call("searchFilters", vec![], None).await.unwrap();
    assert_eq!(value, Value::Null);
}

#[tokio::test]
async fn test_host_function_panic_faults_instance() {
    let mut loader = loader(RuntimeConfig::default(), Arc::new(MemorySink::new())).without_network();
    loader
        .register_host_function(HostFunction::new(
            "explode",
            vec![],
            WireType::I32,
            Capability::Json,
            |_, _| panic!("lookup table missing"),
        ))
        .unwrap();
    let instance = loader.load(module(PANIC_WAT, &[])).unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let err = instance.call("search", vec![], Some(deadline)).await.unwrap_err();
    match &err {
        CoreError::FatalTrap { function_name, trap } => {
            assert_eq!(function_name, "search");
            assert!(trap.contains("lookup table missing"), "trap: {trap}");
        }
        other => panic!("expected FatalTrap, got {other:?}"),
    }
    assert_eq!(instance.state(), InstanceState::Faulted);

    let err = instance.call("search", vec![], None).await.unwrap_err();
    assert!(matches!(err, CoreError::Faulted(_)));
}

#[tokio::test]
async fn test_unreachable_is_a_runtime_error() {
    let instance = load(&faulty_wat());

    let err = instance.call("searchFilters", vec![], None).await.unwrap_err();
    assert!(!err.is_fatal());
    let guest = err.guest().expect("guest error");
    assert_eq!(guest.name, "RuntimeError");
    assert!(guest.stack.is_none());
    assert_eq!(instance.state(), InstanceState::Ready);
}

#[tokio::test]
async fn test_memory_fault_marks_instance_faulted() {
    let events = Arc::new(MemorySink::new());
    let instance = loader(RuntimeConfig::default(), events.clone())
        .without_network()
        .load(module(&faulty_wat(), &[]))
        .unwrap();

    let err = instance.call("discoverListings", vec![], None).await.unwrap_err();
    assert!(matches!(err, CoreError::FatalTrap { .. }));
    assert!(err.is_fatal());
    assert_eq!(instance.state(), InstanceState::Faulted);

    let err = instance.call("playlistItems", vec![], None).await.unwrap_err();
    assert!(matches!(err, CoreError::Faulted(_)));

    let faulted = events.events().into_iter().any(|e| {
        matches!(e.kind, EventKind::StateChanged { ref to, .. } if to == "faulted")
    });
    assert!(faulted);
}

#[tokio::test]
async fn test_host_reloads_faulted_instance() {
    let host = ModuleHost::new(
        loader(RuntimeConfig::default(), Arc::new(MemorySink::new())).without_network(),
    );
    let original = host.load_module(module(&faulty_wat(), &[])).unwrap();
    let id = original.id().to_string();

    // The retry faults as well; the replacement stays in the map.
    let err = host.call(&id, "discoverListings", vec![], None).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(original.state(), InstanceState::Unloaded);

    let value = host.call(&id, "playlistItems", vec![], None).await.unwrap();
    assert_eq!(value, Value::Null);

    let current = host.get(&id).unwrap();
    assert!(!Arc::ptr_eq(&current, &original));
    assert_eq!(current.id(), id);
    assert_eq!(current.state(), InstanceState::Ready);
    assert_eq!(host.len(), 1);
}

#[tokio::test]
async fn test_host_without_auto_reload() {
    let mut config = RuntimeConfig::default();
    config.call.auto_reload_on_fault = false;
    let host = ModuleHost::new(loader(config, Arc::new(MemorySink::new())).without_network());
    let instance = host.load_module(module(&faulty_wat(), &[])).unwrap();

    let err = host
        .call(instance.id(), "discoverListings", vec![], None)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    let err = host
        .call(instance.id(), "playlistItems", vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Faulted(_)));
    assert!(Arc::ptr_eq(&host.get(instance.id()).unwrap(), &instance));
}

#[tokio::test]
async fn test_pending_request_resumes_guest() {
    let instance = loader(RuntimeConfig::default(), Arc::new(MemorySink::new()))
        .with_http_client(Arc::new(FixedClient))
        .load(module(&request_wat(true), &["network"]))
        .unwrap();

    let value = instance.call("search", vec![], None).await.unwrap();
    assert_eq!(
        value,
        json!({
            "url": "https://films.example/search?q=batman",
            "status": 200,
            "headers": {},
            "body": "[]"
        })
    );
    assert_eq!(instance.metrics().request_count, 1);
}

#[tokio::test]
async fn test_rejection_without_resume_fails_call() {
    let instance = loader(RuntimeConfig::default(), Arc::new(MemorySink::new()))
        .without_network()
        .load(module(&request_wat(false), &["network"]))
        .unwrap();

    let err = instance.call("search", vec![], None).await.unwrap_err();
    let guest = err.guest().expect("guest error");
    assert_eq!(guest.name, "NetworkError");
    assert_eq!(guest.hostname.as_deref(), Some("films.example"));
    assert_eq!(instance.state(), InstanceState::Ready);
}

#[tokio::test]
async fn test_host_allow_list_denies_request() {
    let mut config = RuntimeConfig::default();
    config.network.allowed_hosts = vec!["api.example".into()];
    let instance = loader(config, Arc::new(MemorySink::new()))
        .with_http_client(Arc::new(FixedClient))
        .load(module(&request_wat(false), &["network"]))
        .unwrap();

    let err = instance.call("search", vec![], None).await.unwrap_err();
    let guest = err.guest().expect("guest error");
    assert_eq!(guest.name, "CapabilityDenied");
    assert_eq!(guest.hostname.as_deref(), Some("films.example"));
}
