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

//! Modbridge Core
//!
//! Host/guest interop for sandboxed scraper modules. A module is either a
//! QuickJS script or a WebAssembly binary; both are driven through the same
//! [`ModuleInstance`] API and exchange JSON-shaped values with the host as
//! tagged values in a per-call handle arena.
//!
//! # Architecture
//!
//! - **Tagged values** ([`codec`]): a little-endian, self-describing byte
//!   format decoded into the [`HostObjectArena`].
//! - **Handles** ([`value`]): generation-checked indices into the arena, so
//!   a handle from an earlier call fails with `StaleHandle` instead of
//!   aliasing a newer value.
//! - **Memory bridge** ([`memory`]): bounds-checked reads and writes over
//!   guest linear memory or the script staging buffer.
//! - **Adapters** ([`adapter`]): wasmtime and rquickjs behind one
//!   [`GuestAdapter`] trait.
//! - **Async calls** ([`pending`]): guest network requests are polled by the
//!   call that issued them, under a deadline and a cancel flag.
//!
//! # Example
//!
//! ```rust,ignore
//! use modbridge_core::{ModuleHost, RuntimeConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() {
//!     let host = ModuleHost::with_config(RuntimeConfig::default()).unwrap();
//!     let instance = host.load_directory(Path::new("./batflix")).unwrap();
//!
//!     let results = host
//!         .call(instance.id(), "search", vec![serde_json::json!("batman")], None)
//!         .await
//!         .unwrap();
//!     println!("{results}");
//! }
//! ```

pub mod abi;
pub mod adapter;
pub mod arena;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod instance;
pub mod loader;
pub mod manifest;
pub mod memory;
pub mod module;
pub mod net;
pub mod pending;
pub mod schema;
pub mod sink;
pub mod state;
pub mod value;
pub mod view;

// Re-exports
pub use abi::{HostCall, HostFunction, HostReturn, ImportTable, WireType, WireValue, ENTRY_POINTS};
pub use adapter::{GuestAdapter, ScriptAdapter, WasmAdapter, WasmRuntime};
pub use arena::{HostObjectArena, ScopeToken};
pub use capabilities::{Capability, CapabilitySet, GrantedCapabilities};
pub use config::{CallConfig, NetworkConfig, RuntimeConfig, ScriptConfig, WasmConfig};
pub use error::{CoreError, CoreResult, GuestError, LoadError};
pub use host::ModuleHost;
pub use instance::{InstanceId, InstanceState, ModuleInstance};
pub use loader::ModuleLoader;
pub use manifest::ModuleManifest;
pub use memory::{MemoryBridge, MemoryRegion, StagingBuffer};
pub use module::{Module, ModuleFormat};
pub use net::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use pending::{CancelFlag, PendingCall};
pub use schema::{EntitySchema, ModuleRecord, Row};
pub use sink::{EventKind, LogLevel, LogSink, MemorySink, ModuleEvent, SharedSink, TracingSink};
pub use state::InstanceMetrics;
pub use value::{EntryReturn, FunctionRef, Handle, PtrKind, TaggedValue};
pub use view::ValueView;

/// Crate version, reported in the default user agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the tagged-value wire format and import table
pub const ABI_VERSION: &str = "1.0.0";

/// Import namespace for host functions
pub const IMPORT_NAMESPACE: &str = "modbridge";

/// Module manifest filename
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Alternate manifest filename for hand-written modules
pub const MANIFEST_TOML_FILENAME: &str = "manifest.toml";
