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

//! Guest runtime adapters
//!
//! One [`GuestAdapter`] implementation per backend. The backend is chosen
//! at load time from the module's detected [`ModuleFormat`]; callers above
//! this layer never see which engine runs a module.

pub mod script;
pub mod wasm;

pub use script::ScriptAdapter;
pub use wasm::{WasmAdapter, WasmRuntime};

use crate::abi::ImportTable;
use crate::config::RuntimeConfig;
use crate::error::{CoreResult, LoadError};
use crate::memory::{MemoryBridge, MemoryRegion};
use crate::module::{Module, ModuleFormat};
use crate::pending::CancelFlag;
use crate::state::SharedState;
use crate::value::Handle;
use async_trait::async_trait;
use std::sync::Arc;

/// Capability interface every guest backend satisfies
#[async_trait]
pub trait GuestAdapter: Send {
    fn format(&self) -> ModuleFormat;

    /// Entry points this module provides.
    fn exports(&self) -> Vec<String>;

    fn has_export(&self, name: &str) -> bool {
        self.exports().iter().any(|e| e == name)
    }

    /// Run an entry point until it produces a value, settling any pending
    /// network requests it issues along the way. The result lives in the
    /// arena's current scope.
    async fn call_entry(
        &mut self,
        entry: &str,
        args: &[serde_json::Value],
        cancel: CancelFlag,
    ) -> CoreResult<Handle>;

    /// The guest's byte buffer.
    fn memory(&self) -> Box<dyn MemoryBridge + '_>;

    /// Copy bytes into guest memory at a host-chosen offset.
    fn write_memory(&mut self, bytes: &[u8]) -> CoreResult<MemoryRegion>;

    /// Grow guest memory by at least `additional` bytes. Returns the
    /// previous size.
    fn grow_memory(&mut self, additional: usize) -> CoreResult<usize>;

    /// Drop per-call guest-side bookkeeping.
    fn finish_call(&mut self) {}
}

/// Everything an adapter needs to instantiate a module
pub struct AdapterContext<'a> {
    pub state: SharedState,
    pub imports: Arc<ImportTable>,
    pub config: &'a RuntimeConfig,
    pub wasm: &'a WasmRuntime,
}

/// Instantiate `module` on the backend matching its format.
pub fn instantiate(
    module: &Module,
    ctx: AdapterContext<'_>,
) -> Result<Box<dyn GuestAdapter>, LoadError> {
    let adapter: Box<dyn GuestAdapter> = match module.format() {
        ModuleFormat::Wasm => Box::new(WasmAdapter::instantiate(
            ctx.wasm,
            module,
            ctx.state,
            &ctx.imports,
        )?),
        ModuleFormat::Script => Box::new(ScriptAdapter::instantiate(
            module,
            ctx.state,
            ctx.imports,
            &ctx.config.script,
        )?),
    };
    tracing::debug!(
        module_id = %module.id(),
        format = %module.format(),
        exports = ?adapter.exports(),
        "module instantiated"
    );
    Ok(adapter)
}
