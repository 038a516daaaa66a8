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

//! Module loader
//!
//! Takes a [`Module`] from `Unloaded` to a `Ready` [`ModuleInstance`]:
//! capability negotiation against the import table, host state setup, and
//! backend instantiation.

use crate::abi::{HostFunction, ImportTable};
use crate::adapter::{self, AdapterContext, GuestAdapter, WasmRuntime};
use crate::capabilities::GrantedCapabilities;
use crate::config::RuntimeConfig;
use crate::error::{CoreResult, LoadError};
use crate::instance::{InstanceId, InstanceState, ModuleInstance};
use crate::module::Module;
use crate::net::{HttpClient, ReqwestClient};
use crate::sink::{EventKind, InstanceSink, LogLevel, SharedSink, TracingSink};
use crate::state::{HostState, SharedState};
use std::path::Path;
use std::sync::Arc;

pub struct ModuleLoader {
    config: RuntimeConfig,
    wasm: WasmRuntime,
    imports: Arc<ImportTable>,
    sink: SharedSink,
    http: Option<Arc<dyn HttpClient>>,
}

impl ModuleLoader {
    /// Loader with the standard import table, a `tracing` sink and the
    /// default `reqwest` client.
    pub fn new(config: RuntimeConfig) -> CoreResult<Self> {
        config.validate()?;
        let wasm = WasmRuntime::new(&config.wasm)?;
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(&config.network)?);
        Ok(Self {
            config,
            wasm,
            imports: Arc::new(ImportTable::standard()),
            sink: Arc::new(TracingSink),
            http: Some(http),
        })
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    /// Reject every guest network request.
    pub fn without_network(mut self) -> Self {
        self.http = None;
        self
    }

    /// Add a host function to the import table of modules loaded from now on.
    pub fn register_host_function(&mut self, function: HostFunction) -> Result<(), LoadError> {
        tracing::debug!(name = %function.name, capability = %function.capability, "registering host function");
        Arc::make_mut(&mut self.imports).register(function)
    }

    pub fn imports(&self) -> &ImportTable {
        &self.imports
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn wasm_runtime(&self) -> &WasmRuntime {
        &self.wasm
    }

    pub fn load(&self, module: Module) -> Result<ModuleInstance, LoadError> {
        self.load_as(uuid::Uuid::new_v4().to_string(), module)
    }

    pub fn load_directory(&self, dir: &Path) -> Result<ModuleInstance, LoadError> {
        self.load(Module::from_directory(dir)?)
    }

    /// Load `module` under a caller-chosen instance id.
    pub fn load_as(&self, instance_id: InstanceId, module: Module) -> Result<ModuleInstance, LoadError> {
        let sink = Arc::new(InstanceSink::new(
            self.sink.clone(),
            module.id(),
            instance_id.clone(),
        ));
        sink.emit(
            LogLevel::Debug,
            EventKind::StateChanged {
                from: InstanceState::Unloaded.to_string(),
                to: InstanceState::Loading.to_string(),
            },
            format!("loading {} {}", module.id(), module.manifest().version),
        );

        match self.instantiate(&instance_id, &module, &sink) {
            Ok((host, adapter)) => {
                tracing::info!(
                    instance_id = %instance_id,
                    module_id = %module.id(),
                    format = %module.format(),
                    "module loaded"
                );
                Ok(ModuleInstance::new(instance_id, module, adapter, host, sink))
            }
            Err(e) => {
                tracing::warn!(module_id = %module.id(), error = %e, "module load failed");
                sink.emit(
                    LogLevel::Error,
                    EventKind::StateChanged {
                        from: InstanceState::Loading.to_string(),
                        to: InstanceState::Unloaded.to_string(),
                    },
                    e.to_string(),
                );
                sink.close();
                Err(e)
            }
        }
    }

    fn instantiate(
        &self,
        instance_id: &str,
        module: &Module,
        sink: &Arc<InstanceSink>,
    ) -> Result<(SharedState, Box<dyn GuestAdapter>), LoadError> {
        let declared = module.manifest().declared_capabilities()?;
        self.imports.offered_capabilities().negotiate(&declared)?;

        let granted = GrantedCapabilities::new(module.id(), declared)
            .with_allowed_hosts(self.config.network.allowed_hosts.clone());
        tracing::debug!(
            instance_id = %instance_id,
            module_id = %module.id(),
            capabilities = ?granted.all_granted().all().map(|c| c.to_string()).collect::<Vec<_>>(),
            "capabilities granted"
        );

        let host = HostState::new(granted, self.http.clone(), sink.clone()).into_shared();
        let adapter = adapter::instantiate(
            module,
            AdapterContext {
                state: host.clone(),
                imports: self.imports.clone(),
                config: &self.config,
                wasm: &self.wasm,
            },
        )?;
        Ok((host, adapter))
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("imports", &self.imports.len())
            .field("network", &self.http.is_some())
            .field("cached_modules", &self.wasm.cached_modules())
            .finish()
    }
}
