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

//! Module host - main entry point for the rest of the application
//!
//! Keeps the live instances, applies the default call deadline, and
//! replaces a faulted instance once before giving up on a call.

use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult, LoadError};
use crate::instance::{InstanceId, ModuleInstance};
use crate::loader::ModuleLoader;
use crate::module::Module;
use crate::schema::{ModuleRecord, Row};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

pub struct ModuleHost {
    loader: ModuleLoader,
    instances: DashMap<InstanceId, Arc<ModuleInstance>>,
}

impl ModuleHost {
    pub fn new(loader: ModuleLoader) -> Self {
        Self {
            loader,
            instances: DashMap::new(),
        }
    }

    pub fn with_config(config: RuntimeConfig) -> CoreResult<Self> {
        Ok(Self::new(ModuleLoader::new(config)?))
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn load_module(&self, module: Module) -> Result<Arc<ModuleInstance>, LoadError> {
        let instance = Arc::new(self.loader.load(module)?);
        self.instances
            .insert(instance.id().to_string(), instance.clone());
        Ok(instance)
    }

    pub fn load_directory(&self, dir: &Path) -> Result<Arc<ModuleInstance>, LoadError> {
        self.load_module(Module::from_directory(dir)?)
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<ModuleInstance>> {
        self.instances.get(instance_id).map(|entry| entry.clone())
    }

    /// Call `entry` on an instance.
    ///
    /// Without a deadline the configured default timeout applies. When the
    /// instance is (or becomes) faulted, it is unloaded, reloaded from the
    /// same module under the same id, and the call is retried once.
    pub async fn call(
        &self,
        instance_id: &str,
        entry: &str,
        args: Vec<serde_json::Value>,
        deadline: Option<Instant>,
    ) -> CoreResult<serde_json::Value> {
        let deadline = deadline.or_else(|| {
            self.loader
                .config()
                .call
                .default_timeout()
                .map(|timeout| Instant::now() + timeout)
        });

        let instance = self
            .get(instance_id)
            .ok_or_else(|| CoreError::Unloaded(instance_id.to_string()))?;

        match instance.call(entry, args.clone(), deadline).await {
            Err(e) if self.should_reload(&e) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    module_id = %instance.module_id(),
                    entry = %entry,
                    error = %e,
                    "instance faulted, reloading and retrying once"
                );
                let replacement = self.reload(&instance)?;
                replacement.call(entry, args, deadline).await
            }
            result => result,
        }
    }

    fn should_reload(&self, error: &CoreError) -> bool {
        self.loader.config().call.auto_reload_on_fault
            && (error.is_fatal() || matches!(error, CoreError::Faulted(_)))
    }

    /// Replace an instance with a fresh one built from the same module.
    pub fn reload(&self, instance: &Arc<ModuleInstance>) -> Result<Arc<ModuleInstance>, LoadError> {
        instance.unload();
        let replacement = Arc::new(
            self.loader
                .load_as(instance.id().to_string(), instance.module().clone())?,
        );
        self.instances
            .insert(replacement.id().to_string(), replacement.clone());
        Ok(replacement)
    }

    /// Remove and unload an instance. Returns whether it existed.
    pub fn unload(&self, instance_id: &str) -> bool {
        match self.instances.remove(instance_id) {
            Some((_, instance)) => {
                instance.unload();
                true
            }
            None => false,
        }
    }

    pub fn unload_all(&self) {
        let ids: Vec<_> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unload(&id);
        }
    }

    pub fn instances(&self) -> Vec<Arc<ModuleInstance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Persistence rows for every live instance.
    pub fn records(&self) -> CoreResult<Vec<Row>> {
        self.instances
            .iter()
            .map(|e| ModuleRecord::from_instance(e.value()).to_row())
            .collect()
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("loader", &self.loader)
            .field("instances", &self.instances.len())
            .finish()
    }
}
