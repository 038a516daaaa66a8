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

//! Runtime configuration.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Configuration for loading and calling modules.
///
/// # Example TOML Configuration
///
/// ```toml
/// [wasm]
/// max_memory_bytes = 33554432
///
/// [call]
/// default_timeout_ms = 10000
///
/// [network]
/// allowed_hosts = ["example.com"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub wasm: WasmConfig,

    #[serde(default)]
    pub script: ScriptConfig,

    #[serde(default)]
    pub call: CallConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// WebAssembly backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasmConfig {
    /// Linear memory cap per instance.
    #[serde(default = "default_memory_bytes")]
    pub max_memory_bytes: usize,

    /// Cache compiled modules by content digest.
    #[serde(default = "default_true")]
    pub cache_modules: bool,

    #[serde(default)]
    pub debug_info: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_memory_bytes(),
            cache_modules: true,
            debug_info: false,
        }
    }
}

/// Scripting backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "default_memory_bytes")]
    pub memory_limit_bytes: usize,

    #[serde(default = "default_stack_bytes")]
    pub max_stack_bytes: usize,

    /// Initial staging buffer size.
    #[serde(default = "default_staging_initial")]
    pub staging_initial_bytes: usize,

    /// Staging buffer growth cap.
    #[serde(default = "default_staging_max")]
    pub staging_max_bytes: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_bytes(),
            max_stack_bytes: default_stack_bytes(),
            staging_initial_bytes: default_staging_initial(),
            staging_max_bytes: default_staging_max(),
        }
    }
}

/// Call scheduling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Deadline applied when the caller supplies none; `None` disables it.
    #[serde(default = "default_call_timeout")]
    pub default_timeout_ms: Option<u64>,

    /// Reload a faulted instance and retry the call once.
    #[serde(default = "default_true")]
    pub auto_reload_on_fault: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_call_timeout(),
            auto_reload_on_fault: true,
        }
    }
}

impl CallConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings for the default HTTP client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Empty allows any host a module declares.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_ms: default_request_timeout(),
            allowed_hosts: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_bytes() -> usize {
    64 * MIB
}

fn default_stack_bytes() -> usize {
    MIB
}

fn default_staging_initial() -> usize {
    64 * 1024
}

fn default_staging_max() -> usize {
    16 * MIB
}

fn default_call_timeout() -> Option<u64> {
    Some(30_000)
}

fn default_user_agent() -> String {
    format!("modbridge/{}", crate::VERSION)
}

fn default_request_timeout() -> u64 {
    15_000
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.wasm.max_memory_bytes < 64 * 1024 {
            return Err(CoreError::Config(
                "wasm.max_memory_bytes must allow at least one 64 KiB page".into(),
            ));
        }
        if self.script.staging_initial_bytes > self.script.staging_max_bytes {
            return Err(CoreError::Config(
                "script.staging_initial_bytes exceeds script.staging_max_bytes".into(),
            ));
        }
        if self.script.staging_max_bytes > u32::MAX as usize {
            return Err(CoreError::Config(
                "script.staging_max_bytes must fit a 32-bit offset".into(),
            ));
        }
        if self.call.default_timeout_ms == Some(0) {
            return Err(CoreError::Config(
                "call.default_timeout_ms must be positive; omit it to disable".into(),
            ));
        }
        if self.network.request_timeout_ms == 0 {
            return Err(CoreError::Config(
                "network.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
