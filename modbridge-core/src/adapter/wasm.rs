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

//! WebAssembly backend
//!
//! Core-module wasmtime embedding. Imports are bound from the shared
//! [`ImportTable`] under the `modbridge` namespace. Host functions never
//! suspend: `httpRequest` returns a pending id and the drive loop in
//! [`WasmAdapter::call_entry`] settles it, then re-enters the guest through
//! its `modbridge_resume` export.
//!
//! Guest exports:
//! - `memory`, `modbridge_alloc(size: i32) -> i32` (required)
//! - `modbridge_resume(pending: i64, result: i64, ok: i32) -> i64` (optional)
//! - entry points `(args_offset: i32, args_len: i32) -> i64`

use super::GuestAdapter;
use crate::abi::{
    HostCall, HostReturn, ImportTable, WireType, WireValue, ALLOC_EXPORT, ENTRY_POINTS,
    MEMORY_EXPORT, RESUME_EXPORT,
};
use crate::codec;
use crate::config::WasmConfig;
use crate::error::{CoreError, CoreResult, GuestError, LoadError};
use crate::memory::{write_checked, MemoryBridge, MemoryRegion, SliceMemory};
use crate::module::{Module, ModuleFormat};
use crate::pending::CancelFlag;
use crate::state::SharedState;
use crate::value::{EntryReturn, Handle};
use crate::IMPORT_NAMESPACE;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use wasmtime::{
    AsContextMut, Caller, Config, Engine, FuncType, Instance, Linker, Memory, Store, StoreLimits,
    StoreLimitsBuilder, Trap, TypedFunc, Val, ValType,
};

const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Shared engine plus compiled-module cache
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
    /// Compiled modules keyed by blake3 digest of their bytes.
    module_cache: DashMap<String, wasmtime::Module>,
}

impl WasmRuntime {
    pub fn new(config: &WasmConfig) -> Result<Self, LoadError> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.debug_info(config.debug_info);
        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| LoadError::Instantiate(format!("engine: {}", e)))?;

        Ok(Self {
            engine,
            config: config.clone(),
            module_cache: DashMap::new(),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &WasmConfig {
        &self.config
    }

    /// Compile a module, reusing the cached compilation when enabled.
    pub fn compile(&self, module: &Module) -> Result<wasmtime::Module, LoadError> {
        if self.config.cache_modules {
            if let Some(cached) = self.module_cache.get(module.digest()) {
                tracing::trace!(module_id = %module.id(), digest = %module.digest(), "module cache hit");
                return Ok(cached.clone());
            }
        }

        let compiled = wasmtime::Module::new(&self.engine, module.bytes())
            .map_err(|e| LoadError::Instantiate(format!("{}: {}", module.id(), e)))?;

        if self.config.cache_modules {
            self.module_cache
                .insert(module.digest().to_string(), compiled.clone());
        }
        Ok(compiled)
    }

    pub fn cached_modules(&self) -> usize {
        self.module_cache.len()
    }

    pub fn clear_cache(&self) {
        self.module_cache.clear();
    }
}

struct StoreData {
    state: SharedState,
    limits: StoreLimits,
}

/// One instantiated WebAssembly module
pub struct WasmAdapter {
    store: Store<StoreData>,
    _instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    resume: Option<TypedFunc<(i64, i64, i32), i64>>,
    entries: BTreeMap<String, TypedFunc<(i32, i32), i64>>,
    state: SharedState,
}

impl WasmAdapter {
    pub fn instantiate(
        runtime: &WasmRuntime,
        module: &Module,
        state: SharedState,
        imports: &ImportTable,
    ) -> Result<Self, LoadError> {
        let compiled = runtime.compile(module)?;
        let engine = runtime.engine();

        let mut linker: Linker<StoreData> = Linker::new(engine);
        for function in imports.iter() {
            let ty = FuncType::new(
                engine,
                function.params.iter().map(|p| val_type(*p)),
                [val_type(function.result)],
            );
            let name = function.name.clone();
            let function = function.clone();
            linker
                .func_new(
                    IMPORT_NAMESPACE,
                    &name,
                    ty,
                    move |mut caller: Caller<'_, StoreData>, params: &[Val], results: &mut [Val]| {
                        let args = params
                            .iter()
                            .map(from_val)
                            .collect::<CoreResult<Vec<_>>>()?;
                        let memory = caller_memory(&mut caller)?;
                        let state = caller.data().state.clone();

                        let returned = {
                            let mut guard = state.lock();
                            let bridge = SliceMemory(memory.data(&caller));
                            let mut call = HostCall {
                                state: &mut *guard,
                                memory: &bridge,
                            };
                            function.invoke(&mut call, &args)?
                        };

                        let value = match returned {
                            HostReturn::Value(value) => value,
                            HostReturn::Bytes(bytes) => {
                                let alloc = caller_alloc(&mut caller)?;
                                let region = place_bytes(&mut caller, &memory, &alloc, &bytes)?;
                                WireValue::I64(region.to_bits() as i64)
                            }
                        };
                        results[0] = to_val(value);
                        Ok(())
                    },
                )
                .map_err(|e| LoadError::HostFunction {
                    name,
                    reason: e.to_string(),
                })?;
        }

        let limits = StoreLimitsBuilder::new()
            .memory_size(runtime.config().max_memory_bytes)
            .instances(1)
            .build();
        let mut store = Store::new(
            engine,
            StoreData {
                state: state.clone(),
                limits,
            },
        );
        store.limiter(|data| &mut data.limits);

        let instance = linker
            .instantiate(&mut store, &compiled)
            .map_err(|e| LoadError::Instantiate(format!("{}: {}", module.id(), e)))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| LoadError::MissingExport(MEMORY_EXPORT.to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|e| LoadError::MissingExport(format!("{}: {}", ALLOC_EXPORT, e)))?;

        let resume = match instance.get_func(&mut store, RESUME_EXPORT) {
            Some(func) => Some(func.typed::<(i64, i64, i32), i64>(&store).map_err(|e| {
                LoadError::Instantiate(format!("{} has the wrong signature: {}", RESUME_EXPORT, e))
            })?),
            None => None,
        };

        let mut entries = BTreeMap::new();
        for name in ENTRY_POINTS {
            if let Some(func) = instance.get_func(&mut store, name) {
                let typed = func.typed::<(i32, i32), i64>(&store).map_err(|e| {
                    LoadError::Instantiate(format!("entry {} has the wrong signature: {}", name, e))
                })?;
                entries.insert(name.to_string(), typed);
            }
        }

        Ok(Self {
            store,
            _instance: instance,
            memory,
            alloc,
            resume,
            entries,
            state,
        })
    }

    fn place(&mut self, bytes: &[u8]) -> CoreResult<MemoryRegion> {
        place_bytes(&mut self.store, &self.memory, &self.alloc, bytes)
    }

    /// A rejection that reached the host without a resume export becomes
    /// the call's error.
    fn rejection(&self, entry: &str, handle: Handle) -> CoreError {
        let state = self.state.lock();
        let payload = codec::materialize(&state.arena, handle).unwrap_or_default();
        CoreError::Guest(GuestError::from_json(entry, &payload))
    }
}

#[async_trait]
impl GuestAdapter for WasmAdapter {
    fn format(&self) -> ModuleFormat {
        ModuleFormat::Wasm
    }

    fn exports(&self) -> Vec<String> {
        ENTRY_POINTS
            .iter()
            .filter(|name| self.entries.contains_key(**name))
            .map(|name| name.to_string())
            .collect()
    }

    fn has_export(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    async fn call_entry(
        &mut self,
        entry: &str,
        args: &[serde_json::Value],
        mut cancel: CancelFlag,
    ) -> CoreResult<Handle> {
        let func = self
            .entries
            .get(entry)
            .cloned()
            .ok_or_else(|| CoreError::EntryNotFound(entry.to_string()))?;

        let encoded = codec::encode_json(&serde_json::Value::Array(args.to_vec()));
        let region = self.place(&encoded)?;

        let mut returned = func
            .call(&mut self.store, (region.offset as i32, region.length as i32))
            .map_err(|e| translate_error(entry, e))?;

        loop {
            let id = match EntryReturn::from_bits(returned) {
                EntryReturn::Value(handle) => return Ok(handle),
                EntryReturn::Pending(id) => id,
            };

            let request = self.state.lock().requests.take(id);
            let request = request.ok_or_else(|| {
                CoreError::Decode(format!("entry {} returned unknown pending id {}", entry, id))
            })?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                outcome = request => outcome,
            };
            let (handle, ok) = self.state.lock().settle(outcome);

            match &self.resume {
                Some(resume) => {
                    returned = resume
                        .call(
                            &mut self.store,
                            (
                                EntryReturn::Pending(id).to_bits(),
                                handle.to_bits() as i64,
                                ok as i32,
                            ),
                        )
                        .map_err(|e| translate_error(entry, e))?;
                }
                None if ok => return Ok(handle),
                None => return Err(self.rejection(entry, handle)),
            }
        }
    }

    fn memory(&self) -> Box<dyn MemoryBridge + '_> {
        Box::new(SliceMemory(self.memory.data(&self.store)))
    }

    fn write_memory(&mut self, bytes: &[u8]) -> CoreResult<MemoryRegion> {
        self.place(bytes)
    }

    fn grow_memory(&mut self, additional: usize) -> CoreResult<usize> {
        let previous = self.memory.data_size(&self.store);
        let pages = additional.div_ceil(WASM_PAGE_SIZE) as u64;
        self.memory
            .grow(&mut self.store, pages)
            .map_err(|_| CoreError::OutOfBounds {
                offset: previous as u64,
                length: additional as u64,
                size: previous as u64,
            })?;
        Ok(previous)
    }
}

fn caller_memory(caller: &mut Caller<'_, StoreData>) -> CoreResult<Memory> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(|export| export.into_memory())
        .ok_or_else(|| LoadError::MissingExport(MEMORY_EXPORT.to_string()).into())
}

fn caller_alloc(caller: &mut Caller<'_, StoreData>) -> CoreResult<TypedFunc<i32, i32>> {
    let func = caller
        .get_export(ALLOC_EXPORT)
        .and_then(|export| export.into_func())
        .ok_or_else(|| CoreError::from(LoadError::MissingExport(ALLOC_EXPORT.to_string())))?;
    func.typed::<i32, i32>(&*caller)
        .map_err(|e| LoadError::MissingExport(format!("{}: {}", ALLOC_EXPORT, e)).into())
}

/// Ask the guest allocator for space and copy `bytes` there. An offset that
/// does not leave room for the bytes is `OutOfBounds`.
fn place_bytes(
    mut store: impl AsContextMut<Data = StoreData>,
    memory: &Memory,
    alloc: &TypedFunc<i32, i32>,
    bytes: &[u8],
) -> CoreResult<MemoryRegion> {
    let len = i32::try_from(bytes.len()).map_err(|_| CoreError::OutOfBounds {
        offset: 0,
        length: bytes.len() as u64,
        size: memory.data_size(&store) as u64,
    })?;
    let offset = alloc
        .call(&mut store, len)
        .map_err(|e| translate_error(ALLOC_EXPORT, e))?;
    write_checked(memory.data_mut(&mut store), offset as u32, bytes)
}

fn val_type(ty: WireType) -> ValType {
    match ty {
        WireType::I32 => ValType::I32,
        WireType::I64 => ValType::I64,
        WireType::F64 => ValType::F64,
    }
}

fn from_val(val: &Val) -> CoreResult<WireValue> {
    match val {
        Val::I32(v) => Ok(WireValue::I32(*v)),
        Val::I64(v) => Ok(WireValue::I64(*v)),
        Val::F64(bits) => Ok(WireValue::F64(f64::from_bits(*bits))),
        other => Err(CoreError::Decode(format!(
            "unsupported import argument {:?}",
            other
        ))),
    }
}

fn to_val(value: WireValue) -> Val {
    match value {
        WireValue::I32(v) => Val::I32(v),
        WireValue::I64(v) => Val::I64(v),
        WireValue::F64(v) => Val::F64(v.to_bits()),
    }
}

/// Traps that leave the instance in an unknown state.
fn is_fatal_trap(trap: &Trap) -> bool {
    matches!(
        trap,
        Trap::MemoryOutOfBounds
            | Trap::HeapMisaligned
            | Trap::StackOverflow
            | Trap::TableOutOfBounds
            | Trap::IndirectCallToNull
            | Trap::BadSignature
    )
}

/// Map a wasmtime error back onto the call error taxonomy. Errors raised by
/// host functions come back unchanged; traps carry only their code.
pub(crate) fn translate_error(function_name: &str, err: anyhow::Error) -> CoreError {
    let err = match err.downcast::<CoreError>() {
        Ok(core) => return core,
        Err(err) => err,
    };
    match err.downcast_ref::<Trap>() {
        Some(trap) if is_fatal_trap(trap) => CoreError::FatalTrap {
            function_name: function_name.to_string(),
            trap: trap.to_string(),
        },
        Some(trap) => CoreError::Guest(GuestError::new(
            function_name,
            "RuntimeError",
            trap.to_string(),
        )),
        None => CoreError::Guest(GuestError::new(
            function_name,
            "RuntimeError",
            err.to_string(),
        )),
    }
}
