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

//! Import/export function table
//!
//! The import table is the ABI surface guest code calls into. Both guest
//! backends bind the same [`ImportTable`], so a module sees identical names,
//! signatures and semantics whichever runtime executes it.
//!
//! Handles travel as `i64` (`(generation << 32) | index`), regions as `i64`
//! (`(length << 32) | offset`), and pending request ids as `i64` with bit 63
//! set.

use crate::capabilities::{Capability, CapabilitySet};
use crate::codec;
use crate::error::{CoreError, CoreResult, GuestError, LoadError};
use crate::memory::{MemoryBridge, MemoryRegion};
use crate::net::HttpRequest;
use crate::sink::{EventKind, LogLevel};
use crate::state::HostState;
use crate::value::{EntryReturn, Handle};
use crate::view;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Entry points a module may export.
pub const ENTRY_POINTS: [&str; 7] = [
    "searchFilters",
    "search",
    "discoverListings",
    "playlistDetails",
    "playlistItems",
    "playlistEpisodeSources",
    "playlistEpisodeServer",
];

/// Required WebAssembly export: linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Required WebAssembly export: `modbridge_alloc(size: i32) -> i32`.
pub const ALLOC_EXPORT: &str = "modbridge_alloc";

/// Optional WebAssembly export:
/// `modbridge_resume(pending: i64, result: i64, ok: i32) -> i64`.
pub const RESUME_EXPORT: &str = "modbridge_resume";

/// Primitive type of an import parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    I32,
    I64,
    F64,
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::I32 => f.write_str("i32"),
            WireType::I64 => f.write_str("i64"),
            WireType::F64 => f.write_str("f64"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireValue {
    I32(i32),
    I64(i64),
    F64(f64),
}

impl WireValue {
    pub fn wire_type(&self) -> WireType {
        match self {
            WireValue::I32(_) => WireType::I32,
            WireValue::I64(_) => WireType::I64,
            WireValue::F64(_) => WireType::F64,
        }
    }

    pub fn as_i32(&self) -> CoreResult<i32> {
        match self {
            WireValue::I32(v) => Ok(*v),
            other => Err(wire_mismatch(WireType::I32, other.wire_type())),
        }
    }

    pub fn as_i64(&self) -> CoreResult<i64> {
        match self {
            WireValue::I64(v) => Ok(*v),
            other => Err(wire_mismatch(WireType::I64, other.wire_type())),
        }
    }

    pub fn as_f64(&self) -> CoreResult<f64> {
        match self {
            WireValue::F64(v) => Ok(*v),
            other => Err(wire_mismatch(WireType::F64, other.wire_type())),
        }
    }

    pub fn as_handle(&self) -> CoreResult<Handle> {
        Ok(Handle::from_bits(self.as_i64()? as u64))
    }

    pub fn handle(handle: Handle) -> Self {
        WireValue::I64(handle.to_bits() as i64)
    }
}

fn wire_mismatch(expected: WireType, found: WireType) -> CoreError {
    CoreError::Decode(format!("expected {} argument, found {}", expected, found))
}

/// Borrowed context for one host function invocation
pub struct HostCall<'a> {
    pub state: &'a mut HostState,
    /// Guest memory, read-only while the handler runs.
    pub memory: &'a dyn MemoryBridge,
}

impl HostCall<'_> {
    fn region(&self, offset: &WireValue, length: &WireValue) -> CoreResult<MemoryRegion> {
        Ok(MemoryRegion::from_parts(offset.as_i32()?, length.as_i32()?))
    }

    fn read_str(&self, offset: &WireValue, length: &WireValue) -> CoreResult<&str> {
        self.memory.read_str(self.region(offset, length)?)
    }

    /// Decode a tagged value the guest wrote into its memory and copy it out
    /// as JSON.
    fn read_value(&mut self, offset: &WireValue, length: &WireValue) -> CoreResult<serde_json::Value> {
        let region = self.region(offset, length)?;
        let bytes = self.memory.read(region)?;
        let handle = codec::decode_into(&mut self.state.arena, bytes)?;
        codec::materialize(&self.state.arena, handle)
    }
}

/// What a host function produced
#[derive(Debug, Clone, PartialEq)]
pub enum HostReturn {
    Value(WireValue),
    /// Bytes the adapter must place in guest memory; the guest receives the
    /// packed region.
    Bytes(Vec<u8>),
}

pub type HostHandler =
    Arc<dyn Fn(&mut HostCall<'_>, &[WireValue]) -> CoreResult<HostReturn> + Send + Sync>;

/// One importable host function
#[derive(Clone)]
pub struct HostFunction {
    pub name: String,
    pub params: Vec<WireType>,
    pub result: WireType,
    pub capability: Capability,
    handler: HostHandler,
}

impl HostFunction {
    pub fn new<F>(
        name: impl Into<String>,
        params: Vec<WireType>,
        result: WireType,
        capability: Capability,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut HostCall<'_>, &[WireValue]) -> CoreResult<HostReturn> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params,
            result,
            capability,
            handler: Arc::new(handler),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Check arguments and capability, then run the handler.
    pub fn invoke(&self, call: &mut HostCall<'_>, args: &[WireValue]) -> CoreResult<HostReturn> {
        if args.len() != self.params.len() {
            return Err(CoreError::Decode(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.params.len(),
                args.len()
            )));
        }
        for (param, arg) in self.params.iter().zip(args) {
            if *param != arg.wire_type() {
                return Err(wire_mismatch(*param, arg.wire_type()));
            }
        }

        if let Err(e) = call.state.capabilities.check(&self.capability) {
            call.state.sink.emit(
                LogLevel::Warn,
                EventKind::CapabilityDenied {
                    capability: self.capability.to_string(),
                },
                format!("{} called without capability {}", self.name, self.capability),
            );
            return Err(e);
        }

        call.state.metrics.record_host_call();
        (self.handler)(call, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("capability", &self.capability)
            .finish()
    }
}

/// Ordered catalogue of host functions
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    functions: Vec<HostFunction>,
    index: HashMap<String, usize>,
}

impl ImportTable {
    /// Empty table. Most callers want [`ImportTable::standard`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard `modbridge` imports.
    pub fn standard() -> Self {
        let mut table = Self::new();
        for function in standard_imports() {
            // Standard names are unique
            let _ = table.register(function);
        }
        table
    }

    /// Add a host function. Names must be unique.
    pub fn register(&mut self, function: HostFunction) -> Result<(), LoadError> {
        if function.name.is_empty() || function.name.starts_with("__") {
            return Err(LoadError::HostFunction {
                name: function.name,
                reason: "reserved or empty name".to_string(),
            });
        }
        if self.index.contains_key(&function.name) {
            return Err(LoadError::HostFunction {
                name: function.name,
                reason: "already registered".to_string(),
            });
        }
        self.index.insert(function.name.clone(), self.functions.len());
        self.functions.push(function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.index.get(name).map(|i| &self.functions[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostFunction> {
        self.functions.iter()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Capabilities a module may declare against this table.
    pub fn offered_capabilities(&self) -> CapabilitySet {
        self.functions.iter().map(|f| f.capability.clone()).collect()
    }
}

fn handle_result(handle: Handle) -> CoreResult<HostReturn> {
    Ok(HostReturn::Value(WireValue::handle(handle)))
}

fn standard_imports() -> Vec<HostFunction> {
    use WireType::*;

    vec![
        HostFunction::new("parseBuffer", vec![I32, I32], I64, Capability::Json, |call, args| {
            let region = call.region(&args[0], &args[1])?;
            let bytes = call.memory.read(region)?;
            handle_result(codec::decode_into(&mut call.state.arena, bytes)?)
        }),
        HostFunction::new("kindOf", vec![I64], I32, Capability::Json, |call, args| {
            let kind = view::kind_of(&call.state.arena, args[0].as_handle()?)?;
            Ok(HostReturn::Value(WireValue::I32(kind.tag() as i32)))
        }),
        HostFunction::new("keysOf", vec![I64], I64, Capability::Json, |call, args| {
            handle_result(view::keys_of(&mut call.state.arena, args[0].as_handle()?)?)
        }),
        HostFunction::new("lengthOf", vec![I64], I32, Capability::Json, |call, args| {
            let len = view::length_of(&call.state.arena, args[0].as_handle()?)?;
            Ok(HostReturn::Value(WireValue::I32(len as i32)))
        }),
        HostFunction::new("get", vec![I64, I32, I32], I64, Capability::Json, |call, args| {
            let handle = args[0].as_handle()?;
            let key = call.read_str(&args[1], &args[2])?;
            handle_result(view::get(&call.state.arena, handle, key)?)
        }),
        HostFunction::new("at", vec![I64, I32], I64, Capability::Json, |call, args| {
            let index = args[1].as_i32()? as i64;
            handle_result(view::at(&call.state.arena, args[0].as_handle()?, index)?)
        }),
        HostFunction::new("toStringBuf", vec![I64], I64, Capability::Json, |call, args| {
            let s = view::to_str(&call.state.arena, args[0].as_handle()?)?;
            Ok(HostReturn::Bytes(s.as_bytes().to_vec()))
        }),
        HostFunction::new("toNumber", vec![I64], F64, Capability::Json, |call, args| {
            let n = view::to_number(&call.state.arena, args[0].as_handle()?)?;
            Ok(HostReturn::Value(WireValue::F64(n)))
        }),
        HostFunction::new("toBool", vec![I64], I32, Capability::Json, |call, args| {
            let b = view::to_bool(&call.state.arena, args[0].as_handle()?)?;
            Ok(HostReturn::Value(WireValue::I32(b as i32)))
        }),
        HostFunction::new("httpRequest", vec![I32, I32], I64, Capability::Network, |call, args| {
            let request = HttpRequest::from_json(call.read_value(&args[0], &args[1])?)?;
            let id = call.state.issue_request(request);
            Ok(HostReturn::Value(WireValue::I64(EntryReturn::Pending(id).to_bits())))
        }),
        HostFunction::new("throwError", vec![I32, I32], I32, Capability::Json, |call, args| {
            let value = call.read_value(&args[0], &args[1])?;
            Err(CoreError::Guest(GuestError::from_json(
                call.state.entry_name(),
                &value,
            )))
        }),
        HostFunction::new("log", vec![I32, I32, I32], I32, Capability::Log, |call, args| {
            let level = LogLevel::from(args[0].as_i32()?);
            let message = call.read_str(&args[1], &args[2])?.to_string();
            call.state.sink.emit(level, EventKind::GuestLog, message);
            Ok(HostReturn::Value(WireValue::I32(0)))
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GrantedCapabilities;
    use crate::memory::SliceMemory;
    use crate::sink::{InstanceSink, MemorySink};
    use crate::value::PtrKind;
    use serde_json::json;

    fn state(caps: &[&str]) -> HostState {
        let sink = Arc::new(InstanceSink::new(Arc::new(MemorySink::new()), "m", "i"));
        let granted = GrantedCapabilities::new("m", CapabilitySet::parse(caps.iter().copied()).unwrap());
        HostState::new(granted, None, sink)
    }

    fn call(
        table: &ImportTable,
        state: &mut HostState,
        memory: &[u8],
        name: &str,
        args: &[WireValue],
    ) -> CoreResult<HostReturn> {
        let memory = SliceMemory(memory);
        let mut call = HostCall {
            state,
            memory: &memory,
        };
        table.get(name).unwrap().invoke(&mut call, args)
    }

    fn as_handle(ret: HostReturn) -> Handle {
        match ret {
            HostReturn::Value(v) => v.as_handle().unwrap(),
            other => panic!("expected handle, got {:?}", other),
        }
    }

    #[test]
    fn test_standard_table_shape() {
        let table = ImportTable::standard();
        assert_eq!(table.len(), 12);
        assert_eq!(table.get("get").unwrap().arity(), 3);
        assert_eq!(table.get("toNumber").unwrap().result, WireType::F64);
        let offered = table.offered_capabilities();
        assert!(offered.has(&Capability::Network));
        assert!(offered.has(&Capability::Log));
    }

    #[test]
    fn test_parse_and_walk() {
        let table = ImportTable::standard();
        let mut state = state(&["json"]);
        let mut memory = codec::encode_json(&json!({"title": "Batman", "year": 1989}));
        let len = memory.len() as i32;
        memory.extend_from_slice(b"title");

        let root = as_handle(
            call(&table, &mut state, &memory, "parseBuffer", &[WireValue::I32(0), WireValue::I32(len)]).unwrap(),
        );
        let title = as_handle(
            call(
                &table,
                &mut state,
                &memory,
                "get",
                &[WireValue::handle(root), WireValue::I32(len), WireValue::I32(5)],
            )
            .unwrap(),
        );
        assert_eq!(
            call(&table, &mut state, &memory, "toStringBuf", &[WireValue::handle(title)]).unwrap(),
            HostReturn::Bytes(b"Batman".to_vec())
        );
        assert_eq!(
            call(&table, &mut state, &memory, "kindOf", &[WireValue::handle(root)]).unwrap(),
            HostReturn::Value(WireValue::I32(PtrKind::Object.tag() as i32))
        );
        assert_eq!(state.metrics.host_call_count, 4);
    }

    #[test]
    fn test_get_missing_key_returns_null_handle() {
        let table = ImportTable::standard();
        let mut state = state(&["json"]);
        let mut memory = codec::encode_json(&json!({"a": 1}));
        let len = memory.len() as i32;
        memory.extend_from_slice(b"zz");
        let root = as_handle(
            call(&table, &mut state, &memory, "parseBuffer", &[WireValue::I32(0), WireValue::I32(len)]).unwrap(),
        );
        let missing = as_handle(
            call(
                &table,
                &mut state,
                &memory,
                "get",
                &[WireValue::handle(root), WireValue::I32(len), WireValue::I32(2)],
            )
            .unwrap(),
        );
        assert!(missing.is_null());
    }

    #[test]
    fn test_out_of_bounds_region() {
        let table = ImportTable::standard();
        let mut state = state(&["json"]);
        let err = call(&table, &mut state, &[0; 8], "parseBuffer", &[WireValue::I32(4), WireValue::I32(16)])
            .unwrap_err();
        assert!(matches!(err, CoreError::OutOfBounds { .. }));
    }

    #[test]
    fn test_throw_error_carries_payload() {
        let table = ImportTable::standard();
        let mut state = state(&["json"]);
        state.current_entry = Some("discoverListings".into());
        let memory = codec::encode_json(&json!({"message": "network unavailable"}));
        let err = call(
            &table,
            &mut state,
            &memory,
            "throwError",
            &[WireValue::I32(0), WireValue::I32(memory.len() as i32)],
        )
        .unwrap_err();
        let guest = err.guest().unwrap();
        assert_eq!(guest.message, "network unavailable");
        assert_eq!(guest.function_name, "discoverListings");
        assert!(guest.stack.is_none());
    }

    #[test]
    fn test_log_requires_capability() {
        let table = ImportTable::standard();
        let mut state = state(&["json"]);
        let err = call(
            &table,
            &mut state,
            b"hi",
            "log",
            &[WireValue::I32(2), WireValue::I32(0), WireValue::I32(2)],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::CapabilityDenied(_)));
    }

    #[test]
    fn test_http_request_returns_pending() {
        let table = ImportTable::standard();
        let mut state = state(&["network"]);
        let memory = codec::encode_json(&json!("https://example.com/search"));
        let ret = call(
            &table,
            &mut state,
            &memory,
            "httpRequest",
            &[WireValue::I32(0), WireValue::I32(memory.len() as i32)],
        )
        .unwrap();
        match ret {
            HostReturn::Value(WireValue::I64(bits)) => {
                assert_eq!(EntryReturn::from_bits(bits), EntryReturn::Pending(1))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.requests.len(), 1);
    }

    #[test]
    fn test_register_custom_function() {
        let mut table = ImportTable::standard();
        table
            .register(HostFunction::new(
                "double",
                vec![WireType::F64],
                WireType::F64,
                Capability::Custom("math".into()),
                |_, args| Ok(HostReturn::Value(WireValue::F64(args[0].as_f64()? * 2.0))),
            ))
            .unwrap();
        assert!(table
            .offered_capabilities()
            .has(&Capability::Custom("math".into())));
        assert!(table
            .register(HostFunction::new("get", vec![], WireType::I32, Capability::Json, |_, _| {
                Ok(HostReturn::Value(WireValue::I32(0)))
            }))
            .is_err());

        let mut state = state(&["math"]);
        assert_eq!(
            call(&table, &mut state, &[], "double", &[WireValue::F64(2.5)]).unwrap(),
            HostReturn::Value(WireValue::F64(5.0))
        );
        assert!(call(&table, &mut state, &[], "double", &[WireValue::I32(1)]).is_err());
    }
}
