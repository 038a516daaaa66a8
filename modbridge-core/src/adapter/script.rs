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

//! Scripting backend
//!
//! Runs a module's source in an embedded QuickJS runtime. Entry points are
//! global functions; the bridge prelude (`prelude.js`) wraps each call so a
//! returned promise settles into a slot the host polls between job runs.
//!
//! The import table is bound natively onto the `modbridge` global. Where an
//! import works on bytes, a host-owned [`StagingBuffer`] stands in for linear
//! memory, so script and WebAssembly guests speak the same buffer protocol.

use super::GuestAdapter;
use crate::arena::HostObjectArena;
use crate::abi::{HostCall, HostFunction, HostReturn, ImportTable, WireType, WireValue, ENTRY_POINTS};
use crate::codec::{self, MAX_DEPTH};
use crate::config::ScriptConfig;
use crate::error::{CoreError, CoreResult, GuestError, LoadError};
use crate::memory::{MemoryBridge, MemoryRegion, StagingBuffer};
use crate::module::{Module, ModuleFormat};
use crate::net::RequestOutcome;
use crate::pending::CancelFlag;
use crate::state::SharedState;
use crate::value::{FunctionRef, Handle, TaggedValue};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use rquickjs::function::Rest;
use rquickjs::{
    BigInt, CatchResultExt, Context, Ctx, Exception, Function, IntoJs, Object, Runtime, Type,
    Value,
};
use std::sync::Arc;

const PRELUDE: &str = include_str!("prelude.js");

const NATIVE_GLOBAL: &str = "__modbridge_native";
const INVOKE_FN: &str = "__modbridge_invoke";
const TAKE_FN: &str = "__modbridge_take";
const COMPLETE_FN: &str = "__modbridge_complete";
const RESET_FN: &str = "__modbridge_reset";

type SharedStaging = Arc<Mutex<StagingBuffer>>;

/// One QuickJS runtime running one module
pub struct ScriptAdapter {
    // Field order matters: the context must drop before its runtime.
    context: Context,
    runtime: Runtime,
    state: SharedState,
    staging: SharedStaging,
    exports: Vec<String>,
    module_id: String,
}

impl ScriptAdapter {
    pub fn instantiate(
        module: &Module,
        state: SharedState,
        imports: Arc<ImportTable>,
        config: &ScriptConfig,
    ) -> Result<Self, LoadError> {
        let source = module
            .source()
            .ok_or_else(|| LoadError::UnsupportedFormat(module.manifest().entry_file.clone()))?;

        let runtime =
            Runtime::new().map_err(|e| LoadError::Instantiate(format!("runtime: {}", e)))?;
        runtime.set_memory_limit(config.memory_limit_bytes);
        runtime.set_max_stack_size(config.max_stack_bytes);
        let context = Context::full(&runtime)
            .map_err(|e| LoadError::Instantiate(format!("context: {}", e)))?;

        let staging = Arc::new(Mutex::new(StagingBuffer::new(
            config.staging_initial_bytes,
            config.staging_max_bytes,
        )));

        let exports = context.with(|ctx| -> Result<Vec<String>, LoadError> {
            install_natives(&ctx, &imports, &state, &staging).map_err(|e| {
                LoadError::HostFunction {
                    name: NATIVE_GLOBAL.to_string(),
                    reason: e.to_string(),
                }
            })?;
            ctx.eval::<(), _>(PRELUDE)
                .catch(&ctx)
                .map_err(|e| LoadError::Instantiate(format!("bridge prelude: {}", e)))?;
            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|e| LoadError::Instantiate(format!("{}: {}", module.id(), e)))?;

            let globals = ctx.globals();
            Ok(ENTRY_POINTS
                .iter()
                .filter(|name| {
                    globals
                        .get::<_, Value>(**name)
                        .map(|v| v.is_function())
                        .unwrap_or(false)
                })
                .map(|name| name.to_string())
                .collect())
        })?;

        Ok(Self {
            context,
            runtime,
            state,
            staging,
            exports,
            module_id: module.id().to_string(),
        })
    }

    /// Run queued promise jobs until the queue is empty.
    fn run_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => {
                    tracing::debug!(module_id = %self.module_id, "script job raised an exception");
                }
            }
        }
    }

    fn start(&self, entry: &str, args_json: &str) -> CoreResult<()> {
        self.context.with(|ctx| {
            let invoke: Function = ctx
                .globals()
                .get(INVOKE_FN)
                .map_err(|e| internal_error(entry, e.to_string()))?;
            invoke
                .call::<_, ()>((entry, args_json))
                .catch(&ctx)
                .map_err(|e| internal_error(entry, e.to_string()))
        })
    }

    /// Collect the entry point's settlement, if it has settled.
    fn take_settled(&self, entry: &str) -> CoreResult<Option<Handle>> {
        self.context.with(|ctx| {
            let take: Function = ctx
                .globals()
                .get(TAKE_FN)
                .map_err(|e| internal_error(entry, e.to_string()))?;
            let settled: Value = take
                .call(())
                .catch(&ctx)
                .map_err(|e| internal_error(entry, e.to_string()))?;
            let Some(settled) = settled.as_object() else {
                return Ok(None);
            };

            let ok: bool = settled.get("ok").unwrap_or(false);
            if ok {
                let value: Value = settled
                    .get("value")
                    .map_err(|e| internal_error(entry, e.to_string()))?;
                let mut next_function = 0;
                let node = JsNode::from_js(&value, 0, &mut next_function)?;
                let mut state = self.state.lock();
                return Ok(Some(node.insert(&mut state.arena)));
            }

            let missing: Option<bool> = settled.get("missing").unwrap_or(None);
            if missing.unwrap_or(false) {
                return Err(CoreError::EntryNotFound(entry.to_string()));
            }

            let error: Value = settled
                .get("error")
                .map_err(|e| internal_error(entry, e.to_string()))?;
            let text = ctx
                .json_stringify(error)
                .map_err(|e| internal_error(entry, e.to_string()))?
                .map(|s| s.to_string())
                .transpose()
                .map_err(|e| internal_error(entry, e.to_string()))?
                .unwrap_or_else(|| "null".to_string());
            let payload: serde_json::Value = serde_json::from_str(&text)?;
            Err(CoreError::Guest(GuestError::from_json(entry, &payload)))
        })
    }

    /// Hand a settled request back to the guest's waiting promise.
    fn complete(&self, entry: &str, id: u64, outcome: RequestOutcome) -> CoreResult<()> {
        let (ok, payload) = match outcome {
            Ok(value) => (true, value),
            Err(error) => (false, serde_json::to_value(&error)?),
        };
        let json = serde_json::to_string(&payload)?;
        self.context.with(|ctx| {
            let complete: Function = ctx
                .globals()
                .get(COMPLETE_FN)
                .map_err(|e| internal_error(entry, e.to_string()))?;
            complete
                .call::<_, ()>((id as f64, ok, json))
                .catch(&ctx)
                .map_err(|e| internal_error(entry, e.to_string()))
        })
    }

    fn take_host_fault(&self) -> Option<CoreError> {
        self.state.lock().host_fault.take()
    }
}

#[async_trait]
impl GuestAdapter for ScriptAdapter {
    fn format(&self) -> ModuleFormat {
        ModuleFormat::Script
    }

    fn exports(&self) -> Vec<String> {
        self.exports.clone()
    }

    async fn call_entry(
        &mut self,
        entry: &str,
        args: &[serde_json::Value],
        mut cancel: CancelFlag,
    ) -> CoreResult<Handle> {
        if !self.exports.iter().any(|e| e == entry) {
            return Err(CoreError::EntryNotFound(entry.to_string()));
        }

        let args_json = serde_json::to_string(args)?;
        self.start(entry, &args_json)?;

        let mut in_flight: FuturesUnordered<BoxFuture<'static, (u64, RequestOutcome)>> =
            FuturesUnordered::new();

        loop {
            self.run_jobs();
            if let Some(fault) = self.take_host_fault() {
                return Err(fault);
            }
            if let Some(handle) = self.take_settled(entry)? {
                return Ok(handle);
            }

            let issued = self.state.lock().requests.drain();
            for (id, request) in issued {
                in_flight.push(Box::pin(async move { (id, request.await) }));
            }
            if in_flight.is_empty() {
                return Err(CoreError::Guest(GuestError::new(
                    entry,
                    "Error",
                    "entry point returned a promise that can never settle",
                )));
            }

            let settled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                settled = in_flight.next() => settled,
            };
            if let Some((id, outcome)) = settled {
                self.complete(entry, id, outcome)?;
            }
        }
    }

    fn memory(&self) -> Box<dyn MemoryBridge + '_> {
        Box::new(StagingView(self.staging.lock()))
    }

    fn write_memory(&mut self, bytes: &[u8]) -> CoreResult<MemoryRegion> {
        self.staging.lock().write(bytes)
    }

    fn grow_memory(&mut self, additional: usize) -> CoreResult<usize> {
        self.staging.lock().grow(additional)
    }

    fn finish_call(&mut self) {
        self.staging.lock().reset();
        let reset = self.context.with(|ctx| {
            ctx.globals()
                .get::<_, Function>(RESET_FN)
                .and_then(|f| f.call::<_, ()>(()))
                .is_ok()
        });
        if !reset {
            tracing::warn!(module_id = %self.module_id, "failed to reset script bridge state");
        }
    }
}

/// Locked view of the staging buffer
struct StagingView<'a>(MutexGuard<'a, StagingBuffer>);

impl MemoryBridge for StagingView<'_> {
    fn size(&self) -> usize {
        self.0.size()
    }

    fn data(&self) -> &[u8] {
        self.0.data()
    }
}

fn internal_error(entry: &str, message: String) -> CoreError {
    CoreError::Guest(GuestError::new(entry, "InternalError", message))
}

/// Record a host-side error so the drive loop reports it in place of
/// whatever the guest does with the exception, then throw into the guest.
fn raise(ctx: &Ctx<'_>, state: &SharedState, err: CoreError) -> rquickjs::Error {
    let message = err.to_string();
    let mut state = state.lock();
    if state.host_fault.is_none() {
        state.host_fault = Some(err);
    }
    drop(state);
    Exception::throw_message(ctx, &message)
}

fn install_natives<'js>(
    ctx: &Ctx<'js>,
    imports: &ImportTable,
    state: &SharedState,
    staging: &SharedStaging,
) -> rquickjs::Result<()> {
    let native = Object::new(ctx.clone())?;

    let bound = Object::new(ctx.clone())?;
    for function in imports.iter() {
        bound.set(
            function.name.as_str(),
            import_function(ctx, function.clone(), state.clone(), staging.clone())?,
        )?;
    }
    native.set("imports", bound)?;

    {
        let state = state.clone();
        let staging = staging.clone();
        native.set(
            "stageValue",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, json: String| {
                let staged = serde_json::from_str::<serde_json::Value>(&json)
                    .map_err(CoreError::from)
                    .and_then(|value| staging.lock().write(&codec::encode_json(&value)));
                match staged {
                    Ok(region) => Ok(vec![region.offset, region.length]),
                    Err(err) => Err(raise(&ctx, &state, err)),
                }
            })?,
        )?;
    }

    {
        let state = state.clone();
        let staging = staging.clone();
        native.set(
            "stageText",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, text: String| {
                match staging.lock().write(text.as_bytes()) {
                    Ok(region) => Ok(vec![region.offset, region.length]),
                    Err(err) => Err(raise(&ctx, &state, err)),
                }
            })?,
        )?;
    }

    {
        let state = state.clone();
        let staging = staging.clone();
        native.set(
            "readString",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, region: Value<'js>| {
                let read = wire_arg(&region, WireType::I64).and_then(|bits| {
                    let region = MemoryRegion::from_bits(bits.as_i64()? as u64);
                    staging.lock().read_str(region).map(str::to_owned)
                });
                read.map_err(|err| raise(&ctx, &state, err))
            })?,
        )?;
    }

    ctx.globals().set(NATIVE_GLOBAL, native)
}

/// Bind one host function as a native JS function. `i64` arguments and
/// results travel as `BigInt`.
fn import_function<'js>(
    ctx: &Ctx<'js>,
    function: HostFunction,
    state: SharedState,
    staging: SharedStaging,
) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, Rest(args): Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let result = wire_args(&function, &args)
                .and_then(|wire| {
                    let mut state = state.lock();
                    let memory = staging.lock();
                    let mut call = HostCall {
                        state: &mut *state,
                        memory: &*memory,
                    };
                    function.invoke(&mut call, &wire)
                })
                .and_then(|returned| match returned {
                    HostReturn::Value(value) => Ok(value),
                    HostReturn::Bytes(bytes) => {
                        let region = staging.lock().write(&bytes)?;
                        Ok(WireValue::I64(region.to_bits() as i64))
                    }
                });

            match result {
                Ok(WireValue::I32(v)) => Ok(Value::new_int(ctx.clone(), v)),
                Ok(WireValue::I64(v)) => BigInt::from_i64(ctx.clone(), v)?.into_js(&ctx),
                Ok(WireValue::F64(v)) => Ok(Value::new_float(ctx.clone(), v)),
                Err(err) => Err(raise(&ctx, &state, err)),
            }
        },
    )
}

fn wire_args(function: &HostFunction, args: &[Value<'_>]) -> CoreResult<Vec<WireValue>> {
    if args.len() != function.arity() {
        return Err(CoreError::Decode(format!(
            "{} expects {} arguments, got {}",
            function.name,
            function.arity(),
            args.len()
        )));
    }
    args.iter()
        .zip(&function.params)
        .map(|(value, ty)| wire_arg(value, *ty))
        .collect()
}

fn wire_arg(value: &Value<'_>, ty: WireType) -> CoreResult<WireValue> {
    let mismatch = || {
        CoreError::Decode(format!(
            "expected {} argument, found {:?}",
            ty,
            value.type_of()
        ))
    };
    match ty {
        WireType::I64 => {
            if let Some(big) = value.as_big_int() {
                let v = big
                    .clone()
                    .to_i64()
                    .map_err(|e| CoreError::Decode(e.to_string()))?;
                Ok(WireValue::I64(v))
            } else {
                value
                    .as_number()
                    .map(|n| WireValue::I64(n as i64))
                    .ok_or_else(mismatch)
            }
        }
        WireType::I32 => value
            .as_number()
            .map(|n| WireValue::I32(n as i32))
            .ok_or_else(mismatch),
        WireType::F64 => value
            .as_number()
            .map(WireValue::F64)
            .ok_or_else(mismatch),
    }
}

/// Host copy of a guest value, taken before the arena is locked so no
/// guest code runs while the lock is held.
enum JsNode {
    Leaf(TaggedValue),
    Array(Vec<JsNode>),
    Object(Vec<(String, JsNode)>),
}

impl JsNode {
    fn from_js(value: &Value<'_>, depth: usize, next_function: &mut u32) -> CoreResult<Self> {
        if depth > MAX_DEPTH {
            return Err(CoreError::Decode(format!(
                "value nesting exceeds {}",
                MAX_DEPTH
            )));
        }
        let js = |e: rquickjs::Error| CoreError::Decode(e.to_string());

        let node = match value.type_of() {
            Type::Bool => JsNode::Leaf(TaggedValue::Bool(value.as_bool().unwrap_or(false))),
            Type::Int | Type::Float => {
                JsNode::Leaf(TaggedValue::Number(value.as_number().unwrap_or(f64::NAN)))
            }
            Type::BigInt => {
                let n = match value.as_big_int() {
                    Some(big) => big.clone().to_i64().map_err(js)? as f64,
                    None => f64::NAN,
                };
                JsNode::Leaf(TaggedValue::Number(n))
            }
            Type::String => {
                let s = match value.as_string() {
                    Some(s) => s.to_string().map_err(js)?,
                    None => String::new(),
                };
                JsNode::Leaf(TaggedValue::String(s))
            }
            Type::Function | Type::Constructor => {
                *next_function += 1;
                JsNode::Leaf(TaggedValue::Function(FunctionRef(*next_function)))
            }
            Type::Array => {
                let mut items = Vec::new();
                if let Some(array) = value.as_array() {
                    for item in array.iter::<Value>() {
                        items.push(Self::from_js(&item.map_err(js)?, depth + 1, next_function)?);
                    }
                }
                JsNode::Array(items)
            }
            Type::Object | Type::Exception | Type::Promise => {
                let mut entries = Vec::new();
                if let Some(object) = value.as_object() {
                    for prop in object.props::<String, Value>() {
                        let (key, item) = prop.map_err(js)?;
                        if item.is_undefined() || item.type_of() == Type::Symbol {
                            continue;
                        }
                        entries.push((key, Self::from_js(&item, depth + 1, next_function)?));
                    }
                }
                JsNode::Object(entries)
            }
            _ => JsNode::Leaf(TaggedValue::Null),
        };
        Ok(node)
    }

    fn insert(self, arena: &mut HostObjectArena) -> Handle {
        let tagged = match self {
            JsNode::Leaf(TaggedValue::Null) => return Handle::NULL,
            JsNode::Leaf(value) => value,
            JsNode::Array(items) => {
                TaggedValue::Array(items.into_iter().map(|item| item.insert(arena)).collect())
            }
            JsNode::Object(entries) => TaggedValue::Object(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, item.insert(arena)))
                    .collect(),
            ),
        };
        arena.insert(tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilitySet, GrantedCapabilities};
    use crate::manifest::ModuleManifest;
    use crate::sink::{InstanceSink, MemorySink};
    use crate::state::HostState;
    use crate::value::PtrKind;
    use serde_json::json;

    fn module(source: &str) -> Module {
        let manifest = ModuleManifest {
            id: "script-test".into(),
            name: "Script Test".into(),
            version: "0.1.0".into(),
            entry_file: "index.js".into(),
            capabilities: vec!["json".into()],
            description: None,
            icon: None,
            authors: vec![],
        };
        Module::from_source(manifest, source).unwrap()
    }

    fn adapter(source: &str) -> (ScriptAdapter, SharedState) {
        let sink = Arc::new(InstanceSink::new(Arc::new(MemorySink::new()), "script-test", "i"));
        let granted =
            GrantedCapabilities::new("script-test", CapabilitySet::parse(["json"]).unwrap());
        let state = HostState::new(granted, None, sink).into_shared();
        let adapter = ScriptAdapter::instantiate(
            &module(source),
            state.clone(),
            Arc::new(ImportTable::standard()),
            &ScriptConfig::default(),
        )
        .unwrap();
        (adapter, state)
    }

    async fn call(
        adapter: &mut ScriptAdapter,
        state: &SharedState,
        entry: &str,
        args: &[serde_json::Value],
    ) -> CoreResult<serde_json::Value> {
        let result = adapter.call_entry(entry, args, CancelFlag::never()).await;
        adapter.finish_call();
        let handle = result?;
        let state = state.lock();
        codec::materialize(&state.arena, handle)
    }

    #[tokio::test]
    async fn test_sync_and_async_results() {
        let (mut adapter, state) = adapter(
            r#"
            function search(query) { return { query: query, tags: ["a", "b"] }; }
            async function discoverListings() { return [1, 2.5, true, null]; }
            "#,
        );
        assert_eq!(
            adapter.exports(),
            vec!["search".to_string(), "discoverListings".to_string()]
        );
        assert_eq!(
            call(&mut adapter, &state, "search", &[json!("batman")]).await.unwrap(),
            json!({"query": "batman", "tags": ["a", "b"]})
        );
        assert_eq!(
            call(&mut adapter, &state, "discoverListings", &[]).await.unwrap(),
            json!([1, 2.5, true, null])
        );
    }

    #[tokio::test]
    async fn test_thrown_error_is_translated() {
        let (mut adapter, state) = adapter(
            r#"
            function search() {
                const err = new TypeError("bad query");
                err.status = 400;
                throw err;
            }
            "#,
        );
        let err = call(&mut adapter, &state, "search", &[]).await.unwrap_err();
        let guest = err.guest().unwrap();
        assert_eq!(guest.function_name, "search");
        assert_eq!(guest.name, "TypeError");
        assert_eq!(guest.message, "bad query");
        assert_eq!(guest.status, Some(400));
    }

    #[tokio::test]
    async fn test_functions_follow_stringify_rules() {
        let (mut adapter, state) = adapter(
            r#"function search() { return { keep: 1, drop: function () {}, list: [function () {}] }; }"#,
        );
        assert_eq!(
            call(&mut adapter, &state, "search", &[]).await.unwrap(),
            json!({"keep": 1, "list": [null]})
        );
    }

    #[tokio::test]
    async fn test_buffer_protocol_from_script() {
        let (mut adapter, state) = adapter(
            r#"
            function search(value) {
                const [offset, length] = modbridge.stage(value);
                const root = modbridge.parseBuffer(offset, length);
                const [keyOffset, keyLength] = modbridge.stageText("title");
                const title = modbridge.get(root, keyOffset, keyLength);
                return {
                    kind: modbridge.kindOf(root),
                    title: modbridge.readString(modbridge.toStringBuf(title)),
                    size: modbridge.lengthOf(root),
                };
            }
            "#,
        );
        assert_eq!(
            call(&mut adapter, &state, "search", &[json!({"title": "Batman", "year": 1989})])
                .await
                .unwrap(),
            json!({"kind": PtrKind::Object.tag(), "title": "Batman", "size": 2})
        );
    }

    #[tokio::test]
    async fn test_host_fault_wins_over_guest_catch() {
        let (mut adapter, state) = adapter(
            r#"
            function search() {
                try { modbridge.toStringBuf(0n); } catch (e) { return "swallowed"; }
            }
            "#,
        );
        let err = call(&mut adapter, &state, "search", &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_entry() {
        let (mut adapter, state) = adapter("function search() { return 1; }");
        let err = call(&mut adapter, &state, "playlistItems", &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::EntryNotFound(_)));
    }

    #[test]
    fn test_syntax_error_fails_load() {
        let sink = Arc::new(InstanceSink::new(Arc::new(MemorySink::new()), "script-test", "i"));
        let granted =
            GrantedCapabilities::new("script-test", CapabilitySet::parse(["json"]).unwrap());
        let state = HostState::new(granted, None, sink).into_shared();
        let err = ScriptAdapter::instantiate(
            &module("function search( {"),
            state,
            Arc::new(ImportTable::standard()),
            &ScriptConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LoadError::Instantiate(_)));
    }
}
