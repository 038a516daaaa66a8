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

//! Module instance lifecycle
//!
//! A [`ModuleInstance`] owns one guest adapter and the host state behind it.
//! Calls are serialized by mutual exclusion: the adapter sits behind an
//! async mutex that a call acquires with `try_lock`, so a second concurrent
//! call fails with `Busy` instead of queueing.
//!
//! Each call runs on its own task and reports through a [`PendingCall`];
//! the caller waits on it with an optional deadline. A timed-out or
//! cancelled call unblocks the caller immediately while the task finishes
//! the guest's work in the background, holding the instance `Executing`.

use crate::adapter::GuestAdapter;
use crate::error::{CoreError, CoreResult};
use crate::module::{Module, ModuleFormat};
use crate::pending::PendingCall;
use crate::sink::{EventKind, InstanceSink, LogLevel};
use crate::state::{InstanceMetrics, SharedState};
use crate::value::Handle;
use crate::view::ValueView;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Instance identifier (UUID v4)
pub type InstanceId = String;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Not instantiated, or unloaded
    Unloaded,
    /// Being instantiated
    Loading,
    /// Idle and accepting calls
    Ready,
    /// A call is in flight
    Executing,
    /// Unrecoverable failure; the instance must be replaced
    Faulted,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Unloaded => "unloaded",
            InstanceState::Loading => "loading",
            InstanceState::Ready => "ready",
            InstanceState::Executing => "executing",
            InstanceState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Result of one call as handed to the waiting caller
#[derive(Debug)]
enum CallOutput {
    Value(serde_json::Value),
    Retained(Handle),
}

type AdapterSlot = Arc<tokio::sync::Mutex<Box<dyn GuestAdapter>>>;

/// Lifecycle state plus the sink that reports its transitions
struct Lifecycle {
    state: RwLock<InstanceState>,
    sink: Arc<InstanceSink>,
    instance_id: InstanceId,
}

impl Lifecycle {
    fn get(&self) -> InstanceState {
        *self.state.read()
    }

    /// Move to `to`. `Unloaded` is terminal and `Faulted` only leaves for
    /// `Unloaded`; returns whether the state changed.
    fn transition(&self, to: InstanceState) -> bool {
        self.transition_if(|_| true, to)
    }

    /// Move `expected` to `to` only if the state still is `expected`.
    fn compare_and_set(&self, expected: InstanceState, to: InstanceState) -> bool {
        self.transition_if(|from| from == expected, to)
    }

    /// Claim the instance for a call: `Faulted` and `Unloaded` refuse,
    /// anything else becomes `Executing`.
    fn begin_call(&self, instance_id: &str) -> CoreResult<()> {
        let claimed = self.transition_if(
            |from| !matches!(from, InstanceState::Faulted | InstanceState::Unloaded),
            InstanceState::Executing,
        );
        match self.get() {
            InstanceState::Faulted => Err(CoreError::Faulted(instance_id.to_string())),
            InstanceState::Unloaded => Err(CoreError::Unloaded(instance_id.to_string())),
            _ if claimed => Ok(()),
            _ => Err(CoreError::Busy(instance_id.to_string())),
        }
    }

    fn transition_if(&self, allowed: impl Fn(InstanceState) -> bool, to: InstanceState) -> bool {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            let terminal = match from {
                InstanceState::Unloaded => true,
                InstanceState::Faulted => to != InstanceState::Unloaded,
                _ => false,
            };
            if from == to || terminal || !allowed(from) {
                return false;
            }
            *state = to;
            from
        };
        tracing::debug!(instance_id = %self.instance_id, %from, %to, "instance state changed");
        let level = if to == InstanceState::Faulted {
            LogLevel::Error
        } else {
            LogLevel::Debug
        };
        self.sink.emit(
            level,
            EventKind::StateChanged {
                from: from.to_string(),
                to: to.to_string(),
            },
            format!("{} -> {}", from, to),
        );
        true
    }
}

/// A loaded module bound to one guest runtime instance
pub struct ModuleInstance {
    id: InstanceId,
    module: Module,
    adapter: AdapterSlot,
    exports: Vec<String>,
    host: SharedState,
    lifecycle: Arc<Lifecycle>,
    current: Arc<Mutex<Option<Arc<PendingCall<CallOutput>>>>>,
    next_call_id: AtomicU64,
    loaded_at: DateTime<Utc>,
}

impl ModuleInstance {
    /// Wrap an instantiated adapter. The instance starts `Ready`.
    pub(crate) fn new(
        id: InstanceId,
        module: Module,
        adapter: Box<dyn GuestAdapter>,
        host: SharedState,
        sink: Arc<InstanceSink>,
    ) -> Self {
        let exports = adapter.exports();
        let lifecycle = Arc::new(Lifecycle {
            state: RwLock::new(InstanceState::Loading),
            sink,
            instance_id: id.clone(),
        });
        lifecycle.transition(InstanceState::Ready);

        Self {
            id,
            module,
            adapter: Arc::new(tokio::sync::Mutex::new(adapter)),
            exports,
            host,
            lifecycle,
            current: Arc::new(Mutex::new(None)),
            next_call_id: AtomicU64::new(1),
            loaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_id(&self) -> &str {
        self.module.id()
    }

    pub fn format(&self) -> ModuleFormat {
        self.module.format()
    }

    pub fn state(&self) -> InstanceState {
        self.lifecycle.get()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Entry points the module provides.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn has_export(&self, entry: &str) -> bool {
        self.exports.iter().any(|e| e == entry)
    }

    pub fn sink(&self) -> &Arc<InstanceSink> {
        &self.lifecycle.sink
    }

    /// Call an entry point and deep-copy its result out of the instance.
    pub async fn call(
        &self,
        entry: &str,
        args: Vec<serde_json::Value>,
        deadline: Option<tokio::time::Instant>,
    ) -> CoreResult<serde_json::Value> {
        match self.dispatch(entry, args, deadline, false).await? {
            CallOutput::Value(value) => Ok(value),
            CallOutput::Retained(handle) => self.with_value(handle, |view| view.to_json())?,
        }
    }

    /// Call an entry point and deserialize its result.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        entry: &str,
        args: Vec<serde_json::Value>,
        deadline: Option<tokio::time::Instant>,
    ) -> CoreResult<T> {
        let value = self.call(entry, args, deadline).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call an entry point and keep its result in the arena. The returned
    /// handle stays valid across calls until [`ModuleInstance::release`].
    pub async fn call_retained(
        &self,
        entry: &str,
        args: Vec<serde_json::Value>,
        deadline: Option<tokio::time::Instant>,
    ) -> CoreResult<Handle> {
        match self.dispatch(entry, args, deadline, true).await? {
            CallOutput::Retained(handle) => Ok(handle),
            CallOutput::Value(_) => Err(CoreError::Other(
                "retained call produced a copied value".to_string(),
            )),
        }
    }

    /// Walk a retained value without copying it.
    pub fn with_value<R>(&self, handle: Handle, f: impl FnOnce(ValueView<'_>) -> R) -> CoreResult<R> {
        let state = self.host.lock();
        state.arena.resolve(handle)?;
        Ok(f(ValueView::new(&state.arena, handle)))
    }

    /// Free a retained value.
    pub fn release(&self, handle: Handle) -> CoreResult<()> {
        self.host.lock().arena.release(handle)
    }

    pub fn metrics(&self) -> InstanceMetrics {
        self.host.lock().metrics.clone()
    }

    /// Cancel the in-flight call, if any. Returns whether a waiting caller
    /// was unblocked.
    pub fn cancel_current(&self) -> bool {
        let current = self.current.lock().clone();
        current.map(|call| call.cancel()).unwrap_or(false)
    }

    /// Stop accepting calls and close the instance sink. Guest resources are
    /// released when the last reference to the instance drops.
    pub fn unload(&self) {
        if self.state() == InstanceState::Unloaded {
            return;
        }
        self.cancel_current();
        if !self.lifecycle.transition(InstanceState::Unloaded) {
            return;
        }
        tracing::info!(instance_id = %self.id, module_id = %self.module_id(), "instance unloaded");
        self.lifecycle.sink.close();
    }

    async fn dispatch(
        &self,
        entry: &str,
        args: Vec<serde_json::Value>,
        deadline: Option<tokio::time::Instant>,
        retain: bool,
    ) -> CoreResult<CallOutput> {
        let adapter = self
            .adapter
            .clone()
            .try_lock_owned()
            .map_err(|_| CoreError::Busy(self.id.clone()))?;
        // Checked under the adapter lock: the previous call settles the
        // state before it releases the adapter.
        self.lifecycle.begin_call(&self.id)?;

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (call, receiver) =
            PendingCall::new(call_id, &self.id, entry, self.lifecycle.sink.clone());
        *self.current.lock() = Some(call.clone());

        self.lifecycle.sink.emit(
            LogLevel::Debug,
            EventKind::CallStarted {
                entry: entry.to_string(),
            },
            format!("call {} started", call_id),
        );

        let worker = CallWorker {
            host: self.host.clone(),
            lifecycle: self.lifecycle.clone(),
            current: self.current.clone(),
            call,
            entry: entry.to_string(),
            args,
            retain,
        };
        tokio::spawn(worker.run(adapter));

        receiver.wait(deadline).await
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("module_id", &self.module.id())
            .field("format", &self.module.format())
            .field("state", &self.state())
            .field("exports", &self.exports)
            .finish()
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        self.lifecycle.sink.close();
    }
}

/// Everything one call's task owns
struct CallWorker {
    host: SharedState,
    lifecycle: Arc<Lifecycle>,
    current: Arc<Mutex<Option<Arc<PendingCall<CallOutput>>>>>,
    call: Arc<PendingCall<CallOutput>>,
    entry: String,
    args: Vec<serde_json::Value>,
    retain: bool,
}

impl CallWorker {
    async fn run(self, mut adapter: tokio::sync::OwnedMutexGuard<Box<dyn GuestAdapter>>) {
        let started = Instant::now();
        let scope = {
            let mut host = self.host.lock();
            host.current_entry = Some(self.entry.clone());
            host.arena.begin_scope()
        };

        let result = AssertUnwindSafe(adapter.call_entry(
            &self.entry,
            &self.args,
            self.call.cancel_flag(),
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(CoreError::FatalTrap {
                function_name: self.entry.clone(),
                trap: panic_message(panic.as_ref()),
            })
        });

        let output = {
            let mut host = self.host.lock();
            let output = result.and_then(|handle| {
                if self.retain {
                    host.arena.promote(handle)?;
                    Ok(CallOutput::Retained(handle))
                } else {
                    crate::codec::materialize(&host.arena, handle).map(CallOutput::Value)
                }
            });

            if let Err(e) = host.arena.end_scope(scope) {
                tracing::warn!(entry = %self.entry, error = %e, "call scope left unbalanced");
                host.arena.unwind_scopes();
            }
            host.requests.clear();
            host.host_fault = None;
            host.current_entry = None;
            let elapsed_us = started.elapsed().as_micros() as u64;
            host.metrics.record_call(elapsed_us, output.is_ok());
            output
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let ok = output.is_ok();
        match &output {
            // A faulted adapter is never entered again, not even to reset.
            Err(e) if e.is_fatal() => {
                tracing::error!(
                    instance_id = %self.lifecycle.instance_id,
                    entry = %self.entry,
                    error = %e,
                    "call faulted instance"
                );
                self.lifecycle.transition(InstanceState::Faulted);
            }
            _ => {
                adapter.finish_call();
                self.lifecycle
                    .compare_and_set(InstanceState::Executing, InstanceState::Ready);
            }
        }
        drop(adapter);

        self.lifecycle.sink.emit(
            if ok { LogLevel::Debug } else { LogLevel::Warn },
            EventKind::CallFinished {
                entry: self.entry.clone(),
                elapsed_ms,
                ok,
            },
            format!("call {} finished in {}ms", self.call.id(), elapsed_ms),
        );
        tracing::debug!(
            instance_id = %self.lifecycle.instance_id,
            entry = %self.entry,
            elapsed_ms,
            ok,
            "call finished"
        );

        {
            let mut current = self.current.lock();
            if current.as_ref().map(|c| c.id()) == Some(self.call.id()) {
                *current = None;
            }
        }
        if !self.call.is_resolved() {
            self.call.resolve(output);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("host panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("host panicked: {}", message)
    } else {
        "host panicked".to_string()
    }
}
