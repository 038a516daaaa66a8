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

//! Log and telemetry sinks
//!
//! Sinks are passed explicitly: the host hands one to the loader, every
//! instance wraps it in an [`InstanceSink`] stamped with its ids, and the
//! wrapper is closed when the instance is unloaded.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Events kept by [`MemorySink`].
pub const MEMORY_SINK_CAPACITY: usize = 1000;

/// Guest log level, as passed to the `log` import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<i32> for LogLevel {
    fn from(val: i32) -> Self {
        match val {
            i32::MIN..=0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged { from: String, to: String },
    CallStarted { entry: String },
    CallFinished { entry: String, elapsed_ms: u64, ok: bool },
    GuestLog,
    DoubleResolution { call_id: u64 },
    CapabilityDenied { capability: String },
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub module_id: String,
    pub instance_id: String,
    pub level: LogLevel,
    #[serde(flatten)]
    pub kind: EventKind,
    pub message: String,
}

/// Destination for module events
pub trait LogSink: Send + Sync {
    fn emit(&self, event: ModuleEvent);

    /// Flush and stop accepting events.
    fn close(&self) {}
}

pub type SharedSink = Arc<dyn LogSink>;

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, event: ModuleEvent) {
        let ModuleEvent {
            module_id,
            instance_id,
            level,
            kind,
            message,
            ..
        } = event;
        match level {
            LogLevel::Trace => tracing::trace!(module_id = %module_id, instance_id = %instance_id, kind = ?kind, "{}", message),
            LogLevel::Debug => tracing::debug!(module_id = %module_id, instance_id = %instance_id, kind = ?kind, "{}", message),
            LogLevel::Info => tracing::info!(module_id = %module_id, instance_id = %instance_id, kind = ?kind, "{}", message),
            LogLevel::Warn => tracing::warn!(module_id = %module_id, instance_id = %instance_id, kind = ?kind, "{}", message),
            LogLevel::Error => tracing::error!(module_id = %module_id, instance_id = %instance_id, kind = ?kind, "{}", message),
        }
    }
}

/// Bounded in-memory ring of recent events
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<VecDeque<ModuleEvent>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ModuleEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<ModuleEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl LogSink for MemorySink {
    fn emit(&self, event: ModuleEvent) {
        if self.is_closed() {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == MEMORY_SINK_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Per-instance handle onto a shared sink
pub struct InstanceSink {
    inner: SharedSink,
    module_id: String,
    instance_id: String,
    closed: AtomicBool,
}

impl InstanceSink {
    pub fn new(inner: SharedSink, module_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            inner,
            module_id: module_id.into(),
            instance_id: instance_id.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, level: LogLevel, kind: EventKind, message: impl Into<String>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.inner.emit(ModuleEvent {
            timestamp: chrono::Utc::now(),
            module_id: self.module_id.clone(),
            instance_id: self.instance_id.clone(),
            level,
            kind,
            message: message.into(),
        });
    }

    /// Emit the final event; later events are dropped.
    pub fn close(&self) {
        if !self.closed.load(Ordering::Acquire) {
            self.emit(LogLevel::Debug, EventKind::Closed, "instance sink closed");
            self.closed.store(true, Ordering::Release);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InstanceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSink")
            .field("module_id", &self.module_id)
            .field("instance_id", &self.instance_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
