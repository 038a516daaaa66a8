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

//! Async call bridge
//!
//! A [`PendingCall`] is the single-resolution slot for one in-flight entry
//! point invocation. The worker that drives the guest resolves it; the
//! caller awaits it through a [`PendingReceiver`], optionally against a
//! deadline. Only the first resolution is delivered. Later attempts are
//! dropped and reported to the instance sink.

use crate::error::{CoreError, CoreResult};
use crate::sink::{EventKind, InstanceSink, LogLevel};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// Cancellation signal observed by the guest drive loop at its suspension
/// points.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelFlag {
    /// A flag that is never raised.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once the call is cancelled; pends forever otherwise.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let raised = rx.wait_for(|cancelled| *cancelled).await.is_ok();
            if raised {
                return;
            }
        }
        futures::future::pending::<()>().await;
    }
}

/// In-flight entry point invocation
pub struct PendingCall<T> {
    id: u64,
    instance_id: String,
    entry: String,
    started_at: Instant,
    cancel_tx: watch::Sender<bool>,
    slot: Mutex<Option<oneshot::Sender<CoreResult<T>>>>,
    sink: Arc<InstanceSink>,
}

impl<T> PendingCall<T> {
    pub fn new(
        id: u64,
        instance_id: impl Into<String>,
        entry: impl Into<String>,
        sink: Arc<InstanceSink>,
    ) -> (Arc<Self>, PendingReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        let (cancel_tx, _) = watch::channel(false);
        let call = Arc::new(Self {
            id,
            instance_id: instance_id.into(),
            entry: entry.into(),
            started_at: Instant::now(),
            cancel_tx,
            slot: Mutex::new(Some(tx)),
            sink,
        });
        let receiver = PendingReceiver {
            rx,
            call: call.clone(),
        };
        (call, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        CancelFlag {
            rx: Some(self.cancel_tx.subscribe()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Deliver the outcome. Returns `false`, and logs, when the slot was
    /// already resolved or cancelled.
    pub fn resolve(&self, result: CoreResult<T>) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            Some(sender) => {
                // The receiver may have stopped waiting; that is not an error.
                let _ = sender.send(result);
                true
            }
            None => {
                tracing::warn!(
                    call_id = self.id,
                    instance_id = %self.instance_id,
                    entry = %self.entry,
                    "ignoring second resolution of call"
                );
                self.sink.emit(
                    LogLevel::Warn,
                    EventKind::DoubleResolution { call_id: self.id },
                    format!("call {} to {} was already resolved", self.id, self.entry),
                );
                false
            }
        }
    }

    /// Unblock the caller with `Cancelled`. Guest code already running is
    /// not interrupted.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CoreError::Cancelled)
    }

    fn cancel_with(&self, error: CoreError) -> bool {
        self.cancel_tx.send_replace(true);
        let sender = self.slot.lock().take();
        match sender {
            Some(sender) => {
                let _ = sender.send(Err(error));
                true
            }
            None => false,
        }
    }
}

impl<T> std::fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("entry", &self.entry)
            .field("elapsed", &self.elapsed())
            .field("cancelled", &self.is_cancelled())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Caller side of a [`PendingCall`]
pub struct PendingReceiver<T> {
    rx: oneshot::Receiver<CoreResult<T>>,
    call: Arc<PendingCall<T>>,
}

impl<T> PendingReceiver<T> {
    pub fn call(&self) -> &Arc<PendingCall<T>> {
        &self.call
    }

    /// Wait for the outcome. When `deadline` passes first the call is
    /// cancelled and `Timeout` is returned.
    pub async fn wait(mut self, deadline: Option<tokio::time::Instant>) -> CoreResult<T> {
        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    let elapsed_ms = self.call.elapsed().as_millis() as u64;
                    tracing::debug!(
                        call_id = self.call.id,
                        entry = %self.call.entry,
                        elapsed_ms,
                        "call deadline expired"
                    );
                    self.call.cancel_with(CoreError::Timeout { elapsed_ms });
                    return Err(CoreError::Timeout { elapsed_ms });
                }
            },
            None => (&mut self.rx).await,
        };
        // A dropped sender means the worker went away without resolving.
        received.unwrap_or(Err(CoreError::Cancelled))
    }
}
