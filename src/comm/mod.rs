//! Keeps the sandbox's widget replica in step with the host store and
//! routes widget interaction back to the kernel.

pub mod kernel;
pub mod store;

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

use crate::frame::surface::OutputSurface;
use crate::frame::{FrameController, FrameError, WidgetEvent};
use crate::protocol::{
    CommClosePayload, CommMethod, CommMsgPayload, CommOpenPayload, CommSyncPayload, HostMessage,
    WidgetState,
};

use self::kernel::{KernelComm, KernelCommError, KernelCommEvent, KernelCommRequest};
use self::store::{ChangeKind, Provenance, SharedStore, StoreChange, WidgetModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for `widget_ready`; kernel custom messages are held.
    Buffering,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Kernel messages held while buffering before new ones are rejected.
    pub buffer_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommBridgeError {
    #[error("comm buffer is full ({capacity} messages)")]
    BufferFull { capacity: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Kernel(#[from] KernelCommError),
}

/// Anything the bridge can post host messages to.
pub trait MessageSink {
    fn send_message(&mut self, message: HostMessage) -> Result<(), FrameError>;
}

impl<S: OutputSurface> MessageSink for FrameController<S> {
    fn send_message(&mut self, message: HostMessage) -> Result<(), FrameError> {
        self.send(message)
    }
}

impl MessageSink for Vec<HostMessage> {
    fn send_message(&mut self, message: HostMessage) -> Result<(), FrameError> {
        self.push(message);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    state: WidgetState,
    buffers: Vec<Vec<u8>>,
}

impl Snapshot {
    fn of(model: &WidgetModel) -> Self {
        Self {
            state: model.state.clone(),
            buffers: model.buffers.clone(),
        }
    }

    fn merge(&mut self, patch: &WidgetState, buffers: &[Vec<u8>]) {
        for (key, value) in patch {
            self.state.insert(key.clone(), value.clone());
        }
        if !buffers.is_empty() {
            self.buffers = buffers.to_vec();
        }
    }
}

pub struct CommBridge<K: KernelComm> {
    store: SharedStore,
    changes: UnboundedReceiver<StoreChange>,
    kernel: K,
    config: BridgeConfig,
    state: BridgeState,
    snapshots: HashMap<String, Snapshot>,
    pending: VecDeque<HostMessage>,
}

impl<K: KernelComm> CommBridge<K> {
    pub fn new(store: SharedStore, kernel: K, config: BridgeConfig) -> Self {
        let changes = store.borrow_mut().subscribe();
        Self {
            store,
            changes,
            kernel,
            config,
            state: BridgeState::Buffering,
            snapshots: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BridgeState::Ready
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids of models the sandbox has been told about.
    pub fn tracked(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.snapshots.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// First half of the handshake. The sandbox replies with `widget_ready`.
    pub fn announce(&mut self, sink: &mut impl MessageSink) -> Result<(), CommBridgeError> {
        debug!(target: "comm", "announcing bridge");
        sink.send_message(HostMessage::BridgeReady)?;
        Ok(())
    }

    pub fn handle_widget_event(
        &mut self,
        sink: &mut impl MessageSink,
        event: WidgetEvent,
    ) -> Result<(), CommBridgeError> {
        match event {
            WidgetEvent::Ready => self.on_widget_ready(sink),
            WidgetEvent::Update {
                comm_id,
                state,
                buffers,
            } => self.on_sandbox_update(comm_id, state, buffers),
            WidgetEvent::Custom {
                comm_id,
                data,
                buffers,
            } => {
                trace!(target: "comm", %comm_id, "custom message to kernel");
                self.kernel.send(KernelCommRequest::Custom {
                    comm_id,
                    data,
                    buffers,
                })?;
                Ok(())
            }
            WidgetEvent::Close { comm_id } => {
                self.store
                    .borrow_mut()
                    .remove(&comm_id, Provenance::Sandbox);
                self.snapshots.remove(&comm_id);
                debug!(target: "comm", %comm_id, "sandbox closed model");
                self.kernel.send(KernelCommRequest::Close { comm_id })?;
                Ok(())
            }
        }
    }

    pub fn handle_kernel_event(
        &mut self,
        sink: &mut impl MessageSink,
        event: KernelCommEvent,
    ) -> Result<(), CommBridgeError> {
        match event {
            KernelCommEvent::Open {
                comm_id,
                target_name,
                state,
                buffers,
            } => {
                self.store
                    .borrow_mut()
                    .open(comm_id, target_name, state, buffers, Provenance::Kernel);
            }
            KernelCommEvent::Update {
                comm_id,
                state,
                buffers,
            } => {
                self.store
                    .borrow_mut()
                    .update(&comm_id, &state, buffers, Provenance::Kernel);
            }
            KernelCommEvent::Close { comm_id } => {
                self.store.borrow_mut().remove(&comm_id, Provenance::Kernel);
            }
            KernelCommEvent::Custom {
                comm_id,
                data,
                buffers,
            } => {
                self.sync_store(sink)?;
                return self.forward_custom(sink, comm_id, data, buffers);
            }
        }
        self.sync_store(sink)?;
        Ok(())
    }

    /// Drain pending store notifications and mirror anything not caused by
    /// the sandbox. Returns the number of messages sent.
    ///
    /// Kernel events handled by this bridge sync on their own. Store
    /// mutations made elsewhere are mirrored on the next call, or by a task
    /// looping on [`CommBridge::next_sync`].
    pub fn sync_store(&mut self, sink: &mut impl MessageSink) -> Result<usize, CommBridgeError> {
        self.sync_changes(sink, None)
    }

    /// Wait for the next store change, then mirror it along with anything
    /// else already queued.
    pub async fn next_sync(&mut self, sink: &mut impl MessageSink) -> Result<usize, CommBridgeError> {
        let Some(first) = self.changes.recv().await else {
            return Ok(0);
        };
        self.sync_changes(sink, Some(first))
    }

    fn sync_changes(
        &mut self,
        sink: &mut impl MessageSink,
        first: Option<StoreChange>,
    ) -> Result<usize, CommBridgeError> {
        let mut dirty = false;
        let mut reopened = Vec::new();
        let mut next = first;
        while let Some(change) = next.take().or_else(|| self.changes.try_recv().ok()) {
            if change.provenance == Provenance::Sandbox {
                trace!(target: "comm", comm_id = %change.comm_id, "skipping sandbox-originated change");
                continue;
            }
            if change.kind == ChangeKind::Opened {
                reopened.push(change.comm_id);
            }
            dirty = true;
        }
        if !dirty || self.state != BridgeState::Ready {
            return Ok(0);
        }

        let messages = self.reconcile(&reopened);
        let sent = messages.len();
        for message in messages {
            sink.send_message(message)?;
        }
        Ok(sent)
    }

    fn on_widget_ready(&mut self, sink: &mut impl MessageSink) -> Result<(), CommBridgeError> {
        if self.state == BridgeState::Ready {
            debug!(target: "comm", "duplicate widget_ready ignored");
            return Ok(());
        }
        self.state = BridgeState::Ready;
        while self.changes.try_recv().is_ok() {}

        let models = {
            let store = self.store.borrow();
            let models = store.models();
            self.snapshots = models
                .iter()
                .map(|model| (model.comm_id.clone(), Snapshot::of(model)))
                .collect();
            models.iter().map(|model| model.to_synced()).collect::<Vec<_>>()
        };
        info!(
            target: "comm",
            models = models.len(),
            buffered = self.pending.len(),
            "widget bridge ready"
        );
        sink.send_message(HostMessage::CommSync(CommSyncPayload { models }))?;

        while let Some(message) = self.pending.pop_front() {
            sink.send_message(message)?;
        }
        Ok(())
    }

    fn on_sandbox_update(
        &mut self,
        comm_id: String,
        state: WidgetState,
        buffers: Vec<Vec<u8>>,
    ) -> Result<(), CommBridgeError> {
        let applied = self.store.borrow_mut().update(
            &comm_id,
            &state,
            buffers.clone(),
            Provenance::Sandbox,
        );
        if !applied {
            return Ok(());
        }
        if let Some(snapshot) = self.snapshots.get_mut(&comm_id) {
            snapshot.merge(&state, &buffers);
        }
        trace!(target: "comm", %comm_id, keys = state.len(), "sandbox update to kernel");
        self.kernel.send(KernelCommRequest::Update {
            comm_id,
            state,
            buffers,
        })?;
        Ok(())
    }

    fn forward_custom(
        &mut self,
        sink: &mut impl MessageSink,
        comm_id: String,
        data: Value,
        buffers: Vec<Vec<u8>>,
    ) -> Result<(), CommBridgeError> {
        let message = HostMessage::CommMsg(CommMsgPayload {
            comm_id,
            method: CommMethod::Custom,
            data,
            buffers,
        });
        if self.state == BridgeState::Ready {
            sink.send_message(message)?;
            return Ok(());
        }
        if self.pending.len() >= self.config.buffer_capacity {
            warn!(
                target: "comm",
                capacity = self.config.buffer_capacity,
                "comm buffer full, rejecting kernel message"
            );
            return Err(CommBridgeError::BufferFull {
                capacity: self.config.buffer_capacity,
            });
        }
        self.pending.push_back(message);
        Ok(())
    }

    /// Diff the store against what the sandbox has seen. Models in
    /// `reopened` are announced afresh instead of diffed.
    fn reconcile(&mut self, reopened: &[String]) -> Vec<HostMessage> {
        let store = self.store.borrow();
        let mut messages = Vec::new();

        for comm_id in reopened {
            if store.contains(comm_id) && self.snapshots.remove(comm_id).is_some() {
                debug!(target: "comm", %comm_id, "model reopened, resending in full");
            }
        }

        for model in store.models() {
            let Some(snapshot) = self.snapshots.get_mut(&model.comm_id) else {
                messages.push(HostMessage::CommOpen(CommOpenPayload {
                    comm_id: model.comm_id.clone(),
                    target_name: model.target_name.clone(),
                    state: model.state.clone(),
                    buffers: model.buffers.clone(),
                }));
                self.snapshots
                    .insert(model.comm_id.clone(), Snapshot::of(model));
                continue;
            };

            let delta = changed_keys(&snapshot.state, &model.state);
            let buffers_changed = snapshot.buffers != model.buffers;
            if delta.is_empty() && !buffers_changed {
                continue;
            }
            let buffers = if buffers_changed {
                model.buffers.clone()
            } else {
                Vec::new()
            };
            *snapshot = Snapshot::of(model);
            messages.push(HostMessage::CommMsg(CommMsgPayload {
                comm_id: model.comm_id.clone(),
                method: CommMethod::Update,
                data: Value::Object(delta),
                buffers,
            }));
        }

        let mut closed: Vec<String> = self
            .snapshots
            .keys()
            .filter(|comm_id| !store.contains(comm_id))
            .cloned()
            .collect();
        closed.sort_unstable();
        for comm_id in closed {
            self.snapshots.remove(&comm_id);
            messages.push(HostMessage::CommClose(CommClosePayload { comm_id }));
        }

        messages
    }
}

/// Top-level keys of `current` whose value differs from `previous`.
/// Keys removed from `current` are not reported.
pub fn changed_keys(previous: &WidgetState, current: &WidgetState) -> WidgetState {
    current
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
