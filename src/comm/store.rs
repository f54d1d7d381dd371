//! Host-side widget model store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::protocol::{SyncedModel, WidgetState};

/// Who caused a store mutation.
///
/// The bridge never mirrors `Sandbox` changes back into the sandbox; that
/// is the whole echo-suppression rule, and it holds however late the
/// notification is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    Kernel,
    Sandbox,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Opened,
    Updated,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub comm_id: String,
    pub kind: ChangeKind,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetModel {
    pub comm_id: String,
    pub target_name: String,
    pub state: WidgetState,
    pub buffers: Vec<Vec<u8>>,
    seq: u64,
}

impl WidgetModel {
    pub fn model_name(&self) -> Option<&str> {
        self.state.get("_model_name").and_then(Value::as_str)
    }

    pub fn model_module(&self) -> Option<&str> {
        self.state.get("_model_module").and_then(Value::as_str)
    }

    pub fn to_synced(&self) -> SyncedModel {
        SyncedModel {
            comm_id: self.comm_id.clone(),
            target_name: self.target_name.clone(),
            state: self.state.clone(),
            buffers: self.buffers.clone(),
        }
    }
}

pub type SharedStore = Rc<RefCell<WidgetStore>>;

/// Widget models keyed by comm id, iterated in open order.
#[derive(Debug, Default)]
pub struct WidgetStore {
    models: HashMap<String, WidgetModel>,
    next_seq: u64,
    subscribers: Vec<UnboundedSender<StoreChange>>,
}

impl WidgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Receive every subsequent change. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> UnboundedReceiver<StoreChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Insert a model, replacing the state of an existing one with the same
    /// id while keeping its position.
    pub fn open(
        &mut self,
        comm_id: impl Into<String>,
        target_name: impl Into<String>,
        state: WidgetState,
        buffers: Vec<Vec<u8>>,
        provenance: Provenance,
    ) {
        let comm_id = comm_id.into();
        let seq = match self.models.get(&comm_id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        debug!(target: "comm", %comm_id, ?provenance, "model opened");
        self.models.insert(
            comm_id.clone(),
            WidgetModel {
                comm_id: comm_id.clone(),
                target_name: target_name.into(),
                state,
                buffers,
                seq,
            },
        );
        self.notify(comm_id, ChangeKind::Opened, provenance);
    }

    /// Merge `patch` into a model key by key. Non-empty `buffers` replace
    /// the model's buffers. Returns `false` for an unknown comm id.
    pub fn update(
        &mut self,
        comm_id: &str,
        patch: &WidgetState,
        buffers: Vec<Vec<u8>>,
        provenance: Provenance,
    ) -> bool {
        let Some(model) = self.models.get_mut(comm_id) else {
            warn!(target: "comm", %comm_id, ?provenance, "update for unknown model ignored");
            return false;
        };
        for (key, value) in patch {
            model.state.insert(key.clone(), value.clone());
        }
        if !buffers.is_empty() {
            model.buffers = buffers;
        }
        self.notify(comm_id.to_string(), ChangeKind::Updated, provenance);
        true
    }

    pub fn remove(&mut self, comm_id: &str, provenance: Provenance) -> Option<WidgetModel> {
        let removed = self.models.remove(comm_id)?;
        debug!(target: "comm", %comm_id, ?provenance, "model closed");
        self.notify(comm_id.to_string(), ChangeKind::Closed, provenance);
        Some(removed)
    }

    pub fn get(&self, comm_id: &str) -> Option<&WidgetModel> {
        self.models.get(comm_id)
    }

    pub fn contains(&self, comm_id: &str) -> bool {
        self.models.contains_key(comm_id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// All models in the order they were first opened.
    pub fn models(&self) -> Vec<&WidgetModel> {
        let mut models: Vec<_> = self.models.values().collect();
        models.sort_by_key(|model| model.seq);
        models
    }

    fn notify(&mut self, comm_id: String, kind: ChangeKind, provenance: Provenance) {
        let change = StoreChange {
            comm_id,
            kind,
            provenance,
        };
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> WidgetState {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn preserves_open_order_across_reopen() {
        let mut store = WidgetStore::new();
        store.open("b", "jupyter.widget", state(json!({})), vec![], Provenance::Kernel);
        store.open("a", "jupyter.widget", state(json!({})), vec![], Provenance::Kernel);
        store.open("b", "jupyter.widget", state(json!({"v": 2})), vec![], Provenance::Kernel);

        let ids: Vec<_> = store.models().iter().map(|m| m.comm_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(store.get("b").unwrap().state["v"], 2);
    }

    #[test]
    fn merges_patches_key_by_key() {
        let mut store = WidgetStore::new();
        store.open(
            "w1",
            "jupyter.widget",
            state(json!({"a": 1, "b": 2, "_model_name": "IntSliderModel", "_model_module": "@jupyter-widgets/controls"})),
            vec![],
            Provenance::Kernel,
        );
        assert!(store.update("w1", &state(json!({"b": 3})), vec![], Provenance::Host));

        let model = store.get("w1").unwrap();
        assert_eq!(model.state["a"], 1);
        assert_eq!(model.state["b"], 3);
        assert_eq!(model.model_name(), Some("IntSliderModel"));
        assert_eq!(model.model_module(), Some("@jupyter-widgets/controls"));
    }

    #[test]
    fn unknown_updates_are_ignored_without_notification() {
        let mut store = WidgetStore::new();
        let mut changes = store.subscribe();
        assert!(!store.update("ghost", &state(json!({"x": 1})), vec![], Provenance::Kernel));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn notifications_carry_provenance() {
        let mut store = WidgetStore::new();
        let mut changes = store.subscribe();
        store.open("w1", "t", state(json!({})), vec![], Provenance::Kernel);
        store.update("w1", &state(json!({"x": 1})), vec![vec![1]], Provenance::Sandbox);
        store.remove("w1", Provenance::Host);

        let observed: Vec<_> = std::iter::from_fn(|| changes.try_recv().ok())
            .map(|change| (change.kind, change.provenance))
            .collect();
        assert_eq!(
            observed,
            [
                (ChangeKind::Opened, Provenance::Kernel),
                (ChangeKind::Updated, Provenance::Sandbox),
                (ChangeKind::Closed, Provenance::Host),
            ]
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut store = WidgetStore::new();
        drop(store.subscribe());
        store.open("w1", "t", state(json!({})), vec![], Provenance::Kernel);
        assert!(store.subscribers.is_empty());
    }
}
