mod common;

use std::rc::Rc;
use std::time::Duration;

use common::object;
use outframe::comm::kernel::{KernelCommEvent, KernelCommRequest};
use outframe::comm::store::{Provenance, SharedStore, WidgetStore};
use outframe::comm::{BridgeConfig, BridgeState, CommBridge, CommBridgeError};
use outframe::frame::WidgetEvent;
use outframe::protocol::{
    CommClosePayload, CommMethod, CommMsgPayload, CommOpenPayload, CommSyncPayload, HostMessage,
    SyncedModel,
};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type Bridge = CommBridge<UnboundedSender<KernelCommRequest>>;

fn bridge_with(store: &SharedStore, config: BridgeConfig) -> (Bridge, UnboundedReceiver<KernelCommRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommBridge::new(Rc::clone(store), tx, config), rx)
}

fn ready_bridge(store: &SharedStore) -> (Bridge, UnboundedReceiver<KernelCommRequest>, Vec<HostMessage>) {
    let (mut bridge, rx) = bridge_with(store, BridgeConfig::default());
    let mut sent = Vec::new();
    bridge.handle_widget_event(&mut sent, WidgetEvent::Ready).unwrap();
    (bridge, rx, sent)
}

fn open(store: &SharedStore, comm_id: &str, state: serde_json::Value) {
    store
        .borrow_mut()
        .open(comm_id, "jupyter.widget", object(state), Vec::new(), Provenance::Kernel);
}

fn update_msg(comm_id: &str, data: serde_json::Value) -> HostMessage {
    HostMessage::CommMsg(CommMsgPayload {
        comm_id: comm_id.into(),
        method: CommMethod::Update,
        data,
        buffers: Vec::new(),
    })
}

#[test]
fn handshake_syncs_then_forwards_a_single_minimal_update() {
    let store = WidgetStore::shared();
    open(&store, "w1", json!({"x": 0}));

    let (mut bridge, _kernel) = bridge_with(&store, BridgeConfig::default());
    let mut sent = Vec::new();
    bridge.announce(&mut sent).unwrap();
    assert_eq!(sent, vec![HostMessage::BridgeReady]);
    assert_eq!(bridge.state(), BridgeState::Buffering);

    bridge.handle_widget_event(&mut sent, WidgetEvent::Ready).unwrap();
    assert!(bridge.is_ready());
    assert_eq!(
        sent[1..],
        [HostMessage::CommSync(CommSyncPayload {
            models: vec![SyncedModel {
                comm_id: "w1".into(),
                target_name: "jupyter.widget".into(),
                state: object(json!({"x": 0})),
                buffers: Vec::new(),
            }]
        })]
    );

    store
        .borrow_mut()
        .update("w1", &object(json!({"x": 1})), Vec::new(), Provenance::Kernel);
    assert_eq!(bridge.sync_store(&mut sent).unwrap(), 1);
    assert_eq!(sent[2..], [update_msg("w1", json!({"x": 1}))]);
}

#[test]
fn updates_carry_only_changed_keys() {
    let store = WidgetStore::shared();
    open(&store, "m", json!({"a": 1, "b": 2}));
    let (mut bridge, _kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    store
        .borrow_mut()
        .update("m", &object(json!({"a": 1, "b": 3})), Vec::new(), Provenance::Host);
    bridge.sync_store(&mut sent).unwrap();
    assert_eq!(sent, vec![update_msg("m", json!({"b": 3}))]);

    // Nothing changed since the last snapshot.
    store
        .borrow_mut()
        .update("m", &object(json!({"b": 3})), Vec::new(), Provenance::Kernel);
    assert_eq!(bridge.sync_store(&mut sent).unwrap(), 0);
}

#[test]
fn sandbox_updates_reach_the_kernel_but_are_not_echoed() {
    let store = WidgetStore::shared();
    open(&store, "m", json!({"value": 0, "label": "x"}));
    let (mut bridge, mut kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    bridge
        .handle_widget_event(
            &mut sent,
            WidgetEvent::Update {
                comm_id: "m".into(),
                state: object(json!({"value": 42})),
                buffers: Vec::new(),
            },
        )
        .unwrap();

    assert_eq!(store.borrow().get("m").unwrap().state["value"], 42);
    assert_eq!(
        kernel.try_recv().unwrap(),
        KernelCommRequest::Update {
            comm_id: "m".into(),
            state: object(json!({"value": 42})),
            buffers: Vec::new(),
        }
    );
    assert_eq!(bridge.sync_store(&mut sent).unwrap(), 0);
    assert!(sent.is_empty());

    // A later kernel change resends only its own key.
    store
        .borrow_mut()
        .update("m", &object(json!({"label": "y"})), Vec::new(), Provenance::Kernel);
    bridge.sync_store(&mut sent).unwrap();
    assert_eq!(sent, vec![update_msg("m", json!({"label": "y"}))]);
}

#[test]
fn custom_messages_bypass_the_store() {
    let store = WidgetStore::shared();
    open(&store, "m", json!({"value": 0}));
    let (mut bridge, mut kernel, mut sent) = ready_bridge(&store);
    sent.clear();
    let mut changes = store.borrow_mut().subscribe();

    bridge
        .handle_widget_event(
            &mut sent,
            WidgetEvent::Custom {
                comm_id: "m".into(),
                data: json!({"event": "click"}),
                buffers: vec![vec![1, 2, 3]],
            },
        )
        .unwrap();

    assert!(changes.try_recv().is_err());
    assert!(matches!(
        kernel.try_recv().unwrap(),
        KernelCommRequest::Custom { comm_id, buffers, .. } if comm_id == "m" && buffers == vec![vec![1, 2, 3]]
    ));
    assert!(sent.is_empty());
}

#[test]
fn kernel_traffic_before_ready_is_buffered_and_replayed_in_order() {
    let store = WidgetStore::shared();
    let (mut bridge, _kernel) = bridge_with(&store, BridgeConfig::default());
    let mut sent = Vec::new();

    bridge
        .handle_kernel_event(
            &mut sent,
            KernelCommEvent::Open {
                comm_id: "w2".into(),
                target_name: "jupyter.widget".into(),
                state: object(json!({"n": 1})),
                buffers: Vec::new(),
            },
        )
        .unwrap();
    for index in 0..3 {
        bridge
            .handle_kernel_event(
                &mut sent,
                KernelCommEvent::Custom {
                    comm_id: "w2".into(),
                    data: json!({"seq": index}),
                    buffers: Vec::new(),
                },
            )
            .unwrap();
    }
    assert!(sent.is_empty());
    assert_eq!(bridge.pending_len(), 3);

    bridge.handle_widget_event(&mut sent, WidgetEvent::Ready).unwrap();
    assert_eq!(sent.len(), 4);
    assert!(matches!(&sent[0], HostMessage::CommSync(sync) if sync.models.len() == 1));
    let order: Vec<_> = sent[1..]
        .iter()
        .map(|message| match message {
            HostMessage::CommMsg(msg) => {
                assert_eq!(msg.method, CommMethod::Custom);
                msg.data["seq"].as_i64().unwrap()
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(order, [0, 1, 2]);
    assert_eq!(bridge.pending_len(), 0);
}

#[test]
fn buffering_is_bounded() {
    let store = WidgetStore::shared();
    let (mut bridge, _kernel) = bridge_with(&store, BridgeConfig { buffer_capacity: 1 });
    let mut sent = Vec::new();
    let custom = || KernelCommEvent::Custom {
        comm_id: "w".into(),
        data: json!({}),
        buffers: Vec::new(),
    };
    bridge.handle_kernel_event(&mut sent, custom()).unwrap();
    let err = bridge.handle_kernel_event(&mut sent, custom()).unwrap_err();
    assert!(matches!(err, CommBridgeError::BufferFull { capacity: 1 }));
}

#[test]
fn opens_and_closes_follow_the_store() {
    let store = WidgetStore::shared();
    open(&store, "keep", json!({}));
    open(&store, "drop", json!({}));
    let (mut bridge, _kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    bridge
        .handle_kernel_event(
            &mut sent,
            KernelCommEvent::Open {
                comm_id: "fresh".into(),
                target_name: "jupyter.widget".into(),
                state: object(json!({"v": 1})),
                buffers: vec![vec![9]],
            },
        )
        .unwrap();
    assert!(matches!(
        &sent[..],
        [HostMessage::CommOpen(open)] if open.comm_id == "fresh" && open.buffers == vec![vec![9]]
    ));

    bridge
        .handle_kernel_event(&mut sent, KernelCommEvent::Close { comm_id: "drop".into() })
        .unwrap();
    assert_eq!(
        sent.last(),
        Some(&HostMessage::CommClose(CommClosePayload {
            comm_id: "drop".into()
        }))
    );
    assert_eq!(bridge.tracked(), ["fresh", "keep"]);
}

#[test]
fn sandbox_close_notifies_kernel_without_echo() {
    let store = WidgetStore::shared();
    open(&store, "m", json!({}));
    let (mut bridge, mut kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    bridge
        .handle_widget_event(&mut sent, WidgetEvent::Close { comm_id: "m".into() })
        .unwrap();
    assert!(!store.borrow().contains("m"));
    assert_eq!(
        kernel.try_recv().unwrap(),
        KernelCommRequest::Close { comm_id: "m".into() }
    );
    assert_eq!(bridge.sync_store(&mut sent).unwrap(), 0);
    assert!(bridge.tracked().is_empty());
}

#[test]
fn changed_buffers_are_resent_with_the_update() {
    let store = WidgetStore::shared();
    open(&store, "img", json!({"format": "png"}));
    let (mut bridge, _kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    bridge
        .handle_kernel_event(
            &mut sent,
            KernelCommEvent::Update {
                comm_id: "img".into(),
                state: object(json!({})),
                buffers: vec![vec![0x89, 0x50]],
            },
        )
        .unwrap();
    assert_eq!(
        sent,
        vec![HostMessage::CommMsg(CommMsgPayload {
            comm_id: "img".into(),
            method: CommMethod::Update,
            data: json!({}),
            buffers: vec![vec![0x89, 0x50]],
        })]
    );
}

#[test]
fn unknown_models_and_duplicate_ready_are_ignored() {
    let store = WidgetStore::shared();
    let (mut bridge, mut kernel, mut sent) = ready_bridge(&store);
    assert_eq!(sent.len(), 1);

    bridge
        .handle_widget_event(
            &mut sent,
            WidgetEvent::Update {
                comm_id: "ghost".into(),
                state: object(json!({"x": 1})),
                buffers: Vec::new(),
            },
        )
        .unwrap();
    assert!(kernel.try_recv().is_err());

    bridge.handle_widget_event(&mut sent, WidgetEvent::Ready).unwrap();
    assert_eq!(sent.len(), 1);
}

#[test]
fn closed_kernel_channel_is_reported() {
    let store = WidgetStore::shared();
    open(&store, "m", json!({}));
    let (mut bridge, kernel, mut sent) = ready_bridge(&store);
    drop(kernel);

    let err = bridge
        .handle_widget_event(
            &mut sent,
            WidgetEvent::Custom {
                comm_id: "m".into(),
                data: json!(null),
                buffers: Vec::new(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, CommBridgeError::Kernel(_)));
}

#[test]
fn reopened_model_is_announced_again_and_then_stays_quiet() {
    let store = WidgetStore::shared();
    store.borrow_mut().open(
        "w1",
        "jupyter.widget",
        object(json!({"format": "png", "stale": true})),
        vec![vec![1, 2]],
        Provenance::Kernel,
    );
    open(&store, "w2", json!({"n": 0}));
    let (mut bridge, _kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    bridge
        .handle_kernel_event(
            &mut sent,
            KernelCommEvent::Open {
                comm_id: "w1".into(),
                target_name: "jupyter.widget.control".into(),
                state: object(json!({"format": "png"})),
                buffers: Vec::new(),
            },
        )
        .unwrap();
    assert_eq!(
        sent,
        vec![HostMessage::CommOpen(CommOpenPayload {
            comm_id: "w1".into(),
            target_name: "jupyter.widget.control".into(),
            state: object(json!({"format": "png"})),
            buffers: Vec::new(),
        })]
    );
    sent.clear();

    store
        .borrow_mut()
        .update("w2", &object(json!({"n": 1})), Vec::new(), Provenance::Host);
    assert_eq!(bridge.sync_store(&mut sent).unwrap(), 1);
    assert_eq!(sent, vec![update_msg("w2", json!({"n": 1}))]);

    sent.clear();
    store
        .borrow_mut()
        .update("w2", &object(json!({"n": 2})), Vec::new(), Provenance::Host);
    bridge.sync_store(&mut sent).unwrap();
    assert_eq!(sent, vec![update_msg("w2", json!({"n": 2}))]);
}

#[test]
fn replaced_buffers_are_sent_once() {
    let store = WidgetStore::shared();
    store.borrow_mut().open(
        "img",
        "jupyter.widget",
        object(json!({})),
        vec![vec![1]],
        Provenance::Kernel,
    );
    open(&store, "other", json!({"n": 0}));
    let (mut bridge, _kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    store
        .borrow_mut()
        .update("img", &object(json!({})), vec![vec![2]], Provenance::Host);
    assert_eq!(bridge.sync_store(&mut sent).unwrap(), 1);

    sent.clear();
    store
        .borrow_mut()
        .update("other", &object(json!({"n": 1})), Vec::new(), Provenance::Host);
    bridge.sync_store(&mut sent).unwrap();
    assert_eq!(sent, vec![update_msg("other", json!({"n": 1}))]);
}

#[tokio::test]
async fn next_sync_waits_for_a_store_change() {
    let store = WidgetStore::shared();
    open(&store, "m", json!({"v": 0}));
    let (mut bridge, _kernel, mut sent) = ready_bridge(&store);
    sent.clear();

    let idle = tokio::time::timeout(Duration::from_millis(20), bridge.next_sync(&mut sent)).await;
    assert!(idle.is_err());

    store
        .borrow_mut()
        .update("m", &object(json!({"v": 1})), Vec::new(), Provenance::Host);
    assert_eq!(bridge.next_sync(&mut sent).await.unwrap(), 1);
    assert_eq!(sent, vec![update_msg("m", json!({"v": 1}))]);
}
