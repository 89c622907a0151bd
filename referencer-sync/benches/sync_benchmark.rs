use criterion::{criterion_group, criterion_main, Criterion};
use referencer_sync::action::{Action, ActionKind};
use referencer_sync::protocol::{ClientMessage, ServerMessage};
use referencer_sync::registry::{ConnectionRegistry, DEFAULT_OUTBOUND_CAPACITY};
use referencer_sync::storage::{Highlight, StoreConfig, WorkspaceStore};
use serde_json::json;
use std::hint::black_box;
use tokio::sync::mpsc;
use uuid::Uuid;

const ADD_HIGHLIGHT_FRAME: &str = r#"{"type":"addHighlight","requestId":"r1","payload":{"layerId":"l1","highlight":{"id":"h1","editorIndex":0,"from":12,"to":40,"text":"In the beginning","annotation":""}}}"#;

fn bench_decode_client_message(c: &mut Criterion) {
    c.bench_function("decode_add_highlight_frame", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(ADD_HIGHLIGHT_FRAME)).unwrap());
        })
    });
}

fn bench_parse_action(c: &mut Criterion) {
    let msg = ClientMessage::decode(ADD_HIGHLIGHT_FRAME).unwrap();
    c.bench_function("validate_add_highlight", |b| {
        b.iter(|| {
            black_box(Action::parse(ActionKind::AddHighlight, black_box(&msg.payload)).unwrap());
        })
    });
}

fn bench_encode_relay(c: &mut Criterion) {
    let msg = ClientMessage::decode(ADD_HIGHLIGHT_FRAME).unwrap();
    let source = Uuid::new_v4();
    c.bench_function("encode_action_relay", |b| {
        b.iter(|| {
            let relay = ServerMessage::action("addHighlight", &msg.payload, source, msg.request_id.clone());
            black_box(relay.encode().unwrap());
        })
    });
}

fn bench_load_workspace_state(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    store.ensure_workspace("bench").unwrap();
    for l in 0..10 {
        let layer_id = format!("l{l}");
        store.add_layer("bench", &layer_id, &layer_id, "#ffcc00").unwrap();
        for h in 0..50 {
            let highlight = Highlight {
                id: format!("{layer_id}-h{h}"),
                editor_index: 0,
                from: h * 10,
                to: h * 10 + 5,
                text: "verse".into(),
                annotation: String::new(),
                kind: "highlight".into(),
            };
            store.add_highlight(&layer_id, &highlight).unwrap();
        }
    }
    for e in 1..5 {
        store.add_editor("bench", e, &format!("Passage {}", e + 1)).unwrap();
        store
            .update_editor_content("bench", e, &json!({"type": "doc", "content": [{"type": "paragraph"}]}))
            .unwrap();
    }

    c.bench_function("load_workspace_10_layers_500_highlights", |b| {
        b.iter(|| {
            black_box(store.load_workspace_state(black_box("bench")).unwrap());
        })
    });
}

fn bench_reorder_layers(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    store.ensure_workspace("bench").unwrap();
    let mut ids: Vec<String> = (0..20).map(|i| format!("l{i}")).collect();
    for id in &ids {
        store.add_layer("bench", id, id, "#000").unwrap();
    }

    c.bench_function("reorder_20_layers", |b| {
        b.iter(|| {
            ids.rotate_left(1);
            store.reorder_layers("bench", black_box(&ids)).unwrap();
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = ConnectionRegistry::new();
    let mut receivers = Vec::new();
    let sender = rt.block_on(async {
        let mut first = None;
        for _ in 0..100 {
            let (tx, rx) = mpsc::channel(DEFAULT_OUTBOUND_CAPACITY);
            let id = registry.register("bench", tx).await;
            first.get_or_insert(id);
            receivers.push(rx);
        }
        first
    });
    let msg = ClientMessage::decode(ADD_HIGHLIGHT_FRAME).unwrap();
    let relay = ServerMessage::action("addHighlight", &msg.payload, Uuid::new_v4(), None);

    c.bench_function("broadcast_to_99_peers", |b| {
        b.iter(|| {
            let delivered = rt.block_on(registry.broadcast("bench", black_box(&relay), sender)).unwrap();
            black_box(delivered);
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_decode_client_message,
    bench_parse_action,
    bench_encode_relay,
    bench_load_workspace_state,
    bench_reorder_layers,
    bench_broadcast_fanout,
);
criterion_main!(benches);
