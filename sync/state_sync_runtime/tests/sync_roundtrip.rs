use std::sync::{Arc, Mutex};
use std::thread;

use state_sync_runtime::protocol::{ClientEvent, ServerEnvelope, hello_envelope};
use state_sync_runtime::{
    ChangeEntry, ClientEnvelope, ClientSession, ConnectionState, NodeId, ReconnectStep,
    ServerSession, StateError, SyncConfig, UiContext,
};
use serde_json::json;

struct Link {
    server: Arc<ServerSession>,
    client: ClientSession,
    now_ms: u64,
}

impl Link {
    fn connect(config: SyncConfig) -> Self {
        let mut link = Self {
            server: Arc::new(ServerSession::new("S1", &config)),
            client: ClientSession::new("S1", &config),
            now_ms: 0,
        };
        let hello = link.client.connect();
        link.exchange(vec![hello]);
        assert_eq!(link.client.state(), ConnectionState::Synchronized);
        link
    }

    /// Delivers client envelopes to the server and everything that comes back
    /// to the client, until both sides are quiet.
    fn exchange(&mut self, mut to_server: Vec<ClientEnvelope>) {
        while !to_server.is_empty() {
            let mut to_client = Vec::new();
            for envelope in to_server.drain(..) {
                let replies = self
                    .server
                    .handle_client(envelope, self.now_ms)
                    .expect("server handles envelope");
                to_client.extend(replies);
            }
            self.deliver(to_client, &mut to_server);
        }
    }

    fn deliver(&mut self, envelopes: Vec<Arc<ServerEnvelope>>, out: &mut Vec<ClientEnvelope>) {
        for envelope in envelopes {
            out.extend(self.client.handle_server((*envelope).clone(), self.now_ms));
        }
    }

    fn flush(&self) -> Option<Arc<ServerEnvelope>> {
        self.server.flush_outgoing().expect("flush")
    }

    fn sync(&mut self) {
        if let Some(envelope) = self.flush() {
            let mut back = Vec::new();
            self.deliver(vec![envelope], &mut back);
            self.exchange(back);
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut UiContext) -> Result<R, StateError>) -> R {
        self.server
            .access(f)
            .expect("session lock")
            .expect("tree mutation")
    }

    fn reconnect(&mut self) {
        self.client.on_transport_lost();
        self.server.on_disconnect().expect("disconnect");
    }
}

fn seq_of(envelope: &ServerEnvelope) -> u64 {
    match envelope {
        ServerEnvelope::Sync(message) => message.seq,
        other => panic!("expected sync envelope, got {other:?}"),
    }
}

fn changes_of(envelope: &ServerEnvelope) -> &[ChangeEntry] {
    match envelope {
        ServerEnvelope::Sync(message) => &message.changes,
        other => panic!("expected sync envelope, got {other:?}"),
    }
}

fn add_child(ui: &mut UiContext) -> Result<NodeId, StateError> {
    let node = ui.tree_mut().create_node();
    ui.tree_mut().append_child(NodeId::ROOT, node)?;
    Ok(node)
}

/// A second client built purely from a snapshot of the same server.
fn snapshot_mirror(server: &ServerSession) -> ClientSession {
    let mut fresh = ClientSession::new("S1", &SyncConfig::default());
    let hello = fresh.connect();
    for envelope in server.handle_client(hello, 0).expect("hello") {
        fresh.handle_server((*envelope).clone(), 0);
    }
    assert_eq!(fresh.state(), ConnectionState::Synchronized);
    fresh
}

#[test]
fn property_writes_in_one_window_coalesce() {
    let mut link = Link::connect(SyncConfig::default());
    let node = link.mutate(|ui| {
        for _ in 0..3 {
            ui.tree_mut().create_node();
        }
        add_child(ui)
    });
    assert_eq!(node, NodeId::new(5));
    link.mutate(|ui| ui.tree_mut().set_property(node, "value", json!("a")));
    link.sync();

    link.mutate(|ui| {
        ui.tree_mut().set_property(node, "value", json!("x"))?;
        ui.tree_mut().set_property(node, "value", json!("b"))
    });
    let flushed = link.flush().expect("one message");
    assert_eq!(
        changes_of(&flushed),
        &[ChangeEntry::put(node, "value", json!("b"))]
    );

    let mut back = Vec::new();
    link.deliver(vec![flushed], &mut back);
    assert_eq!(link.client.mirror().property(node, "value"), Some(&json!("b")));

    link.mutate(|ui| ui.tree_mut().set_property(node, "value", json!("b")));
    assert!(link.flush().is_none());
}

#[test]
fn reconnect_replays_only_unacknowledged_messages() {
    let mut link = Link::connect(SyncConfig::default());
    let node = link.mutate(add_child);
    let second = link.flush().expect("message 2");
    let mut acks = Vec::new();
    link.deliver(vec![Arc::clone(&second)], &mut acks);
    link.mutate(|ui| ui.tree_mut().set_property(node, "step", json!(3)));
    link.sync();
    link.exchange(acks);
    assert_eq!(link.client.last_applied(), Some(3));

    link.mutate(|ui| ui.tree_mut().set_property(node, "step", json!(4)));
    let lost_four = link.flush().expect("message 4");
    link.mutate(|ui| ui.tree_mut().set_property(node, "step", json!(5)));
    let lost_five = link.flush().expect("message 5");
    assert_eq!((seq_of(&lost_four), seq_of(&lost_five)), (4, 5));

    link.reconnect();
    link.mutate(|ui| ui.tree_mut().set_property(node, "late", json!(true)));
    assert!(link.flush().is_none());

    let hello = link.client.on_transport_restored().expect("hello");
    assert_eq!(hello, hello_envelope("S1".to_string(), Some(3)));

    let replies = link.server.handle_client(hello, 0).expect("replay");
    let seqs: Vec<_> = replies
        .iter()
        .filter(|envelope| matches!(***envelope, ServerEnvelope::Sync(_)))
        .map(|envelope| seq_of(envelope))
        .collect();
    assert_eq!(seqs, vec![4, 5, 6]);
    assert!(matches!(
        *replies[3],
        ServerEnvelope::Resume { seq: 6, .. }
    ));

    let mut back = Vec::new();
    link.deliver(replies, &mut back);
    link.exchange(back);
    assert_eq!(link.client.state(), ConnectionState::Synchronized);
    assert_eq!(link.client.mirror().property(node, "step"), Some(&json!(5)));
    assert_eq!(link.client.mirror().property(node, "late"), Some(&json!(true)));

    let before = link.client.mirror().clone();
    let duplicate = link.client.handle_server((*second).clone(), 0);
    assert_eq!(
        duplicate,
        vec![ClientEnvelope::Ack {
            sid: "S1".to_string(),
            seq: 6
        }]
    );
    assert_eq!(*link.client.mirror(), before);
}

#[test]
fn out_of_order_messages_wait_for_the_gap() {
    let mut link = Link::connect(SyncConfig::default());
    let node = link.mutate(add_child);
    let two = link.flush().expect("message 2");
    link.mutate(|ui| ui.tree_mut().set_property(node, "value", json!("late")));
    let three = link.flush().expect("message 3");

    let mut back = Vec::new();
    link.deliver(vec![Arc::clone(&three)], &mut back);
    assert!(back.is_empty());
    assert!(link.client.mirror().node(node).is_none());

    link.deliver(vec![two], &mut back);
    assert_eq!(link.client.last_applied(), Some(3));
    assert_eq!(link.client.mirror().property(node, "value"), Some(&json!("late")));
}

#[test]
fn incremental_mirror_matches_snapshot() {
    let mut link = Link::connect(SyncConfig::default());
    let (list, items) = link.mutate(|ui| {
        let list = add_child(ui)?;
        let mut items = Vec::new();
        for index in 0..4 {
            let item = ui.tree_mut().create_node();
            ui.tree_mut()
                .set_property(item, "label", json!(format!("item {index}")))?;
            ui.tree_mut().append_child(list, item)?;
            items.push(item);
        }
        ui.add_event_listener(list, "scroll", |_tree, _data| Ok(()))?;
        Ok((list, items))
    });
    link.sync();

    link.mutate(|ui| {
        let tree = ui.tree_mut();
        tree.detach_child(list, items[1])?;
        let replacement = tree.create_node();
        tree.attach_child(list, 0, replacement)?;
        tree.set_property(items[3], "label", json!("last"))?;
        tree.remove_property(items[0], "label")?;
        // Attached and detached within one window: never reaches the client.
        let transient = tree.create_node();
        tree.append_child(list, transient)?;
        tree.detach_child(list, transient)
    });
    link.sync();

    let fresh = snapshot_mirror(&link.server);
    assert_eq!(link.client.mirror(), fresh.mirror());
    assert_eq!(link.client.mirror().debug_json(), fresh.mirror().debug_json());
}

#[test]
fn exhausted_reconnects_resync_from_snapshot() {
    let config = SyncConfig {
        reconnect_attempts: 2,
        reconnect_interval_ms: 50,
        ..SyncConfig::default()
    };
    let mut link = Link::connect(config);
    let node = link.mutate(add_child);
    link.sync();

    link.reconnect();
    link.mutate(|ui| ui.tree_mut().set_property(node, "value", json!("while away")));

    assert_eq!(link.client.next_reconnect_step(), ReconnectStep::Now);
    assert_eq!(
        link.client.next_reconnect_step(),
        ReconnectStep::After { delay_ms: 50 }
    );
    assert_eq!(link.client.next_reconnect_step(), ReconnectStep::GiveUp);
    assert_eq!(link.client.state(), ConnectionState::Resyncing);

    let hello = link.client.on_transport_restored().expect("hello");
    assert_eq!(hello, hello_envelope("S1".to_string(), None));
    link.exchange(vec![hello]);

    assert_eq!(link.client.state(), ConnectionState::Synchronized);
    assert_eq!(
        link.client.mirror().property(node, "value"),
        Some(&json!("while away"))
    );
}

#[test]
fn overflowed_resend_queue_falls_back_to_snapshot() {
    let config = SyncConfig {
        max_resend_messages: 2,
        ..SyncConfig::default()
    };
    let mut link = Link::connect(config);
    let node = link.mutate(add_child);
    link.sync();

    for step in 0..4 {
        link.mutate(|ui| ui.tree_mut().set_property(node, "step", json!(step)));
        link.flush().expect("lost message");
    }

    link.reconnect();
    let hello = link.client.on_transport_restored().expect("hello");
    let replies = link.server.handle_client(hello, 0).expect("hello reply");
    match &*replies[0] {
        ServerEnvelope::Sync(message) => assert!(message.resync),
        other => panic!("expected snapshot, got {other:?}"),
    }

    let mut back = Vec::new();
    link.deliver(replies, &mut back);
    link.exchange(back);
    assert_eq!(link.client.state(), ConnectionState::Synchronized);
    assert_eq!(link.client.mirror().property(node, "step"), Some(&json!(3)));
}

#[test]
fn events_queued_offline_arrive_in_order_after_resume() {
    let mut link = Link::connect(SyncConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let button = link.mutate(|ui| {
        let button = add_child(ui)?;
        ui.add_event_listener(button, "click", move |_tree, data| {
            if let Ok(mut seen) = recorder.lock() {
                seen.push(data.clone());
            }
            Ok(())
        })?;
        Ok(button)
    });
    link.sync();

    let click = |n: u64| ClientEvent::Event {
        node: button,
        event: "click".to_string(),
        data: json!({ "n": n }),
    };

    let first = link.client.send_event(click(1)).expect("sent while synchronized");
    link.exchange(vec![first]);

    link.reconnect();
    assert!(link.client.send_event(click(2)).is_none());
    assert!(link.client.send_event(click(3)).is_none());

    let hello = link.client.on_transport_restored().expect("hello");
    link.exchange(vec![hello]);

    assert_eq!(link.client.queued_events(), 0);
    assert_eq!(link.client.unacknowledged(), 0);
    let seen = seen.lock().expect("recorded clicks").clone();
    assert_eq!(seen, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
}

#[test]
fn unacknowledged_events_are_resent_after_reconnect() {
    let mut link = Link::connect(SyncConfig::default());
    let input = link.mutate(add_child);
    link.sync();

    let sync = ClientEvent::PropertySync {
        node: input,
        key: "value".to_string(),
        value: json!("typed"),
    };
    // Sent but never delivered.
    link.client.send_event(sync).expect("sent");
    assert_eq!(link.client.unacknowledged(), 1);

    link.reconnect();
    let hello = link.client.on_transport_restored().expect("hello");
    link.exchange(vec![hello]);

    assert_eq!(link.client.unacknowledged(), 0);
    let value = link
        .server
        .access(|ui| ui.tree().property(input, "value").ok().flatten().cloned())
        .expect("lock");
    assert_eq!(value, Some(json!("typed")));
    assert!(link.flush().is_none());
}

#[test]
fn concurrent_mutations_allocate_distinct_nodes() {
    let mut link = Link::connect(SyncConfig::default());

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let server = Arc::clone(&link.server);
            thread::spawn(move || {
                let mut created = Vec::new();
                for index in 0..10 {
                    let node = server
                        .access(|ui| {
                            let node = add_child(ui)?;
                            ui.tree_mut()
                                .set_property(node, "owner", json!([worker, index]))?;
                            Ok::<_, StateError>(node)
                        })
                        .expect("session lock")
                        .expect("mutation");
                    created.push(node);
                }
                created
            })
        })
        .collect();

    let mut created = Vec::new();
    for worker in workers {
        created.extend(worker.join().expect("worker thread"));
    }
    created.sort();
    created.dedup();
    assert_eq!(created.len(), 40);

    link.sync();
    let root = link.client.mirror().node(NodeId::ROOT).expect("root");
    assert_eq!(root.children.len(), 40);
    assert_eq!(link.client.mirror(), snapshot_mirror(&link.server).mirror());
}

#[test]
fn events_after_teardown_and_new_connection_reach_handlers() {
    let mut link = Link::connect(SyncConfig::default());
    let hits = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&hits);
    let button = link.mutate(|ui| {
        let button = add_child(ui)?;
        ui.add_event_listener(button, "click", move |_tree, _data| {
            if let Ok(mut hits) = counter.lock() {
                *hits += 1;
            }
            Ok(())
        })?;
        Ok(button)
    });
    link.sync();

    let click = || ClientEvent::Event {
        node: button,
        event: "click".to_string(),
        data: json!({}),
    };
    for _ in 0..3 {
        let sent = link.client.send_event(click()).expect("sent while synchronized");
        link.exchange(vec![sent]);
    }
    assert_eq!(*hits.lock().expect("hits"), 3);

    link.client.teardown();
    link.server.on_disconnect().expect("disconnect");
    let hello = link.client.connect();
    link.exchange(vec![hello]);
    assert_eq!(link.client.state(), ConnectionState::Synchronized);

    for _ in 0..2 {
        let sent = link.client.send_event(click()).expect("sent while synchronized");
        link.exchange(vec![sent]);
    }
    assert_eq!(*hits.lock().expect("hits"), 5);
    assert_eq!(link.client.unacknowledged(), 0);
}

#[test]
fn fresh_client_on_a_used_session_continues_after_the_server_position() {
    let mut link = Link::connect(SyncConfig::default());
    let input = link.mutate(add_child);
    link.sync();

    let typed = |value: &str| ClientEvent::PropertySync {
        node: input,
        key: "value".to_string(),
        value: json!(value),
    };
    let sent = link.client.send_event(typed("first")).expect("sent");
    link.exchange(vec![sent]);

    link.reconnect();
    link.client = ClientSession::new("S1", &SyncConfig::default());
    let hello = link.client.connect();
    link.exchange(vec![hello]);
    assert_eq!(link.client.state(), ConnectionState::Synchronized);

    let sent = link.client.send_event(typed("second")).expect("sent");
    link.exchange(vec![sent]);
    let value = link
        .server
        .access(|ui| ui.tree().property(input, "value").ok().flatten().cloned())
        .expect("lock");
    assert_eq!(value, Some(json!("second")));
    assert_eq!(link.client.unacknowledged(), 0);
}
