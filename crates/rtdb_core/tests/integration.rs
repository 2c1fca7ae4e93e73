//! Integration tests for databases talking to an in-memory server.

use proptest::prelude::*;
use rtdb_core::{
    ErrorCode, EventMask, EventType, Node, Path, SyncTree, TransactionConfig, TransactionOutcome,
};
use rtdb_testkit::generators::{json_strategy, node_strategy, path_strategy};
use rtdb_testkit::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn increment(current: &Node) -> TransactionOutcome {
    TransactionOutcome::success(current.to_json_value().as_i64().unwrap_or(0) + 1)
}

#[test]
fn transaction_commits_and_listener_sees_one_value() {
    let db = TestDatabase::new();
    let foo = db.reference("foo").unwrap();

    let (latch, on_complete) = transaction_latch();
    foo.run_transaction(|_| TransactionOutcome::success(42), on_complete, true)
        .unwrap();
    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error, None);
    assert!(result.committed);
    assert_eq!(result.value, json!(42));
    assert_eq!(db.server().value("foo"), json!(42));

    let recorder = EventRecorder::new();
    foo.add_listener(EventMask::VALUE, recorder.clone()).unwrap();
    eventually("value event", || !recorder.values().is_empty());
    db.settle();
    assert_eq!(recorder.values(), vec![json!(42)]);
}

#[test]
fn queued_transactions_commit_in_order() {
    let db = TestDatabase::new();
    let foo = db.reference("foo").unwrap();

    let (first, on_first) = transaction_latch();
    let (second, on_second) = transaction_latch();
    foo.run_transaction(|_| TransactionOutcome::success(42), on_first, true)
        .unwrap();
    foo.run_transaction(|_| TransactionOutcome::success(84), on_second, true)
        .unwrap();

    assert!(first.wait(DEFAULT_TIMEOUT).unwrap().committed);
    assert!(second.wait(DEFAULT_TIMEOUT).unwrap().committed);
    assert_eq!(db.server().value("foo"), json!(84));
}

#[test]
fn hijacked_hash_gives_up_after_max_retries() {
    let db = TestDatabase::new();
    eventually("connection", || db.connection.is_online());
    db.hasher.hijack();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let (latch, on_complete) = transaction_latch();
    db.reference("foo")
        .unwrap()
        .run_transaction(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                TransactionOutcome::success(42)
            },
            on_complete,
            true,
        )
        .unwrap();

    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::MaxRetries));
    assert!(!result.committed);
    let stats = db.server().stats();
    assert_eq!(stats.conditional_puts, 25);
    assert_eq!(stats.stale_puts, 25);
    assert_eq!(runs.load(Ordering::SeqCst), 25);
    assert_eq!(db.server().value("foo"), Value::Null);

    db.settle();
    let local = db
        .inspect(DEFAULT_TIMEOUT, |repo| repo.queued_transactions())
        .unwrap();
    assert_eq!(local, 0);
}

#[test]
fn retry_ceiling_is_configurable() {
    let server = MemoryServer::new();
    let db = TestDatabase::with_transactions(&server, TransactionConfig::default().with_max_retries(3));
    eventually("connection", || db.connection.is_online());
    db.hasher.hijack();

    let (latch, on_complete) = transaction_latch();
    db.reference("n")
        .unwrap()
        .run_transaction(increment, on_complete, true)
        .unwrap();
    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::MaxRetries));
    assert_eq!(server.stats().conditional_puts, 3);
}

#[test]
fn aborted_transaction_leaves_server_untouched() {
    let server = MemoryServer::with_data(&json!({"foo": 5})).unwrap();
    let db = TestDatabase::with_server(&server);

    let (latch, on_complete) = transaction_latch();
    db.reference("foo")
        .unwrap()
        .run_transaction(|_| TransactionOutcome::Abort, on_complete, true)
        .unwrap();
    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error, None);
    assert!(!result.committed);

    db.settle();
    assert_eq!(server.value("foo"), json!(5));
    assert_eq!(server.stats().puts, 0);
}

#[test]
fn panicking_handler_reports_user_code_exception() {
    let db = TestDatabase::new();
    let (latch, on_complete) = transaction_latch();
    db.reference("boom")
        .unwrap()
        .run_transaction(|_| panic!("handler failed"), on_complete, true)
        .unwrap();
    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::UserCodeException));
    assert!(!result.committed);

    // The loop survives the panic.
    db.reference("after").unwrap().set_value(1).unwrap();
    eventually("write after panic", || db.server().value("after") == json!(1));
}

#[test]
fn overlapping_set_overrides_sent_transaction() {
    let db = TestDatabase::new();
    eventually("connection", || db.connection.is_online());
    db.connection.pause_delivery();

    let (overridden, on_overridden) = transaction_latch();
    let (sibling, on_sibling) = transaction_latch();
    db.reference("a/b")
        .unwrap()
        .run_transaction(|_| TransactionOutcome::success(1), on_overridden, true)
        .unwrap();
    db.reference("c")
        .unwrap()
        .run_transaction(|_| TransactionOutcome::success(2), on_sibling, true)
        .unwrap();
    db.settle();

    db.reference("a").unwrap().set_json(&json!({"x": true})).unwrap();
    db.settle();
    db.connection.flush();

    let result = overridden.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::OverriddenBySet));
    assert!(!result.committed);

    let result = sibling.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error, None);
    assert!(result.committed);

    assert_eq!(db.server().value("a"), json!({"x": true}));
    assert_eq!(db.server().value("c"), json!(2));
}

#[test]
fn disconnect_aborts_sent_transaction() {
    let db = TestDatabase::new();
    eventually("connection", || db.connection.is_online());
    db.connection.pause_delivery();

    let (latch, on_complete) = transaction_latch();
    db.reference("t")
        .unwrap()
        .run_transaction(increment, on_complete, true)
        .unwrap();
    db.settle();
    assert_eq!(latch.get(), None);

    db.connection.disconnect();
    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::Disconnected));
    assert!(!result.committed);
}

#[test]
fn offline_transaction_waits_for_connection() {
    let server = MemoryServer::with_data(&json!({"visits": 7})).unwrap();
    let db = TestDatabase::offline(&server);

    let (latch, on_complete) = transaction_latch();
    db.reference("visits")
        .unwrap()
        .run_transaction(increment, on_complete, true)
        .unwrap();
    db.settle();
    assert_eq!(latch.get(), None);
    assert_eq!(server.stats().puts, 0);

    db.connection.connect();
    let result = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert!(result.committed);
    assert_eq!(server.value("visits"), json!(8));
}

#[test]
fn clients_contending_on_a_counter_never_lose_increments() {
    let server = MemoryServer::with_data(&json!({"counter": 0})).unwrap();
    let clients = scenarios::clients(&server, 2);

    let latches: Vec<_> = clients
        .iter()
        .map(|client| {
            let (latch, on_complete) = transaction_latch();
            client
                .reference("counter")
                .unwrap()
                .run_transaction(increment, on_complete, true)
                .unwrap();
            latch
        })
        .collect();

    for latch in &latches {
        assert!(latch.wait(DEFAULT_TIMEOUT).unwrap().committed);
    }
    assert_eq!(server.value("counter"), json!(2));
}

#[test]
fn remote_writes_reach_other_clients() {
    let server = MemoryServer::new();
    let clients = scenarios::clients(&server, 2);
    let recorder = EventRecorder::new();
    clients[1]
        .reference("shared")
        .unwrap()
        .add_listener(EventMask::VALUE, recorder.clone())
        .unwrap();
    eventually("initial value", || recorder.values() == vec![Value::Null]);

    clients[0]
        .reference("shared")
        .unwrap()
        .update_children([("a", 1), ("b/c", 2)])
        .unwrap();
    eventually("merged value", || {
        recorder.values().last() == Some(&json!({"a": 1, "b": {"c": 2}}))
    });
}

#[test]
fn priority_query_tracks_its_window() {
    let server = scenarios::chat_server();
    let db = TestDatabase::with_server(&server);
    let recorder = EventRecorder::new();
    db.reference("rooms/lobby/messages")
        .unwrap()
        .order_by_priority()
        .unwrap()
        .limit_to_first(2)
        .unwrap()
        .add_listener(EventMask::CHILD, recorder.clone())
        .unwrap();

    eventually("initial window", || recorder.child_events().len() == 2);
    assert_eq!(
        recorder.child_events(),
        vec![
            (EventType::ChildAdded, "m2".to_string()),
            (EventType::ChildAdded, "m3".to_string()),
        ]
    );

    recorder.clear();
    server
        .set("rooms/lobby/messages/m0", &json!({".value": "yo", ".priority": 0}))
        .unwrap();
    eventually("window change", || recorder.child_events().len() >= 2);
    db.settle();
    let events = recorder.child_events();
    assert!(events.contains(&(EventType::ChildRemoved, "m3".to_string())));
    assert!(events.contains(&(EventType::ChildAdded, "m0".to_string())));
}

#[test]
fn rejected_write_is_reverted_for_listeners() {
    let server = MemoryServer::new();
    server.deny_writes("locked", "permission_denied");
    let db = TestDatabase::with_server(&server);
    let recorder = EventRecorder::new();
    let locked = db.reference("locked").unwrap();
    locked.add_listener(EventMask::VALUE, recorder.clone()).unwrap();
    eventually("initial value", || !recorder.values().is_empty());

    let (latch, on_complete) = write_latch();
    locked.set_value_with_completion("nope", on_complete).unwrap();
    let error = latch.wait(DEFAULT_TIMEOUT).unwrap();
    assert_eq!(error.map(|e| e.code), Some(ErrorCode::PermissionDenied));
    db.settle();
    assert_eq!(recorder.values(), vec![Value::Null, json!("nope"), Value::Null]);
}

#[test]
fn stress_counter_matches_commits() {
    let server = MemoryServer::new();
    let config = StressConfig {
        clients: 3,
        ops_per_client: 5,
    };
    let (result, value) = stress_counter_contention(&server, "hits", &config);
    assert_eq!(result.total_ops, 15);
    assert_eq!(value, json!(result.successful_ops as i64));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn exported_nodes_rebuild_in_an_empty_tree(node in node_strategy(3)) {
        let exported = node.to_export_json();
        let mut tree = SyncTree::new();
        tree.apply_server_overwrite(&Path::root(), Node::from_json(&exported).unwrap());
        let rebuilt = tree.server_node(&Path::root());
        let keys = |n: &Node| n.children().map(|(k, _)| k.clone()).collect::<Vec<_>>();
        prop_assert_eq!(keys(&rebuilt), keys(&node));
        prop_assert_eq!(rebuilt, node);
    }

    #[test]
    fn local_cache_converges_with_server(
        writes in prop::collection::vec((path_strategy(2), json_strategy(2)), 1..8)
    ) {
        let db = TestDatabase::new();
        let recorder = EventRecorder::new();
        db.root().add_listener(EventMask::VALUE, recorder.clone()).unwrap();
        for (path, value) in &writes {
            db.reference(&path.to_string()).unwrap().set_json(value).unwrap();
        }
        db.settle();
        let local = db
            .inspect(DEFAULT_TIMEOUT, |repo| repo.effective_node(&Path::root()).to_json_value())
            .unwrap();
        prop_assert_eq!(local, db.server().value(""));
        prop_assert_eq!(recorder.values().last().cloned(), Some(db.server().value("")));
    }
}
