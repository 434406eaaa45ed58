/// View / transaction / subscription tests against the in-process manager.
///
/// Run with: cargo test --test view_tests

use std::time::Duration;

use serde_json::json;
use statefabric::test_harness::InMemoryManager;
use statefabric::view::ViewEvent;
use statefabric::{
    ConflictPolicy, FabricConfig, FabricError, Key, KeyRange, Keyspace, View,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn harness_config() -> FabricConfig {
    FabricConfig::default().ping_interval(Duration::from_millis(50))
}

fn new_view(manager: &InMemoryManager) -> View {
    let view = manager.connect_view().unwrap();
    assert!(view.wait_connect(CONNECT_TIMEOUT).unwrap());
    view
}

fn value_wins_space(name: &str) -> Keyspace {
    Keyspace::new(ConflictPolicy::ValueWins, name, 1)
}

fn highest_id_space(name: &str) -> Keyspace {
    Keyspace::new(ConflictPolicy::HighestIdWins, name, 1)
}

fn key(space: &Keyspace, name: &str) -> Key {
    Key::new(space.clone(), vec![json!(name)])
}

fn subscribe_all(view: &View, space: &Keyspace) {
    view.subscribe(KeyRange::all(space.clone(), 0), true).unwrap();
}

fn write(view: &View, space: &Keyspace, name: &str, value: &str) {
    let mut txn = view.transaction().unwrap();
    txn.write(key(space, name), Some(json!(value))).unwrap();
    txn.end().unwrap();
}

fn read(view: &View, space: &Keyspace, name: &str) -> Option<serde_json::Value> {
    let txn = view.transaction().unwrap();
    let value = txn.get(&key(space, name)).unwrap();
    txn.abort().unwrap();
    value
}

#[test]
fn test_write_flush_read_round_trip() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let view = new_view(&manager);
    let space = value_wins_space("S");
    subscribe_all(&view, &space);

    write(&view, &space, "a", "v1");
    view.flush(true).unwrap();

    assert_eq!(read(&view, &space, "a"), Some(json!("v1")));
    manager.shutdown();
}

#[test]
fn test_reconnect_initial_load_contains_key_once() {
    // the scenario: write, flush, read; then tear the view down, reconnect,
    // resubscribe, and expect the initial load to carry the key exactly once
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = value_wins_space("S");

    let view = new_view(&manager);
    subscribe_all(&view, &space);
    write(&view, &space, "a", "v1");
    view.flush(true).unwrap();
    assert_eq!(read(&view, &space, "a"), Some(json!("v1")));
    view.teardown();

    let view2 = new_view(&manager);
    let listener = view2.listener();
    subscribe_all(&view2, &space);

    let mut initial_keys = Vec::new();
    let mut saw_subscription_end = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !saw_subscription_end && std::time::Instant::now() < deadline {
        for event in listener.get(Duration::from_millis(100)).unwrap() {
            match event {
                ViewEvent::KeyUpdates(keys) => initial_keys.extend(keys),
                ViewEvent::SubscriptionEnd(_) => saw_subscription_end = true,
            }
        }
    }

    assert!(saw_subscription_end);
    assert_eq!(initial_keys, vec![key(&space, "a")]);
    assert_eq!(read(&view2, &space, "a"), Some(json!("v1")));
    manager.shutdown();
}

#[test]
fn test_subscription_completeness() {
    // M preexisting keys arrive before exactly one SubscriptionEnd, before
    // any later write's update
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = value_wins_space("loaded");
    let writer = new_view(&manager);
    subscribe_all(&writer, &space);

    let m = 17usize;
    for ix in 0..m {
        write(&writer, &space, &format!("key{}", ix), &format!("val{}", ix));
    }
    writer.flush(true).unwrap();

    let reader = new_view(&manager);
    let listener = reader.listener();
    reader
        .subscribe(KeyRange::all(space.clone(), 0), true)
        .unwrap();
    // a write after the load completes must come after SubscriptionEnd
    write(&writer, &space, "late", "late-value");
    writer.flush(true).unwrap();

    let mut entries_before_end = 0usize;
    let mut ends = 0usize;
    let mut late_seen_after_end = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !late_seen_after_end && std::time::Instant::now() < deadline {
        for event in listener.get(Duration::from_millis(100)).unwrap() {
            match event {
                ViewEvent::KeyUpdates(keys) => {
                    if ends == 0 {
                        entries_before_end += keys.len();
                    } else if keys.contains(&key(&space, "late")) {
                        late_seen_after_end = true;
                    }
                }
                ViewEvent::SubscriptionEnd(range) => {
                    assert_eq!(range, KeyRange::all(space.clone(), 0));
                    ends += 1;
                }
            }
        }
    }

    assert_eq!(entries_before_end, m);
    assert_eq!(ends, 1);
    assert!(late_seen_after_end);
    manager.shutdown();
}

#[test]
fn test_reads_and_writes_require_subscription() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let view = new_view(&manager);
    let space = highest_id_space("unsubscribed");

    let mut txn = view.transaction().unwrap();
    let read_err = txn.get(&key(&space, "k")).unwrap_err();
    assert!(matches!(read_err, FabricError::NotSubscribed(_)));
    let write_err = txn
        .write(key(&space, "k"), Some(json!("v")))
        .unwrap_err();
    assert!(matches!(write_err, FabricError::NotSubscribed(_)));
    txn.abort().unwrap();
    manager.shutdown();
}

#[test]
fn test_single_open_transaction_per_view() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let view = new_view(&manager);

    let txn = view.transaction().unwrap();
    assert!(view.is_frozen());
    assert!(matches!(
        view.transaction().err(),
        Some(FabricError::TransactionOpen)
    ));
    txn.abort().unwrap();
    assert!(!view.is_frozen());
    assert!(view.transaction().is_ok());
    manager.shutdown();
}

#[test]
fn test_flush_with_must_succeed_fails_inside_transaction() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let view = new_view(&manager);
    let space = value_wins_space("flushspace");
    subscribe_all(&view, &space);

    let txn = view.transaction().unwrap();
    assert!(matches!(
        view.flush(true).unwrap_err(),
        FabricError::TransactionOpen
    ));
    txn.abort().unwrap();

    view.flush(true).unwrap();
    manager.shutdown();
}

#[test]
fn test_concurrent_writers_converge_on_highest_id_keyspace() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = highest_id_space("converge");

    let v1 = new_view(&manager);
    let v2 = new_view(&manager);
    subscribe_all(&v1, &space);
    subscribe_all(&v2, &space);

    write(&v1, &space, "contested", "from-v1");
    write(&v2, &space, "contested", "from-v2");

    v1.flush(true).unwrap();
    v2.flush(true).unwrap();

    // after both flushes every broadcast is on the wire; once each side has
    // drained its stream the two caches must agree on one winner. Both wrote
    // event id 1, so the tie breaks toward the higher client id: v2.
    let winner = Some(json!("from-v2"));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let (mut from_v1, mut from_v2) = (None, None);
    while std::time::Instant::now() < deadline {
        from_v1 = read(&v1, &space, "contested");
        from_v2 = read(&v2, &space, "contested");
        if from_v1 == winner && from_v2 == winner {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(from_v1, winner);
    assert_eq!(from_v2, winner);
    manager.shutdown();
}

#[test]
fn test_stale_event_id_loses_regardless_of_arrival_order() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = highest_id_space("replay");

    let v1 = new_view(&manager);
    subscribe_all(&v1, &space);
    // two writes from the same client: ids strictly increase
    write(&v1, &space, "k", "first");
    write(&v1, &space, "k", "second");
    v1.flush(true).unwrap();
    assert_eq!(read(&v1, &space, "k"), Some(json!("second")));

    // a late subscriber sees only the winning value
    let v2 = new_view(&manager);
    subscribe_all(&v2, &space);
    assert_eq!(read(&v2, &space, "k"), Some(json!("second")));
    manager.shutdown();
}

#[test]
fn test_tombstone_write_deletes() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = value_wins_space("deletions");
    let view = new_view(&manager);
    subscribe_all(&view, &space);

    write(&view, &space, "doomed", "present");
    view.flush(true).unwrap();
    assert_eq!(read(&view, &space, "doomed"), Some(json!("present")));

    let mut txn = view.transaction().unwrap();
    txn.write(key(&space, "doomed"), None).unwrap();
    txn.end().unwrap();
    view.flush(true).unwrap();

    assert_eq!(read(&view, &space, "doomed"), None);
    manager.shutdown();
}

#[test]
fn test_writes_invisible_until_round_trip() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = value_wins_space("visibility");
    let view = new_view(&manager);
    subscribe_all(&view, &space);

    {
        let mut txn = view.transaction().unwrap();
        txn.write(key(&space, "pending"), Some(json!("x"))).unwrap();
        // readable inside the same transaction
        assert_eq!(txn.get(&key(&space, "pending")).unwrap(), Some(json!("x")));
        txn.end().unwrap();
    }

    // after flush the rebroadcast must have landed
    view.flush(true).unwrap();
    assert_eq!(read(&view, &space, "pending"), Some(json!("x")));
    manager.shutdown();
}

#[test]
fn test_next_key_iterates_in_key_order() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = value_wins_space("ordered");
    let view = new_view(&manager);
    subscribe_all(&view, &space);

    for name in ["b", "a", "c"] {
        write(&view, &space, name, "v");
    }
    view.flush(true).unwrap();

    let txn = view.transaction().unwrap();
    let mut names = Vec::new();
    let mut cursor = key(&space, "");
    while let Some(next) = txn.next_key(&cursor).unwrap() {
        names.push(next.id()[0].as_str().unwrap().to_string());
        cursor = next;
    }
    txn.abort().unwrap();

    assert_eq!(names, vec!["a", "b", "c"]);
    manager.shutdown();
}

#[test]
fn test_minimum_id_probe_round_trip() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let space = highest_id_space("pinged");
    let view = new_view(&manager);
    subscribe_all(&view, &space);

    write(&view, &space, "k", "v");
    view.flush(true).unwrap();

    manager.send_ping().unwrap();
    // the client has used event id 1, so once it answers a post-write probe
    // the recorded minimum can only be above it
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !manager.minimum_ids().values().any(|&min| min >= 2)
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }

    let minimums = manager.minimum_ids();
    assert_eq!(minimums.len(), 1);
    assert!(minimums.values().all(|&min| min >= 2));
    manager.shutdown();
}

#[test]
fn test_bearer_token_authorization() {
    let manager = InMemoryManager::with_token(&harness_config(), "secret-token").unwrap();

    let good = View::connect_with_token(
        std::sync::Arc::new(manager.connect_channel().unwrap()),
        "secret-token",
    );
    assert!(good.wait_connect(CONNECT_TIMEOUT).unwrap());
    let space = value_wins_space("authed");
    good.subscribe(KeyRange::all(space.clone(), 0), true).unwrap();

    let bad = View::connect_with_token(
        std::sync::Arc::new(manager.connect_channel().unwrap()),
        "wrong-token",
    );
    // the manager drops the connection; a blocking subscribe cannot succeed
    assert!(bad.subscribe(KeyRange::all(space, 0), true).is_err());

    good.teardown();
    bad.teardown();
    manager.shutdown();
}

#[test]
fn test_teardown_disconnects_listener() {
    let manager = InMemoryManager::new(&harness_config()).unwrap();
    let view = new_view(&manager);
    let listener = view.listener();

    view.teardown();
    assert!(matches!(
        listener.get(Duration::from_secs(1)),
        Err(FabricError::Disconnected(_))
    ));
    manager.shutdown();
}
