/// Reactor adapter tests
///
/// Single ownership of the view, callback discipline, subscription
/// deferreds, and teardown semantics.
/// Run with: cargo test --test reactor_tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use statefabric::reactor::{AsyncView, ErrorCallback, UpdateMap};
use statefabric::test_harness::InMemoryManager;
use statefabric::{ConflictPolicy, FabricConfig, FabricError, Key, Keyspace};

const WAIT: Duration = Duration::from_secs(10);

fn new_adapter(manager: &InMemoryManager, on_error: ErrorCallback) -> AsyncView {
    let view = manager.connect_view().unwrap();
    assert!(view.wait_connect(Duration::from_secs(5)).unwrap());
    AsyncView::start(view, on_error)
}

fn quiet_errors() -> ErrorCallback {
    Arc::new(|_err: &FabricError| {})
}

fn space(name: &str) -> Keyspace {
    Keyspace::new(ConflictPolicy::ValueWins, name, 1)
}

fn wait_until(deadline_from_now: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + deadline_from_now;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_every_closure_runs_exactly_once_with_callback_after() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let errors_sink = Arc::clone(&errors);
    let adapter = Arc::new(new_adapter(
        &manager,
        Arc::new(move |_err| {
            errors_sink.fetch_add(1, Ordering::SeqCst);
        }),
    ));

    const THREADS: usize = 50;
    const CALLS_PER_THREAD: usize = 100;

    let executed = Arc::new(AtomicUsize::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));
    let out_of_order = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let adapter = Arc::clone(&adapter);
        let executed = Arc::clone(&executed);
        let callbacks = Arc::clone(&callbacks);
        let out_of_order = Arc::clone(&out_of_order);
        handles.push(std::thread::spawn(move || {
            for _ in 0..CALLS_PER_THREAD {
                let ran = Arc::new(AtomicBool::new(false));
                let ran_in_closure = Arc::clone(&ran);
                let executed = Arc::clone(&executed);
                let callbacks = Arc::clone(&callbacks);
                let out_of_order = Arc::clone(&out_of_order);
                adapter
                    .reactor_thread_call(
                        Box::new(move |_view| {
                            ran_in_closure.store(true, Ordering::SeqCst);
                            executed.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                        Some(Box::new(move || {
                            if !ran.load(Ordering::SeqCst) {
                                out_of_order.fetch_add(1, Ordering::SeqCst);
                            }
                            callbacks.fetch_add(1, Ordering::SeqCst);
                        })),
                        None,
                    )
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let total = THREADS * CALLS_PER_THREAD;
    assert!(wait_until(WAIT, || callbacks.load(Ordering::SeqCst) == total));
    assert_eq!(executed.load(Ordering::SeqCst), total);
    assert_eq!(out_of_order.load(Ordering::SeqCst), 0);
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    adapter.stop();
    manager.shutdown();
}

#[test]
fn test_subscription_deferred_and_update_callbacks() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();
    let adapter = new_adapter(&manager, quiet_errors());
    let keyspace = space("watched");

    let seen: Arc<Mutex<Vec<UpdateMap>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_sink = Arc::clone(&seen);
    let deferred = adapter.subscribe_to_keyspace(
        keyspace.clone(),
        0,
        Some(Box::new(move |updates: &UpdateMap| {
            seen_sink.lock().unwrap().push(updates.clone());
        })),
    );
    assert_eq!(deferred.wait(WAIT), Some(Ok(())));

    let key = Key::new(keyspace.clone(), vec![json!("watched-key")]);
    adapter
        .push_transaction(key.clone(), Some(json!("watched-value")), None, None)
        .unwrap();

    assert!(wait_until(WAIT, || {
        seen.lock()
            .unwrap()
            .iter()
            .any(|batch| batch.get(&key) == Some(&Some(json!("watched-value"))))
    }));

    adapter.stop();
    manager.shutdown();
}

#[test]
fn test_duplicate_keyspace_subscription_is_rejected() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();
    let adapter = new_adapter(&manager, quiet_errors());
    let keyspace = space("once-only");

    let first = adapter.subscribe_to_keyspace(keyspace.clone(), 0, None);
    assert_eq!(first.wait(WAIT), Some(Ok(())));

    let second = adapter.subscribe_to_keyspace(keyspace, 0, None);
    let outcome = second.wait(WAIT).expect("deferred must settle");
    assert!(outcome.is_err());

    adapter.stop();
    manager.shutdown();
}

#[test]
fn test_push_transaction_without_subscription_hits_errback() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();
    let adapter = new_adapter(&manager, quiet_errors());

    let failure: Arc<Mutex<Option<FabricError>>> = Arc::new(Mutex::new(None));
    let failure_sink = Arc::clone(&failure);
    let called_back = Arc::new(AtomicBool::new(false));
    let called_back_sink = Arc::clone(&called_back);

    let key = Key::new(space("never-subscribed"), vec![json!("k")]);
    adapter
        .push_transaction(
            key,
            Some(json!("v")),
            Some(Box::new(move || {
                called_back_sink.store(true, Ordering::SeqCst);
            })),
            Some(Box::new(move |err| {
                *failure_sink.lock().unwrap() = Some(err);
            })),
        )
        .unwrap();

    assert!(wait_until(WAIT, || failure.lock().unwrap().is_some()));
    assert!(matches!(
        failure.lock().unwrap().as_ref().unwrap(),
        FabricError::NotSubscribed(_)
    ));
    assert!(!called_back.load(Ordering::SeqCst));

    adapter.stop();
    manager.shutdown();
}

#[test]
fn test_panicking_update_callback_reports_callback_error() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();

    let callback_errors = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&callback_errors);
    let adapter = new_adapter(
        &manager,
        Arc::new(move |err| {
            if matches!(err, FabricError::Callback(_)) {
                sink.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    let keyspace = space("exploding");
    let deferred = adapter.subscribe_to_keyspace(
        keyspace.clone(),
        0,
        Some(Box::new(|_updates: &UpdateMap| {
            panic!("intentional test panic");
        })),
    );
    assert_eq!(deferred.wait(WAIT), Some(Ok(())));

    adapter
        .push_transaction(
            Key::new(keyspace, vec![json!("k")]),
            Some(json!("v")),
            None,
            None,
        )
        .unwrap();

    assert!(wait_until(WAIT, || callback_errors.load(Ordering::SeqCst) > 0));

    adapter.stop();
    manager.shutdown();
}

#[test]
fn test_stop_from_reactor_thread_does_not_deadlock() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();
    let adapter = Arc::new(new_adapter(&manager, quiet_errors()));

    let stopping = Arc::clone(&adapter);
    let stopped = Arc::new(AtomicBool::new(false));
    let stopped_sink = Arc::clone(&stopped);
    adapter
        .reactor_thread_call(
            Box::new(move |_view| Ok(())),
            Some(Box::new(move || {
                // runs on the reactor thread; the self-join must be skipped
                stopping.stop();
                stopped_sink.store(true, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

    assert!(wait_until(WAIT, || stopped.load(Ordering::SeqCst)));
    // joining from the outside still completes
    adapter.stop();
    manager.shutdown();
}

#[test]
fn test_disconnect_surfaces_through_error_callback() {
    let manager = InMemoryManager::new(&FabricConfig::default()).unwrap();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&disconnects);
    let adapter = new_adapter(
        &manager,
        Arc::new(move |err| {
            if matches!(err, FabricError::Disconnected(_)) {
                sink.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    manager.shutdown();
    assert!(wait_until(WAIT, || disconnects.load(Ordering::SeqCst) > 0));

    adapter.stop();
}
