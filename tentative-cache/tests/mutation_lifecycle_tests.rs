//! End-to-end mutation lifecycle tests against the mock todo server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tentative_cache::{
    CacheSession, MutationOutcome, MutationPlan, RefetchOutcome, ReconciliationCoordinator,
};
use tentative_core::{CacheEntry, EntryStatus, MutationError, ReconcileConfig, RemoteFailureKind};
use tentative_test_utils::assertions::{assert_absent, assert_entry, assert_remote_failure, assert_status};
use tentative_test_utils::fixtures::{
    fast_config, todo_key, todo_server, toggle_args, toggle_plan, TodoItem,
};
use tentative_test_utils::{init_test_tracing, MockRemoteClient};

type TodoSession = CacheSession<TodoItem, MockRemoteClient<TodoItem>>;

fn session(items: &[TodoItem]) -> TodoSession {
    init_test_tracing();
    CacheSession::new(Arc::new(todo_server(items)), fast_config()).unwrap()
}

/// Yield until `done` holds, giving spawned tasks a chance to run.
async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_success_converges_to_server_value() {
    let item = TodoItem::new(1, "write docs");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item, 1).unwrap();

    session
        .dispatcher()
        .mutate_and_wait(toggle_plan(1), "todo.toggle", toggle_args(1))
        .await
        .unwrap();

    let server = session.coordinator().remote().server_value(&todo_key(1)).unwrap();
    assert!(server.done);
    assert_entry(session.store(), &todo_key(1), &server, 3, EntryStatus::Fresh);
}

#[tokio::test]
async fn test_failure_rolls_back_then_converges() {
    let item = TodoItem::new(1, "write docs");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item.clone(), 1).unwrap();
    session
        .coordinator()
        .remote()
        .fail_next("todo.toggle", RemoteFailureKind::Rejected);

    let result = session
        .dispatcher()
        .mutate_and_wait(toggle_plan(1), "todo.toggle", toggle_args(1))
        .await;

    assert_remote_failure(&result, RemoteFailureKind::Rejected);
    // Restored at version 1, then refetched one past it.
    assert_entry(session.store(), &todo_key(1), &item, 2, EntryStatus::Fresh);
}

#[tokio::test]
async fn test_subscriber_sees_pending_stale_fresh() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item, 1).unwrap();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let statuses = Arc::clone(&statuses);
        session
            .store()
            .subscribe(todo_key(1), move |e: &CacheEntry<TodoItem>| {
                statuses.lock().unwrap().push(e.status)
            })
            .unwrap()
    };

    session
        .dispatcher()
        .mutate_and_wait(toggle_plan(1), "todo.toggle", toggle_args(1))
        .await
        .unwrap();

    assert_eq!(
        *statuses.lock().unwrap(),
        vec![EntryStatus::Pending, EntryStatus::Stale, EntryStatus::Fresh]
    );
}

#[tokio::test]
async fn test_toggle_twice_last_applied_wins_until_refetch() {
    init_test_tracing();
    let item = TodoItem::new(7, "x");
    let remote = Arc::new(todo_server(&[item.clone()]));
    let coordinator = ReconciliationCoordinator::new(
        Arc::new(tentative_cache::CacheStore::new()),
        Arc::clone(&remote),
        ReconcileConfig::default(),
    );
    let store = coordinator.store();
    store.write(todo_key(7), item.clone(), 1).unwrap();

    let mut a = coordinator.on_mutation_start(toggle_plan(7)).unwrap();
    let mut b = coordinator.on_mutation_start(toggle_plan(7)).unwrap();
    assert!(!store.value(&todo_key(7)).unwrap().unwrap().done);

    coordinator.on_mutation_error(&mut a).unwrap();
    assert!(!store.value(&todo_key(7)).unwrap().unwrap().done);

    coordinator.on_mutation_error(&mut b).unwrap();
    // B snapshotted A's optimistic value.
    let entry = store.read(&todo_key(7)).unwrap().unwrap();
    assert!(entry.value.as_ref().unwrap().done);
    assert_eq!(entry.version, 2);

    let first = coordinator
        .on_mutation_settled(a, MutationOutcome::Failed)
        .unwrap();
    assert!(first.is_empty(), "B still in flight, no refetch yet");

    let second = coordinator
        .on_mutation_settled(b, MutationOutcome::Failed)
        .unwrap();
    let outcomes = second.wait().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].1.is_refreshed());

    assert_entry(store, &todo_key(7), &item, 3, EntryStatus::Fresh);
}

#[tokio::test]
async fn test_absent_key_rollback_removes_entry() {
    let session = session(&[]);
    session
        .coordinator()
        .remote()
        .fail_next("todo.create", RemoteFailureKind::Unavailable);

    let tombstones = Arc::new(Mutex::new(0));
    let _sub = {
        let tombstones = Arc::clone(&tombstones);
        session
            .store()
            .subscribe(todo_key(9), move |e: &CacheEntry<TodoItem>| {
                if e.is_tombstone() {
                    *tombstones.lock().unwrap() += 1;
                }
            })
            .unwrap()
    };

    let plan = MutationPlan::new().optimistic(todo_key(9), |current: Option<&TodoItem>| {
        assert!(current.is_none());
        Ok::<_, String>(TodoItem::new(9, "new"))
    });
    let result = session
        .dispatcher()
        .mutate_and_wait(plan, "todo.create", toggle_args(9))
        .await;

    assert_remote_failure(&result, RemoteFailureKind::Unavailable);
    assert_absent(session.store(), &todo_key(9));
    assert_eq!(*tombstones.lock().unwrap(), 1);
    assert_eq!(session.coordinator().remote().fetch_count(&todo_key(9)), 0);
}

#[tokio::test]
async fn test_abandoned_caller_still_reconciles() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item.clone(), 1).unwrap();
    let remote = Arc::clone(session.coordinator().remote());
    let gate = remote.defer("todo.toggle");

    let caller = {
        let dispatcher = session.dispatcher().clone();
        tokio::spawn(async move {
            dispatcher
                .mutate(toggle_plan(1), "todo.toggle", toggle_args(1))
                .await
        })
    };
    eventually(|| remote.invocation_count("todo.toggle") == 1).await;
    assert_status(session.store(), &todo_key(1), EntryStatus::Pending);

    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    gate.fail(tentative_core::RemoteFailure::rejected("todo.toggle", "conflict"));

    let metrics = Arc::clone(session.coordinator().metrics());
    eventually(|| {
        let snapshot = metrics.snapshot();
        snapshot.settled_failed == 1 && snapshot.refetches_ok == 1
    })
    .await;
    assert_entry(session.store(), &todo_key(1), &item, 2, EntryStatus::Fresh);
}

#[tokio::test]
async fn test_refetch_waits_for_in_flight_mutation() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    let store = session.store();
    store.write(todo_key(1), item, 1).unwrap();
    let coordinator = session.coordinator();

    let context = coordinator.on_mutation_start(toggle_plan(1)).unwrap();
    let outcome = coordinator.refetcher().refetch(&todo_key(1)).await.unwrap();
    assert_eq!(outcome, RefetchOutcome::SkippedInFlight);
    assert_status(store, &todo_key(1), EntryStatus::Pending);

    coordinator
        .on_mutation_settled(context, MutationOutcome::Succeeded)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_status(store, &todo_key(1), EntryStatus::Fresh);
}

#[tokio::test]
async fn test_refetch_discarded_when_mutation_begins_mid_fetch() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item, 1).unwrap();
    let coordinator = Arc::clone(session.coordinator());
    let gate = coordinator.remote().defer_fetch(&todo_key(1));

    let refetch = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.refetcher().refetch(&todo_key(1)).await })
    };
    {
        let remote = Arc::clone(coordinator.remote());
        eventually(move || remote.fetch_count(&todo_key(1)) == 1).await;
    }

    let context = coordinator.on_mutation_start(toggle_plan(1)).unwrap();
    gate.release();

    let outcome = refetch.await.unwrap().unwrap();
    assert_eq!(outcome, RefetchOutcome::DiscardedInFlight);
    let entry = session.store().read(&todo_key(1)).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.value.unwrap().done);

    coordinator
        .on_mutation_settled(context, MutationOutcome::Succeeded)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_status(session.store(), &todo_key(1), EntryStatus::Fresh);
}

#[tokio::test]
async fn test_fetch_read_before_mutation_cannot_overwrite_its_refetch() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session
        .store()
        .write_with_status(todo_key(1), item.clone(), 1, EntryStatus::Stale)
        .unwrap();
    let coordinator = Arc::clone(session.coordinator());
    let remote = Arc::clone(coordinator.remote());
    // The sweep reads the server before the toggle; its reply is held back.
    let gate = remote.defer_fetch(&todo_key(1));

    let sweep = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.refetcher().refetch_stale().await })
    };
    {
        let remote = Arc::clone(&remote);
        eventually(move || remote.fetch_count(&todo_key(1)) == 1).await;
    }

    session
        .dispatcher()
        .mutate_and_wait(toggle_plan(1), "todo.toggle", toggle_args(1))
        .await
        .unwrap();
    let server = remote.server_value(&todo_key(1)).unwrap();
    assert!(server.done);
    assert_entry(session.store(), &todo_key(1), &server, 3, EntryStatus::Fresh);

    gate.release();
    let outcomes = sweep.await.unwrap().unwrap();
    assert_eq!(outcomes, vec![(todo_key(1), RefetchOutcome::DiscardedInFlight)]);
    assert_entry(session.store(), &todo_key(1), &server, 3, EntryStatus::Fresh);
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_strand_rollback() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item.clone(), 1).unwrap();
    session
        .coordinator()
        .remote()
        .fail_next("todo.toggle", RemoteFailureKind::Rejected);

    let tripped = Arc::new(AtomicBool::new(false));
    let _sub = {
        let tripped = Arc::clone(&tripped);
        session
            .store()
            .subscribe(todo_key(1), move |e: &CacheEntry<TodoItem>| {
                if e.status.is_fresh() && !tripped.swap(true, Ordering::SeqCst) {
                    panic!("subscriber failed on rollback");
                }
            })
            .unwrap()
    };

    let result = session
        .dispatcher()
        .mutate_and_wait(toggle_plan(1), "todo.toggle", toggle_args(1))
        .await;

    assert!(tripped.load(Ordering::SeqCst));
    assert_remote_failure(&result, RemoteFailureKind::Rejected);
    assert!(session.coordinator().pending().is_empty().unwrap());
    assert_entry(session.store(), &todo_key(1), &item, 2, EntryStatus::Fresh);

    let later = session
        .coordinator()
        .refetcher()
        .refetch(&todo_key(1))
        .await
        .unwrap();
    assert_eq!(later, RefetchOutcome::Refreshed { version: 3 });
}

#[tokio::test]
async fn test_failed_refetch_leaves_entry_stale() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item, 1).unwrap();
    session
        .coordinator()
        .remote()
        .set_fetch_failure(Some(RemoteFailureKind::Unavailable));

    session
        .dispatcher()
        .mutate_and_wait(toggle_plan(1), "todo.toggle", toggle_args(1))
        .await
        .unwrap();

    assert_status(session.store(), &todo_key(1), EntryStatus::Stale);
    assert_eq!(session.coordinator().metrics().snapshot().refetches_failed, 1);
}

#[tokio::test]
async fn test_sweep_refreshes_stale_entries() {
    let item = TodoItem::new(1, "a");
    let mut session = session(&[item.clone()]);
    session
        .store()
        .write_with_status(todo_key(1), item.toggled(), 4, EntryStatus::Stale)
        .unwrap();

    session.start_sweep();
    let store = Arc::clone(session.store());
    eventually(|| {
        store
            .read(&todo_key(1))
            .unwrap()
            .is_some_and(|e| e.status.is_fresh())
    })
    .await;
    assert_entry(&store, &todo_key(1), &item, 5, EntryStatus::Fresh);

    session.shutdown().await.unwrap();
    assert!(store.is_empty().unwrap());
}

#[tokio::test]
async fn test_unserializable_args_touch_nothing() {
    let item = TodoItem::new(1, "a");
    let session = session(&[item.clone()]);
    session.store().write(todo_key(1), item.clone(), 1).unwrap();

    let mut args = BTreeMap::new();
    args.insert(vec![1u8], 1u8);
    let err = session
        .dispatcher()
        .mutate_with(toggle_plan(1), "todo.toggle", &args)
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::InvalidArgs { .. }));
    assert_entry(session.store(), &todo_key(1), &item, 1, EntryStatus::Fresh);
    assert!(session.coordinator().remote().invocations().is_empty());
}
