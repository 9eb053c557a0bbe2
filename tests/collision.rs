mod common;

use common::*;
use duet_call::peer::Descriptor;
use duet_call::store::record::{answer_update, CALLS_COLLECTION};
use duet_call::store::SessionRecord;
use duet_call::utils::now_millis;
use duet_call::{session_key, CallError, CallEvent, CallState, MemoryStore, Role, SignalingStore};

fn connected_role(ev: &CallEvent) -> Option<Role> {
    match ev {
        CallEvent::StateChanged(CallState::Connected(role)) => Some(*role),
        _ => None,
    }
}

#[tokio::test]
async fn simultaneous_calls_converge_on_one_session() {
    let store = MemoryStore::new();
    let mut alice = endpoint("alice", &store).await;
    let mut bob = endpoint("bob", &store).await;

    let (a, b) = tokio::join!(alice.engine.start_call("bob"), bob.engine.start_call("alice"));
    a.unwrap();
    b.unwrap();

    let a_role = connected_role(
        &alice
            .expect("alice connected", |ev| connected_role(ev).is_some())
            .await,
    );
    let b_role = connected_role(
        &bob.expect("bob connected", |ev| connected_role(ev).is_some())
            .await,
    );
    assert_ne!(a_role, b_role, "exactly one side must be the caller");
    assert_eq!(store.record_count(CALLS_COLLECTION), 1);

    let key = session_key("alice", "bob");
    let record = SessionRecord::from_fields(store.peek(CALLS_COLLECTION, &key).unwrap()).unwrap();
    let caller = if a_role == Some(Role::Caller) { "alice" } else { "bob" };
    assert_eq!(record.caller_id, caller);
    assert!(record.answer.is_some());
}

#[tokio::test]
async fn calling_someone_who_is_ringing_us_answers_their_call() {
    let store = MemoryStore::new();
    let mut alice = endpoint("alice", &store).await;
    let mut bob = endpoint("bob", &store).await;

    alice.engine.start_call("bob").await.unwrap();
    bob.expect_incoming().await;

    bob.engine.start_call("alice").await.unwrap();
    bob.expect_state(CallState::Connected(Role::Callee)).await;
    alice.expect_state(CallState::Connected(Role::Caller)).await;
    assert_eq!(store.record_count(CALLS_COLLECTION), 1);
    // one peer per side: bob never built a caller-side connection
    assert_eq!(bob.peers.created(), 1);
}

#[tokio::test]
async fn live_record_for_the_pair_refuses_a_new_call() {
    let store = MemoryStore::new();
    let key = session_key("alice", "bob");
    let mut record =
        SessionRecord::pending("bob", "alice", Descriptor::offer("v=0\r\ns=live\r\n"), now_millis());
    let mut fields = record.to_fields().unwrap();
    fields.extend(answer_update(&Descriptor::answer("v=0\r\ns=ans\r\n"), "alice").unwrap());
    record = SessionRecord::from_fields(fields.clone()).unwrap();
    assert!(!record.is_ringing());
    store.put_record(CALLS_COLLECTION, &key, fields).await.unwrap();

    let mut alice = endpoint("alice", &store).await;
    let err = alice.engine.start_call("bob").await.unwrap_err();
    assert!(matches!(err, CallError::AlreadyInProgress), "{err}");
    alice.expect_state(CallState::Idle).await;
    // the refusal is reported once, through the returned error
    assert!(alice
        .drain(std::time::Duration::from_millis(100))
        .await
        .iter()
        .all(|ev| !matches!(
            ev,
            CallEvent::CallEnded { .. } | CallEvent::StateChanged(CallState::Ended)
        )));

    // the other session's record is left alone
    assert_eq!(store.record_count(CALLS_COLLECTION), 1);
    assert_eq!(store.delete_calls(CALLS_COLLECTION, &key), 0);
    assert_eq!(alice.media.acquired.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_leftover_record_is_purged_before_calling() {
    let store = MemoryStore::new();
    let key = session_key("alice", "bob");
    let ten_minutes_ago = now_millis() - 10 * 60 * 1000;
    let leftover = SessionRecord::pending(
        "bob",
        "alice",
        Descriptor::offer("v=0\r\ns=old\r\n"),
        ten_minutes_ago,
    );
    store
        .put_record(CALLS_COLLECTION, &key, leftover.to_fields().unwrap())
        .await
        .unwrap();

    let mut alice = endpoint("alice", &store).await;
    // too old to ring
    assert!(alice
        .drain(std::time::Duration::from_millis(100))
        .await
        .iter()
        .all(|ev| !matches!(ev, CallEvent::IncomingCall { .. })));

    alice.engine.start_call("bob").await.unwrap();
    alice.expect_state(CallState::Ringing(Role::Caller)).await;

    let record = SessionRecord::from_fields(store.peek(CALLS_COLLECTION, &key).unwrap()).unwrap();
    assert_eq!(record.caller_id, "alice");
    assert!(record.created_at > ten_minutes_ago);
    assert_eq!(store.delete_calls(CALLS_COLLECTION, &key), 1);
}

#[tokio::test]
async fn ended_leftover_record_is_purged_before_calling() {
    let store = MemoryStore::new();
    let key = session_key("alice", "bob");
    let mut fields = SessionRecord::pending("alice", "bob", Descriptor::offer("v=0\r\n"), now_millis())
        .to_fields()
        .unwrap();
    fields.extend(duet_call::store::record::ended_update(None));
    store.put_record(CALLS_COLLECTION, &key, fields).await.unwrap();

    let mut alice = endpoint("alice", &store).await;
    alice.engine.start_call("bob").await.unwrap();
    alice.expect_state(CallState::Ringing(Role::Caller)).await;
    assert_eq!(store.record_count(CALLS_COLLECTION), 1);
}

#[tokio::test]
async fn invalid_targets_are_rejected() {
    let store = MemoryStore::new();
    let alice = endpoint("alice", &store).await;

    for target in ["", "   ", "alice", "bob_carol"] {
        let err = alice.engine.start_call(target).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidTarget(_)), "{target:?}: {err}");
    }
    assert_eq!(alice.state().await, CallState::Idle);
    assert_eq!(store.record_count(CALLS_COLLECTION), 0);
}

#[tokio::test]
async fn identity_with_key_separator_cannot_start_an_engine() {
    let store = MemoryStore::new();
    let result = duet_call::CallEngine::spawn(
        "alice_bob",
        fast_config(),
        std::sync::Arc::new(store.clone()),
        std::sync::Arc::new(FakePeerFactory::default()),
        std::sync::Arc::new(FakeMedia::new(Grant::Allow)),
    )
    .await;
    assert!(matches!(result, Err(CallError::InvalidTarget(_))));
    assert_eq!(store.listener_count(), 0);
}

#[tokio::test]
async fn second_call_while_busy_is_refused() {
    let store = MemoryStore::new();
    let mut alice = endpoint("alice", &store).await;

    alice.engine.start_call("bob").await.unwrap();
    alice.expect_state(CallState::Ringing(Role::Caller)).await;

    let err = alice.engine.start_call("carol").await.unwrap_err();
    assert!(matches!(err, CallError::Busy));
    assert_eq!(alice.state().await, CallState::Ringing(Role::Caller));
    assert_eq!(store.record_count(CALLS_COLLECTION), 1);
}

#[tokio::test]
async fn incoming_call_is_not_surfaced_while_busy() {
    let store = MemoryStore::new();
    let mut alice = endpoint("alice", &store).await;
    let mut bob = endpoint("bob", &store).await;
    let carol = endpoint("carol", &store).await;
    connect(&mut alice, &mut bob, "bob").await;

    carol.engine.start_call("alice").await.unwrap();
    settle().await;
    assert!(alice
        .drain(std::time::Duration::from_millis(100))
        .await
        .iter()
        .all(|ev| !matches!(ev, CallEvent::IncomingCall { .. })));
    assert_eq!(alice.state().await, CallState::Connected(Role::Caller));

    let err = alice.engine.answer_incoming_call().await.unwrap_err();
    assert!(matches!(err, CallError::Busy));
}

#[tokio::test]
async fn answering_a_vanished_call_goes_back_to_idle() {
    let store = MemoryStore::new();
    let alice = endpoint("alice", &store).await;
    let mut bob = endpoint("bob", &store).await;

    alice.engine.start_call("bob").await.unwrap();
    let (_, key) = bob.expect_incoming().await;

    store.delete_record(CALLS_COLLECTION, &key).await.unwrap();
    let err = bob.engine.answer_incoming_call().await.unwrap_err();
    assert!(matches!(err, CallError::NoIncomingCall));

    bob.expect("cancelled", |ev| {
        matches!(ev, CallEvent::IncomingCallCancelled { from } if from == "alice")
    })
    .await;
    assert_eq!(bob.state().await, CallState::Idle);
    assert_eq!(bob.media.acquired.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(bob.peers.created(), 0);
}
