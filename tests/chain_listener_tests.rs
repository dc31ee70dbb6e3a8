mod common;

use rust_decimal_macros::dec;
use std::time::Duration;

use common::{ALICE, BOB, CAROL, ConnectScript, MemoryStore, ScriptedTransport, eventually, transfer};
use transfer_analytics::services::chain_listener::{
    ChainListener, ListenerError, ListenerState, ReconnectPolicy,
};

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_initial_connection_failure_is_fatal() {
    let store = MemoryStore::new();

    let transport = ScriptedTransport::new();
    transport.push(ConnectScript::Refuse);
    let result = ChainListener::new(transport.clone(), store.clone(), 6, fast_policy())
        .start()
        .await;
    assert!(matches!(result, Err(ListenerError::Connect(_))));
    assert_eq!(transport.connects(), 1);

    let transport = ScriptedTransport::new();
    transport.push(ConnectScript::Deaf);
    let result = ChainListener::new(transport, store, 6, fast_policy())
        .start()
        .await;
    assert!(matches!(result, Err(ListenerError::NotListening)));
}

#[tokio::test]
async fn test_events_are_written_in_token_units() {
    let store = MemoryStore::new();
    let transport = ScriptedTransport::new();
    let events = transport.push_stream();

    let listener = ChainListener::new(transport, store.clone(), 6, fast_policy());
    assert_eq!(listener.state(), ListenerState::Disconnected);
    let handle = listener.start().await.unwrap();
    assert_eq!(handle.state(), ListenerState::Subscribed);

    events.send(Ok(transfer(1, ALICE, BOB, 12_500_000))).unwrap();

    assert!(eventually(|| store.records().len() == 1).await);
    let record = &store.records()[0];
    assert_eq!(record.from_address, ALICE);
    assert_eq!(record.to_address, BOB);
    assert_eq!(record.amount, dec!(12.5));
    assert_eq!(record.block_number, 1);

    handle.abort();
}

#[tokio::test]
async fn test_reconnects_after_drop_and_keeps_writing() {
    let store = MemoryStore::new();
    let transport = ScriptedTransport::new();
    let first = transport.push_stream();
    transport.push(ConnectScript::Refuse);
    let second = transport.push_stream();

    let handle = ChainListener::new(transport.clone(), store.clone(), 6, fast_policy())
        .start()
        .await
        .unwrap();

    first.send(Ok(transfer(1, ALICE, BOB, 1_000_000))).unwrap();
    assert!(eventually(|| store.records().len() == 1).await);

    drop(first);
    second.send(Ok(transfer(2, BOB, CAROL, 2_000_000))).unwrap();

    assert!(eventually(|| store.records().len() == 2).await);
    assert_eq!(transport.connects(), 3);
    assert_eq!(store.records()[1].amount, dec!(2));
    assert!(eventually(|| handle.state() == ListenerState::Subscribed).await);
    assert!(!handle.is_finished());

    handle.abort();
}

#[tokio::test]
async fn test_stream_error_triggers_reconnect() {
    let store = MemoryStore::new();
    let transport = ScriptedTransport::new();
    let first = transport.push_stream();
    let second = transport.push_stream();

    let handle = ChainListener::new(transport.clone(), store.clone(), 6, fast_policy())
        .start()
        .await
        .unwrap();

    first
        .send(Err(ListenerError::Transport("socket closed".to_string())))
        .unwrap();
    second.send(Ok(transfer(3, CAROL, ALICE, 5))).unwrap();

    assert!(eventually(|| store.records().len() == 1).await);
    assert_eq!(transport.connects(), 2);

    handle.abort();
}

#[tokio::test]
async fn test_write_failure_drops_event_without_stalling() {
    let store = MemoryStore::new();
    let transport = ScriptedTransport::new();
    let events = transport.push_stream();

    let handle = ChainListener::new(transport.clone(), store.clone(), 6, fast_policy())
        .start()
        .await
        .unwrap();

    store.set_failing(true);
    events.send(Ok(transfer(1, ALICE, BOB, 1_000_000))).unwrap();
    assert!(eventually(|| store.calls() == 1).await);

    store.set_failing(false);
    events.send(Ok(transfer(2, BOB, ALICE, 3_000_000))).unwrap();
    assert!(eventually(|| store.records().len() == 1).await);

    let records = store.records();
    assert_eq!(records[0].tx_hash, transfer(2, BOB, ALICE, 0).transaction_hash);
    assert_eq!(handle.state(), ListenerState::Subscribed);
    assert_eq!(transport.connects(), 1);

    handle.abort();
}

#[tokio::test]
async fn test_undecodable_log_is_skipped() {
    let store = MemoryStore::new();
    let transport = ScriptedTransport::new();
    let events = transport.push_stream();

    let handle = ChainListener::new(transport.clone(), store.clone(), 6, fast_policy())
        .start()
        .await
        .unwrap();

    events
        .send(Err(ListenerError::Decode("truncated data".to_string())))
        .unwrap();
    events.send(Ok(transfer(1, ALICE, BOB, 1))).unwrap();

    assert!(eventually(|| store.records().len() == 1).await);
    assert_eq!(store.records()[0].amount, dec!(0.000001));
    assert_eq!(transport.connects(), 1);

    handle.abort();
}
