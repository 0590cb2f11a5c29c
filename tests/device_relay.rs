//! Integration tests for the device relay: accept path, replacement,
//! keep-alive termination, publication stamping, and reconciliation.

mod common;

use std::collections::HashSet;

use brewlink::relay::{CLOSE_ADMIN, CLOSE_AUTH, CLOSE_BAD_REQUEST, CLOSE_REPLACED};
use brewlink::CredentialStore;
use common::{new_relay, next_close, seeded_store, DEVICE, DEVICE_KEY};
use serde_json::json;

// ---------------------------------------------------------------------------
// Accept path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_params_rejected_with_4001() {
    let relay = new_relay(seeded_store().await);

    let err = relay.connect(None, Some(DEVICE_KEY.into())).await.err().unwrap();
    assert_eq!(err.0, CLOSE_BAD_REQUEST);

    let err = relay.connect(Some(DEVICE.into()), None).await.err().unwrap();
    assert_eq!(err.0, CLOSE_BAD_REQUEST);
}

#[tokio::test]
async fn malformed_device_id_rejected_with_4001() {
    let relay = new_relay(seeded_store().await);
    for bad in ["BRW-123", "ESP-01ABCDEF", "BRW-01ABCDEZ", "BRW-01ABCDEF0"] {
        let err = relay
            .connect(Some(bad.into()), Some(DEVICE_KEY.into()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, CLOSE_BAD_REQUEST, "id {bad:?} should be rejected");
    }
}

#[tokio::test]
async fn bad_key_rejected_with_4003() {
    let relay = new_relay(seeded_store().await);

    // Wrong key of valid length
    let err = relay
        .connect(
            Some(DEVICE.into()),
            Some("ffffffffffffffffffffffffffffffff".into()),
        )
        .await
        .err()
        .unwrap();
    assert_eq!(err.0, CLOSE_AUTH);

    // Key too short is rejected before the store is even consulted
    let err = relay
        .connect(Some(DEVICE.into()), Some("short".into()))
        .await
        .err()
        .unwrap();
    assert_eq!(err.0, CLOSE_AUTH);

    assert_eq!(relay.connected_device_count().await, 0);
}

#[tokio::test]
async fn accepted_device_is_greeted_and_marked_online() {
    let store = seeded_store().await;
    let relay = new_relay(store.clone());

    let (session, mut rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    assert_eq!(session.device_id(), DEVICE);
    assert_eq!(relay.connected_device_count().await, 1);
    assert!(relay.is_device_connected(DEVICE).await);
    assert!(store.is_flagged_online(DEVICE).await);

    // Greeting: connected, then request_state.
    let first = common::next_frame(&mut rx).await;
    assert_eq!(first["type"], "connected");
    assert!(first["timestamp"].is_i64());
    let second = common::next_frame(&mut rx).await;
    assert_eq!(second["type"], "request_state");
}

#[tokio::test]
async fn device_id_is_case_insensitive() {
    let relay = new_relay(seeded_store().await);

    let (session, _rx) = relay
        .connect(Some("brw-01abcdef".into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    assert_eq!(session.device_id(), DEVICE);
    assert!(relay.is_device_connected(DEVICE).await);
}

// ---------------------------------------------------------------------------
// Replacement (scenario: second connect for the same id)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_connect_replaces_first_with_4002() {
    let relay = new_relay(seeded_store().await);

    let (first, mut first_rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    let mut events = relay.subscribe();
    let (_second, _second_rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    let (code, reason) = next_close(&mut first_rx).await;
    assert_eq!(code, CLOSE_REPLACED);
    assert_eq!(reason, "Replaced by new connection");
    assert_eq!(relay.connected_device_count().await, 1);

    // The replaced session's lifecycle closes out before the successor's
    // opens: device_offline for the old connection, then device_online.
    let event = events.recv().await.unwrap();
    assert_eq!(event["type"], "device_offline");
    assert_eq!(event["deviceId"], DEVICE);
    let event = events.recv().await.unwrap();
    assert_eq!(event["type"], "device_online");

    // The replaced socket's late teardown must not evict the successor, and
    // must not publish a second device_offline.
    first.finish().await;
    assert_eq!(relay.connected_device_count().await, 1);
    assert!(relay.is_device_connected(DEVICE).await);
    assert!(
        tokio::time::timeout(std::time::Duration::from_millis(100), events.recv())
            .await
            .is_err(),
        "replaced session teardown should publish nothing"
    );
}

// ---------------------------------------------------------------------------
// Publication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingested_messages_are_stamped_and_published() {
    let relay = new_relay(seeded_store().await);
    let (session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    let mut events = relay.subscribe();
    session.ingest_text(r#"{"type":"status","boiler_temp":93}"#);

    let event = events.recv().await.unwrap();
    assert_eq!(event["type"], "status");
    assert_eq!(event["deviceId"], DEVICE);
    assert_eq!(event["boiler_temp"], 93);
    assert!(event["timestamp"].is_i64());
}

#[tokio::test]
async fn device_supplied_timestamp_is_preserved() {
    let relay = new_relay(seeded_store().await);
    let (session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    let mut events = relay.subscribe();
    session.ingest_text(r#"{"type":"status","timestamp":12345}"#);
    assert_eq!(events.recv().await.unwrap()["timestamp"], 12345);
}

#[tokio::test]
async fn multi_message_binary_frame_publishes_in_order() {
    let relay = new_relay(seeded_store().await);
    let (session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    let mut frame = Vec::new();
    for temp in [90, 91, 92] {
        let value = rmpv::Value::Map(vec![
            (
                rmpv::Value::String("type".into()),
                rmpv::Value::String("status".into()),
            ),
            (
                rmpv::Value::String("boiler_temp".into()),
                rmpv::Value::Integer(temp.into()),
            ),
        ]);
        rmpv::encode::write_value(&mut frame, &value).unwrap();
    }

    let mut events = relay.subscribe();
    session.ingest_binary(&frame);

    for expected in [90, 91, 92] {
        let event = events.recv().await.unwrap();
        assert_eq!(event["boiler_temp"], expected);
        assert_eq!(event["deviceId"], DEVICE);
    }
}

#[tokio::test]
async fn undecodable_frame_keeps_connection_open() {
    let relay = new_relay(seeded_store().await);
    let (session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    session.ingest_binary(&[0xc1, 0xc1]);
    session.ingest_text("not json");

    assert!(relay.is_device_connected(DEVICE).await);
    assert!(relay.send_to_device(DEVICE, json!({"type": "request_state"})).await);
}

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_to_device_reports_registration() {
    let relay = new_relay(seeded_store().await);
    assert!(!relay.send_to_device(DEVICE, json!({"type": "request_state"})).await);

    let (_session, mut rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();
    assert!(relay.send_to_device(DEVICE, json!({"type": "request_state"})).await);

    // Greeting frames, then ours.
    common::next_frame(&mut rx).await;
    common::next_frame(&mut rx).await;
    assert_eq!(common::next_frame(&mut rx).await["type"], "request_state");
}

// ---------------------------------------------------------------------------
// Close path and keep-alive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finish_deregisters_and_publishes_offline() {
    let store = seeded_store().await;
    let relay = new_relay(store.clone());
    let (session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    let mut events = relay.subscribe();
    session.finish().await;

    assert_eq!(relay.connected_device_count().await, 0);
    assert!(!store.is_flagged_online(DEVICE).await);
    let event = events.recv().await.unwrap();
    assert_eq!(event["type"], "device_offline");
    assert_eq!(event["deviceId"], DEVICE);
}

#[tokio::test]
async fn third_silent_sweep_terminates_device() {
    let store = seeded_store().await;
    let relay = new_relay(store.clone());
    let (_session, mut rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    relay.ping_sweep().await;
    relay.ping_sweep().await;
    assert_eq!(relay.connected_device_count().await, 1);

    relay.ping_sweep().await;
    assert_eq!(relay.connected_device_count().await, 0);
    assert!(!store.is_flagged_online(DEVICE).await);

    let (_, reason) = next_close(&mut rx).await;
    assert_eq!(reason, "Ping timeout");
}

#[tokio::test]
async fn any_frame_resets_the_miss_counter() {
    let relay = new_relay(seeded_store().await);
    let (session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    relay.ping_sweep().await;
    relay.ping_sweep().await;
    session.touch(); // pong or any message
    relay.ping_sweep().await;
    relay.ping_sweep().await;

    assert_eq!(relay.connected_device_count().await, 1);
}

#[tokio::test]
async fn admin_disconnect_closes_with_4000() {
    let relay = new_relay(seeded_store().await);
    let (_session, mut rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    assert!(relay.disconnect_device(DEVICE).await);
    assert!(!relay.disconnect_device(DEVICE).await);

    let (code, reason) = next_close(&mut rx).await;
    assert_eq!(code, CLOSE_ADMIN);
    assert_eq!(reason, "Disconnected by admin");
    assert_eq!(relay.connected_device_count().await, 0);
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_clears_orphaned_online_flags() {
    let store = seeded_store().await;
    store.insert_device_key("BRW-02ABCDEF", DEVICE_KEY).await;
    let relay = new_relay(store.clone());

    // BRW-02 was flagged online by a previous process that crashed.
    store.update_device_status("BRW-02ABCDEF", true).await.unwrap();
    let (_session, _rx) = relay
        .connect(Some(DEVICE.into()), Some(DEVICE_KEY.into()))
        .await
        .unwrap();

    relay.reconcile().await;

    assert!(store.is_flagged_online(DEVICE).await);
    assert!(!store.is_flagged_online("BRW-02ABCDEF").await);

    let connected: HashSet<String> = relay.connected_devices().await.into_iter().collect();
    assert_eq!(connected.len(), 1);
    assert!(connected.contains(DEVICE));
}
