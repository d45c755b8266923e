//! Session lifecycle tests against the mock connector and in-memory store.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{
    CloseReason, InboundMessage, KeyMap, Material, MessageContent, MessageId, ProtocolEvent,
    SessionId, SessionStatus,
};
use bridge_engine::{
    restore_sessions, MockConnector, RecordingRelay, RestoreReport, SessionConfig, SessionDeps,
    SessionError, SessionRegistry, StatusEvent,
};
use bridge_store::{CredentialStore, MemoryCredentialStore};
use tokio_util::sync::CancellationToken;

const PHONE: &str = "919876543210";
const ME: &str = "919876543210:7@s.whatsapp.net";

struct Harness {
    registry: Arc<SessionRegistry>,
    connector: Arc<MockConnector>,
    store: Arc<MemoryCredentialStore>,
    relay: Arc<RecordingRelay>,
}

fn harness_with(connector: MockConnector) -> Harness {
    let connector = Arc::new(connector);
    let store = Arc::new(MemoryCredentialStore::new());
    let relay = Arc::new(RecordingRelay::new());
    let registry = Arc::new(SessionRegistry::new(SessionDeps {
        connector: connector.clone(),
        store: store.clone(),
        relay: relay.clone(),
        config: SessionConfig::default(),
    }));
    Harness {
        registry,
        connector,
        store,
        relay,
    }
}

fn harness() -> Harness {
    harness_with(MockConnector::new())
}

fn sid(s: &str) -> SessionId {
    SessionId::from_raw(s)
}

fn paired_credentials() -> Material {
    Material::map([
        ("me", Material::map([("id", Material::from(ME))])),
        ("noiseKey", Material::binary(vec![9u8; 32])),
    ])
}

fn key_update(key: &str, byte: u8) -> ProtocolEvent {
    let mut set = KeyMap::new();
    set.insert(key.to_string(), Material::binary(vec![byte]));
    ProtocolEvent::KeysUpdated {
        set,
        delete: vec![],
    }
}

/// Poll until `cond` holds, advancing (paused) time in small steps.
async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_status(h: &Harness, id: &SessionId, status: SessionStatus) {
    wait_for(&format!("{id} to reach {status}"), || {
        h.registry.status(id).status == status
    })
    .await;
}

/// Pair `id` through the challenge and open it.
async fn connect(h: &Harness, id: &SessionId) {
    h.registry.start(id).await.unwrap();
    wait_status(h, id, SessionStatus::Qr).await;
    h.connector
        .emit(id, ProtocolEvent::CredentialsUpdated { credentials: paired_credentials() })
        .await;
    h.connector
        .emit(id, ProtocolEvent::Open { me: ME.into(), push_name: Some("Asha".into()) })
        .await;
    wait_status(h, id, SessionStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn fresh_start_pairs_connects_and_stops_on_terminal_close() {
    let h = harness();
    let id = sid("u1");

    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;
    let qr = h.registry.status(&id).qr.unwrap();
    assert!(qr.starts_with("data:image/svg+xml;base64,"));
    assert!(qr.len() > "data:image/svg+xml;base64,".len());

    h.connector
        .emit(&id, ProtocolEvent::Open { me: ME.into(), push_name: None })
        .await;
    wait_status(&h, &id, SessionStatus::Connected).await;
    let snap = h.registry.status(&id);
    assert!(snap.connected);
    assert_eq!(snap.phone_number.as_deref(), Some(PHONE));
    assert!(snap.qr.is_none());

    h.connector
        .emit(&id, ProtocolEvent::Closed { reason: CloseReason::LoggedOut })
        .await;
    wait_status(&h, &id, SessionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snap = h.registry.status(&id);
    assert_eq!(snap.status, SessionStatus::Disconnected);
    assert_eq!(snap.phone_number, None);
    assert_eq!(h.connector.connects_for(&id), 1);
    assert_eq!(h.connector.live_connections(&id), 0);

    let statuses = h.relay.statuses();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].event, StatusEvent::Connected);
    assert_eq!(statuses[0].phone_number.as_deref(), Some(PHONE));
    assert_eq!(statuses[1].event, StatusEvent::Disconnected);
    assert_eq!(statuses[1].reason.as_deref(), Some("logged_out"));
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_while_connected() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;

    let snap = h.registry.start(&id).await.unwrap();
    assert_eq!(snap.status, SessionStatus::Connected);
    assert_eq!(snap.phone_number.as_deref(), Some(PHONE));
    assert_eq!(h.connector.connects_for(&id), 1);
}

#[tokio::test(start_paused = true)]
async fn start_in_qr_returns_cached_image() {
    let h = harness();
    let id = sid("u1");
    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;
    let first = h.registry.status(&id).qr;

    let snap = h.registry.start(&id).await.unwrap();
    assert_eq!(snap.status, SessionStatus::Qr);
    assert_eq!(snap.qr, first);
    assert_eq!(h.connector.connects_for(&id), 1);
}

#[tokio::test(start_paused = true)]
async fn new_challenge_replaces_image() {
    let h = harness();
    let id = sid("u1");
    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;
    let first = h.registry.status(&id).qr;

    h.connector
        .emit(&id, ProtocolEvent::PairingChallenge { code: "2@second".into() })
        .await;
    wait_for("replaced qr", || h.registry.status(&id).qr != first).await;
    assert_eq!(h.registry.status(&id).status, SessionStatus::Qr);
}

#[tokio::test(start_paused = true)]
async fn scan_moves_qr_back_to_connecting() {
    let h = harness();
    let id = sid("u1");
    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;

    h.connector.emit(&id, ProtocolEvent::Paired).await;
    wait_status(&h, &id, SessionStatus::Connecting).await;
    assert!(h.registry.status(&id).qr.is_none());
}

#[tokio::test(start_paused = true)]
async fn restart_terminates_previous_connection() {
    let h = harness_with(MockConnector::manual());
    let id = sid("u1");

    h.registry.start(&id).await.unwrap();
    h.registry.start(&id).await.unwrap();
    h.registry.start(&id).await.unwrap();

    assert_eq!(h.connector.connects_for(&id), 3);
    assert_eq!(h.connector.live_connections(&id), 1);
    assert_eq!(h.registry.status(&id).status, SessionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn retryable_close_reconnects_once_after_delay() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;

    h.connector
        .emit(&id, ProtocolEvent::Closed { reason: CloseReason::ConnectionLost })
        .await;
    wait_status(&h, &id, SessionStatus::Reconnecting).await;
    assert_eq!(h.connector.live_connections(&id), 0);

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert_eq!(h.connector.connects_for(&id), 1);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    wait_status(&h, &id, SessionStatus::Connected).await;
    assert_eq!(h.connector.connects_for(&id), 2);

    // The reconnect is seeded with the in-memory credentials.
    let seeded = h.connector.latest_auth(&id).unwrap();
    assert!(seeded.has_credentials());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.connects_for(&id), 2);
    assert_eq!(h.connector.live_connections(&id), 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_close_from_qr_does_not_retry() {
    let h = harness();
    let id = sid("u1");
    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;

    h.connector
        .emit(&id, ProtocolEvent::Closed { reason: CloseReason::Forbidden })
        .await;
    wait_status(&h, &id, SessionStatus::Disconnected).await;
    assert!(h.registry.status(&id).qr.is_none());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.connector.connects_for(&id), 1);
}

#[tokio::test(start_paused = true)]
async fn ended_event_stream_counts_as_connection_lost() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;

    h.connector.hang_up(&id);
    wait_status(&h, &id, SessionStatus::Reconnecting).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.connector.connects_for(&id), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_keeps_retrying() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;

    h.connector.fail_next_connects(1);
    h.connector
        .emit(&id, ProtocolEvent::Closed { reason: CloseReason::RestartRequired })
        .await;
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(h.registry.status(&id).status, SessionStatus::Reconnecting);
    assert_eq!(h.connector.connects_for(&id), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    wait_status(&h, &id, SessionStatus::Connected).await;
    assert_eq!(h.connector.connects_for(&id), 2);
}

#[tokio::test(start_paused = true)]
async fn credentials_save_eagerly_and_keys_batch() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;
    wait_for("eager credential save", || h.store.save_count() == 1).await;

    for i in 0..20u8 {
        h.connector
            .emit(&id, key_update(&format!("pre-key:{i}"), i))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(700)).await;

    let batches = h.store.sync_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].set.len(), 20);
    assert_eq!(h.store.keys(&id).len(), 20);
}

#[tokio::test(start_paused = true)]
async fn logout_unlinks_and_purges() {
    let h = harness();
    let id = sid("u1");
    h.store.insert(&id, paired_credentials(), KeyMap::new());

    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Connected).await;
    let link = h.connector.latest_link(&id).unwrap();
    h.connector.emit(&id, key_update("session:a", 1)).await;

    h.registry.logout(&id).await.unwrap();

    assert!(link.logged_out());
    assert_eq!(h.connector.live_connections(&id), 0);
    assert_eq!(h.registry.status(&id).status, SessionStatus::NotStarted);
    assert!(h.registry.is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let auth = h.store.load(&id).await.unwrap();
    assert!(!auth.has_credentials);
    assert!(auth.keys.is_empty());
}

#[tokio::test(start_paused = true)]
async fn logout_of_unknown_session_still_purges() {
    let h = harness();
    let id = sid("ghost");
    h.store.insert(&id, paired_credentials(), KeyMap::new());

    h.registry.logout(&id).await.unwrap();
    assert!(!h.store.contains(&id));
    assert_eq!(h.store.purge_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_pairs_fresh() {
    let h = harness();
    let id = sid("u1");
    h.store.insert(&id, paired_credentials(), KeyMap::new());
    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Connected).await;

    h.registry.reset(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;

    assert!(h.registry.status(&id).qr.is_some());
    assert_eq!(h.connector.connects_for(&id), 2);
    assert_eq!(h.connector.live_connections(&id), 1);
    assert!(!h.connector.latest_auth(&id).unwrap().has_credentials());
    assert!(!h.store.load(&id).await.unwrap().has_credentials);
}

#[tokio::test(start_paused = true)]
async fn disconnect_flushes_and_keeps_credentials() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;

    h.connector.emit(&id, key_update("pre-key:1", 1)).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    h.registry.disconnect(&id).await.unwrap();

    assert_eq!(h.connector.live_connections(&id), 0);
    assert_eq!(h.registry.status(&id).status, SessionStatus::NotStarted);
    assert!(h.store.keys(&id).contains_key("pre-key:1"));
    assert!(h.store.load(&id).await.unwrap().has_credentials);

    // A later start resumes from the stored credentials without pairing.
    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn send_requires_connected_session() {
    let h = harness();
    let id = sid("u1");

    let err = h.registry.send(&id, PHONE, "hi").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected { status: SessionStatus::NotStarted, .. }));

    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;
    let err = h.registry.send(&id, PHONE, "hi").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected { status: SessionStatus::Qr, .. }));

    h.connector
        .emit(&id, ProtocolEvent::Open { me: ME.into(), push_name: None })
        .await;
    wait_status(&h, &id, SessionStatus::Connected).await;

    let message_id = h.registry.send(&id, "+91 98765 43210", "hello").await.unwrap();
    assert!(!message_id.as_str().is_empty());
    h.registry
        .send(&id, "120363@g.us", "group hello")
        .await
        .unwrap();
    let sent = h.connector.latest_link(&id).unwrap().sent();
    assert_eq!(
        sent,
        vec![
            ("919876543210@s.whatsapp.net".to_string(), "hello".to_string()),
            ("120363@g.us".to_string(), "group hello".to_string()),
        ]
    );

    let err = h.registry.send(&id, PHONE, "   ").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidRequest(_)));
    let err = h.registry.send(&id, "", "hi").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidRequest(_)));
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_are_relayed() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;
    h.relay.set_failing(true);

    for (n, jid, from_me) in [
        (1, "918888888888@s.whatsapp.net", false),
        (2, "918888888888@s.whatsapp.net", true),
        (3, "120363@g.us", false),
        (4, "917777777777:3@s.whatsapp.net", false),
    ] {
        h.connector
            .emit(
                &id,
                ProtocolEvent::Message(InboundMessage {
                    id: MessageId::from_raw(format!("M{n}")),
                    remote_jid: jid.into(),
                    from_me,
                    push_name: None,
                    timestamp: 1_700_000_000 + n,
                    content: MessageContent::text(format!("text {n}")),
                }),
            )
            .await;
    }
    wait_for("two relayed messages", || h.relay.messages().len() == 2).await;

    let messages = h.relay.messages();
    assert_eq!(messages[0].from, "918888888888");
    assert_eq!(messages[0].message, "text 1");
    assert_eq!(messages[1].from, "917777777777");
    assert_eq!(messages[1].from_name, "917777777777");
    // Relay failures never disturb the session.
    assert_eq!(h.registry.status(&id).status, SessionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn list_all_is_sorted() {
    let h = harness_with(MockConnector::manual());
    for id in ["c", "a", "b"] {
        h.registry.start(&sid(id)).await.unwrap();
    }
    let ids: Vec<_> = h
        .registry
        .list_all()
        .into_iter()
        .map(|s| s.id.to_string())
        .collect();
    assert_eq!(ids, ["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn slow_credential_load_starts_fresh() {
    let h = harness();
    let id = sid("u1");
    h.store.insert(&id, paired_credentials(), KeyMap::new());
    h.store.set_load_delay(Some(Duration::from_secs(60)));

    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;
    assert!(!h.connector.latest_auth(&id).unwrap().has_credentials());
}

#[tokio::test(start_paused = true)]
async fn failed_credential_load_fails_start() {
    let h = harness();
    let id = sid("u1");
    h.store.fail_next_loads(1);

    let err = h.registry.start(&id).await.unwrap_err();
    assert!(matches!(err, SessionError::Store(_)));
    assert_eq!(h.connector.connects_for(&id), 0);

    h.registry.start(&id).await.unwrap();
    wait_status(&h, &id, SessionStatus::Qr).await;
}

#[tokio::test(start_paused = true)]
async fn restore_resumes_stored_sessions_with_spacing() {
    let h = harness();
    for id in ["a", "b", "c"] {
        h.store.insert(&sid(id), paired_credentials(), KeyMap::new());
    }
    h.connector.fail_next_connects(1);

    let started = tokio::time::Instant::now();
    let report = restore_sessions(&h.registry, Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert_eq!(
        report,
        RestoreReport {
            restored: 3,
            skipped: 0,
            failed: 0
        }
    );

    wait_status(&h, &sid("b"), SessionStatus::Connected).await;
    wait_status(&h, &sid("c"), SessionStatus::Connected).await;
    assert_eq!(h.registry.status(&sid("a")).status, SessionStatus::Reconnecting);
    assert_eq!(h.connector.connect_count(), 2);

    // "a" failed at t=0 and retries once the reconnect delay has passed.
    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_status(&h, &sid("a"), SessionStatus::Connected).await;
    assert_eq!(h.connector.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn start_retries_when_connection_cannot_open() {
    let h = harness();
    let id = sid("u1");
    h.connector.fail_next_connects(1);

    let snap = h.registry.start(&id).await.unwrap();
    assert_eq!(snap.status, SessionStatus::Reconnecting);
    assert!(!snap.connected);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(h.connector.connects_for(&id), 0);
    assert_eq!(h.registry.status(&id).status, SessionStatus::Reconnecting);

    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_status(&h, &id, SessionStatus::Qr).await;
    assert_eq!(h.connector.connects_for(&id), 1);
    assert!(h.relay.statuses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restore_start_skips_sessions_without_credentials() {
    let h = harness();
    let err = h.registry.start_restore(&sid("fresh")).await.unwrap_err();
    assert!(matches!(err, SessionError::NoCredentials(_)));
    assert!(h.registry.is_empty());
    assert_eq!(h.connector.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_restore_stops_early() {
    let h = harness();
    for id in ["a", "b", "c"] {
        h.store.insert(&sid(id), paired_credentials(), KeyMap::new());
    }
    let cancel = CancellationToken::new();
    let task = {
        let registry = h.registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            restore_sessions(&registry, Duration::from_secs(2), &cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.restored, 1);
    assert_eq!(h.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_without_purging() {
    let h = harness();
    let id = sid("u1");
    connect(&h, &id).await;
    h.connector.emit(&id, key_update("session:x", 5)).await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    h.registry.shutdown().await;

    assert!(h.registry.is_empty());
    assert_eq!(h.connector.live_connections(&id), 0);
    assert!(h.store.keys(&id).contains_key("session:x"));
    assert!(h.store.credentials(&id).is_some());
    assert_eq!(h.store.purge_count(), 0);
}
