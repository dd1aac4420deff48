//! Integration tests for the sync core.
//!
//! These tests run the orchestrator and its connection managers against the
//! in-memory transport, exercising backfill, listening, reconnects, shutdown
//! and backpressure across module boundaries. Each module contains its own
//! unit tests for detailed logic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mailsync::domain::{AccountConfig, AccountId, ConfigError, EmailLabel, MessageId, SessionMode, SyncEvent};
use mailsync::providers::email::{MemoryMailbox, MemoryTransport};
use mailsync::services::{
    IndexingSink, KeywordClassifier, ManagerConfig, SinkWorker, SyncError, SyncOrchestrator,
};
use mailsync::storage::queries::messages;
use mailsync::storage::Database;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Helpers
// ============================================================================

fn raw(id: &str, subject: &str) -> String {
    format!(
        "From: sender@example.com\r\nTo: me@example.com\r\nSubject: {}\r\nMessage-ID: <{}>\r\n\r\n{} body\r\n",
        subject, id, subject
    )
}

fn descriptor(id: &str) -> AccountConfig {
    AccountConfig {
        id: Some(id.to_string()),
        host: Some("memory".to_string()),
        port: None,
        username: Some("user".to_string()),
        secret: Some("secret".to_string()),
        use_tls: true,
    }
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        keepalive: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(50),
        ..ManagerConfig::default()
    }
}

fn orchestrator(
    transport: &MemoryTransport,
    config: ManagerConfig,
    buffer: usize,
) -> (SyncOrchestrator, mpsc::Receiver<SyncEvent>) {
    SyncOrchestrator::with_config(Arc::new(transport.clone()), config, buffer, WAIT)
}

async fn mailbox(transport: &MemoryTransport, id: &str) -> Arc<MemoryMailbox> {
    transport.mailbox(&AccountId::from(id)).await
}

async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<SyncEvent>) {
    let extra = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);
}

async fn wait_live(orchestrator: &SyncOrchestrator, ids: &[&str]) {
    let deadline = Instant::now() + WAIT;
    loop {
        let live = orchestrator.status().await;
        if ids.iter().all(|id| live.contains(&AccountId::from(*id))) {
            return;
        }
        assert!(Instant::now() < deadline, "accounts {:?} not live, got {:?}", ids, live);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_connects(mailbox: &MemoryMailbox, count: u32) {
    let deadline = Instant::now() + WAIT;
    while mailbox.connect_count() < count {
        assert!(Instant::now() < deadline, "expected {} connects", count);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn ids(events: &[SyncEvent]) -> Vec<MessageId> {
    events.iter().map(|e| e.message.id.clone()).collect()
}

// ============================================================================
// Backfill
// ============================================================================

#[tokio::test]
async fn backfill_respects_lookback_window() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    let now = Utc::now();
    inbox
        .deliver("INBOX", raw("d40@example.com", "old"), now - chrono::Duration::days(40))
        .await;
    inbox
        .deliver("INBOX", raw("d10@example.com", "recent"), now - chrono::Duration::days(10))
        .await;
    inbox
        .deliver("INBOX", raw("d1@example.com", "newest"), now - chrono::Duration::days(1))
        .await;

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    let events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    assert_eq!(
        ids(&events),
        vec![MessageId::from("d10@example.com"), MessageId::from("d1@example.com")]
    );
    assert_quiet(&mut rx).await;

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn malformed_message_is_skipped() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    for n in 1..=5 {
        let payload = if n == 3 {
            b"this is not an email at all\r\n".to_vec()
        } else {
            raw(&format!("m{}@example.com", n), "hello").into_bytes()
        };
        inbox.deliver("INBOX", payload, Utc::now()).await;
    }

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(next_event(&mut rx).await);
    }
    assert_eq!(
        ids(&events),
        vec![
            MessageId::from("m1@example.com"),
            MessageId::from("m2@example.com"),
            MessageId::from("m4@example.com"),
            MessageId::from("m5@example.com"),
        ]
    );
    assert_quiet(&mut rx).await;
    assert_eq!(orchestrator.status().await.len(), 1);

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn binary_and_truncated_payloads_are_skipped() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    inbox.deliver("INBOX", raw("m1@example.com", "first"), Utc::now()).await;
    inbox
        .deliver("INBOX", vec![0x00, 0xff, 0xfe, b'\n', 0x13, b':', 0x80], Utc::now())
        .await;
    inbox
        .deliver("INBOX", "From: sender@example.com\r\nSubject: cut off\r\nMessage-", Utc::now())
        .await;
    inbox.deliver("INBOX", raw("m4@example.com", "last"), Utc::now()).await;

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    let events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    assert_eq!(
        ids(&events),
        vec![MessageId::from("m1@example.com"), MessageId::from("m4@example.com")]
    );
    assert_quiet(&mut rx).await;

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn duplicate_message_ids_emitted_once_per_session() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    inbox.deliver("INBOX", raw("same@example.com", "one"), Utc::now()).await;
    inbox.deliver("INBOX", raw("same@example.com", "copy"), Utc::now()).await;

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    assert_eq!(next_event(&mut rx).await.message.subject, "one");
    wait_live(&orchestrator, &["a"]).await;

    inbox.deliver("INBOX", raw("same@example.com", "late copy"), Utc::now()).await;
    inbox.deliver("INBOX", raw("other@example.com", "other"), Utc::now()).await;

    assert_eq!(next_event(&mut rx).await.message.id, MessageId::from("other@example.com"));
    assert_quiet(&mut rx).await;

    orchestrator.shutdown_all().await.unwrap();
}

// ============================================================================
// Listening
// ============================================================================

#[tokio::test]
async fn new_mail_follows_backfill_in_order() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    inbox.deliver("INBOX", raw("old@example.com", "old"), Utc::now()).await;

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    assert_eq!(next_event(&mut rx).await.message.id, MessageId::from("old@example.com"));
    wait_live(&orchestrator, &["a"]).await;

    inbox.deliver("INBOX", raw("new1@example.com", "n1"), Utc::now()).await;
    inbox.deliver("INBOX", raw("new2@example.com", "n2"), Utc::now()).await;

    let events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    assert_eq!(
        ids(&events),
        vec![MessageId::from("new1@example.com"), MessageId::from("new2@example.com")]
    );
    assert!(events.iter().all(|e| e.account_id == AccountId::from("a")));

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn keep_alive_sent_while_listening() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    let config = ManagerConfig {
        keepalive: Duration::from_millis(30),
        ..fast_config()
    };

    let (orchestrator, _rx) = orchestrator(&transport, config, 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(inbox.keep_alive_count() >= 2, "keep-alives: {}", inbox.keep_alive_count());
    assert_eq!(inbox.connect_count(), 1);
    wait_live(&orchestrator, &["a"]).await;

    orchestrator.shutdown_all().await.unwrap();
}

// ============================================================================
// Failure isolation and reconnect
// ============================================================================

#[tokio::test]
async fn reconnect_is_isolated_to_failed_account() {
    let transport = MemoryTransport::new();
    let inbox_a = mailbox(&transport, "a").await;
    let inbox_b = mailbox(&transport, "b").await;

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator
        .start_all(&[descriptor("a"), descriptor("b")])
        .await
        .unwrap();
    wait_live(&orchestrator, &["a", "b"]).await;

    inbox_a.sever().await;
    wait_connects(&inbox_a, 2).await;
    wait_live(&orchestrator, &["a", "b"]).await;
    assert_eq!(inbox_b.connect_count(), 1);

    inbox_b.deliver("INBOX", raw("b1@example.com", "for b"), Utc::now()).await;
    let event = next_event(&mut rx).await;
    assert_eq!(event.account_id, AccountId::from("b"));

    inbox_a.deliver("INBOX", raw("a1@example.com", "for a"), Utc::now()).await;
    let event = next_event(&mut rx).await;
    assert_eq!(event.account_id, AccountId::from("a"));

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn operator_reconnect_redelivers_and_sink_collapses() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    inbox.deliver("INBOX", raw("m1@example.com", "hello"), Utc::now()).await;

    // A long failure delay proves operator requests do not wait for it.
    let config = ManagerConfig {
        reconnect_delay: Duration::from_secs(30),
        ..fast_config()
    };
    let (orchestrator, mut rx) = orchestrator(&transport, config, 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    let first = next_event(&mut rx).await;
    wait_live(&orchestrator, &["a"]).await;

    orchestrator.reconnect(&AccountId::from("a")).unwrap();
    let second = next_event(&mut rx).await;
    assert_eq!(first.dedup_key(), second.dedup_key());
    assert_eq!(inbox.connect_count(), 2);
    assert!(inbox.logout_count() >= 1);

    orchestrator.shutdown_all().await.unwrap();

    let db = Database::open_in_memory().await.unwrap();
    let mut worker = SinkWorker::new(IndexingSink::new(db.clone()), 64);
    worker.process(first).await;
    worker.process(second).await;

    assert_eq!(worker.stats().handled, 1);
    assert_eq!(worker.stats().duplicates, 1);
    assert_eq!(
        messages::count_by_account(&db, &AccountId::from("a")).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn rejected_credentials_keep_retrying() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    inbox.reject_auth(true);

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.status().await.is_empty());
    let mode = orchestrator.modes().await[&AccountId::from("a")].mode;
    assert!(
        matches!(mode, SessionMode::Connecting | SessionMode::Reconnecting),
        "mode: {}",
        mode
    );

    inbox.reject_auth(false);
    inbox.deliver("INBOX", raw("m1@example.com", "finally"), Utc::now()).await;

    assert_eq!(next_event(&mut rx).await.message.subject, "finally");
    wait_live(&orchestrator, &["a"]).await;

    orchestrator.shutdown_all().await.unwrap();
}

// ============================================================================
// Backpressure and shutdown
// ============================================================================

#[tokio::test]
async fn full_channel_blocks_producer_until_drained() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    for n in 1..=5 {
        inbox
            .deliver("INBOX", raw(&format!("m{}@example.com", n), "bulk"), Utc::now())
            .await;
    }

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 2);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        orchestrator.modes().await[&AccountId::from("a")].mode,
        SessionMode::Backfilling
    );

    let mut events = Vec::new();
    for _ in 0..5 {
        events.push(next_event(&mut rx).await);
    }
    let expected: Vec<MessageId> = (1..=5)
        .map(|n| MessageId::from(format!("m{}@example.com", n)))
        .collect();
    assert_eq!(ids(&events), expected);

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn shutdown_unblocks_full_channel() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "a").await;
    for n in 1..=5 {
        inbox
            .deliver("INBOX", raw(&format!("m{}@example.com", n), "bulk"), Utc::now())
            .await;
    }

    let (orchestrator, _rx) = orchestrator(&transport, fast_config(), 1);
    orchestrator.start_all(&[descriptor("a")]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    orchestrator.shutdown_all().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn shutdown_is_prompt_and_clears_status() {
    let transport = MemoryTransport::new();
    let mailboxes = [
        mailbox(&transport, "a").await,
        mailbox(&transport, "b").await,
        mailbox(&transport, "c").await,
    ];

    let (orchestrator, mut rx) = orchestrator(&transport, fast_config(), 16);
    orchestrator
        .start_all(&[descriptor("a"), descriptor("b"), descriptor("c")])
        .await
        .unwrap();
    wait_live(&orchestrator, &["a", "b", "c"]).await;

    let started = Instant::now();
    orchestrator.shutdown_all().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(orchestrator.status().await.is_empty());
    assert!(orchestrator
        .modes()
        .await
        .values()
        .all(|s| s.mode == SessionMode::Closed));
    for inbox in &mailboxes {
        assert_eq!(inbox.logout_count(), 1);
    }

    assert!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

// ============================================================================
// Startup validation
// ============================================================================

#[tokio::test]
async fn incomplete_accounts_are_skipped() {
    let transport = MemoryTransport::new();
    let (orchestrator, _rx) = orchestrator(&transport, fast_config(), 16);

    let mut no_secret = descriptor("b");
    no_secret.secret = None;

    let report = orchestrator
        .start_all(&[descriptor("a"), no_secret])
        .await
        .unwrap();
    assert_eq!(report.started, vec![AccountId::from("a")]);
    assert_eq!(
        report.skipped,
        vec![ConfigError::MissingField {
            account: "b".to_string(),
            field: "secret",
        }]
    );

    wait_live(&orchestrator, &["a"]).await;
    assert_eq!(orchestrator.status().await.len(), 1);

    orchestrator.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn startup_fails_without_valid_accounts() {
    let transport = MemoryTransport::new();
    let (orchestrator, _rx) = orchestrator(&transport, fast_config(), 16);

    let mut no_host = descriptor("a");
    no_host.host = Some("  ".to_string());

    let err = orchestrator.start_all(&[no_host]).await.unwrap_err();
    assert!(matches!(err, SyncError::NoValidAccounts { .. }));
    assert!(orchestrator.status().await.is_empty());
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn events_are_indexed_and_classified() {
    let transport = MemoryTransport::new();
    let inbox = mailbox(&transport, "sales").await;
    inbox
        .deliver(
            "INBOX",
            "From: prospect@company.com\r\nSubject: Interested in your product demo\r\n\
             Message-ID: <lead@company.com>\r\n\r\nCan we schedule a call?\r\n",
            Utc::now(),
        )
        .await;

    let db = Database::open_in_memory().await.unwrap();
    let sink = IndexingSink::new(db.clone()).with_classifier(Arc::new(KeywordClassifier));

    let (orchestrator, rx) = orchestrator(&transport, fast_config(), 16);
    let worker = tokio::spawn(SinkWorker::new(sink, 64).run(rx));
    orchestrator.start_all(&[descriptor("sales")]).await.unwrap();

    let account = AccountId::from("sales");
    let id = MessageId::from("lead@company.com");
    let deadline = Instant::now() + WAIT;
    loop {
        let stored = messages::get(&db, &account, &id).await.unwrap();
        if stored.as_ref().is_some_and(|s| !s.labels.is_empty()) {
            break;
        }
        assert!(Instant::now() < deadline, "message was not indexed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    orchestrator.shutdown_all().await.unwrap();
    drop(orchestrator);
    let stats = worker.await.unwrap();
    assert_eq!(stats.handled, 1);

    let stored = messages::get(&db, &account, &id).await.unwrap().unwrap();
    assert_eq!(stored.labels, vec![EmailLabel::Interested]);
    assert_eq!(stored.message.subject, "Interested in your product demo");
}
