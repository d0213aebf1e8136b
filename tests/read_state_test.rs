//! Integration tests for read-state synchronization through the center.
//!
//! These tests run the full local pipeline: ledger writes flow through
//! the change feed into attached sessions, which surface alerts and
//! keep per-account unread counters converged with the ledger.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;

use sitebell::ledger::MemoryLedger;
use sitebell::surfacer::{AlertError, AlertScheduler, LocalAlert};
use sitebell::types::{AccountId, ListQuery, NotificationDraft};
use sitebell::NotificationCenter;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn center() -> (Arc<MemoryLedger>, NotificationCenter) {
    let ledger = Arc::new(MemoryLedger::new());
    let center = NotificationCenter::new(ledger.clone(), ledger.clone());
    (ledger, center)
}

fn draft(title: &str) -> NotificationDraft {
    NotificationDraft::new(title, "details")
}

/// Waits until the watched counter reaches `expected`.
async fn wait_for_count(rx: &mut watch::Receiver<u64>, expected: u64) {
    while *rx.borrow_and_update() != expected {
        timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("counter update within deadline")
            .expect("watch channel open");
    }
}

/// Collects scheduled alerts for inspection.
struct RecordingScheduler {
    alerts: tokio::sync::Mutex<Vec<LocalAlert>>,
}

impl RecordingScheduler {
    fn new() -> Self {
        Self {
            alerts: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    async fn snapshot(&self) -> Vec<LocalAlert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertScheduler for RecordingScheduler {
    async fn schedule(&self, alert: LocalAlert) -> Result<(), AlertError> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

#[tokio::test]
async fn test_publish_flows_into_attached_counter() {
    init_logs();
    let (_ledger, center) = center();
    let account = AccountId::from("u1");

    center.attach(&account).await.unwrap();
    let mut rx = center.watch_unread(&account).await;

    center.publish(&account, &draft("Delivery")).await.unwrap();
    wait_for_count(&mut rx, 1).await;

    let unread = center
        .list(
            &account,
            &ListQuery {
                only_unread: true,
                ..ListQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].title, "Delivery");

    center.detach(&account).await;
}

#[tokio::test]
async fn test_ack_converges_counter_with_ledger() {
    let (_ledger, center) = center();
    let account = AccountId::from("u1");

    center.attach(&account).await.unwrap();
    let first = center.publish(&account, &draft("One")).await.unwrap();
    center.publish(&account, &draft("Two")).await.unwrap();
    center.publish(&account, &draft("Three")).await.unwrap();

    let mut rx = center.watch_unread(&account).await;
    wait_for_count(&mut rx, 3).await;

    assert!(center.ack(&account, first.id).await);
    wait_for_count(&mut rx, 2).await;

    // An independent recomputation from the ledger agrees
    assert_eq!(center.refresh(&account).await.unwrap(), 2);

    center.detach(&account).await;
}

#[tokio::test]
async fn test_ack_all_zeroes_counter_and_ledger() {
    let (_ledger, center) = center();
    let account = AccountId::from("u1");

    center.attach(&account).await.unwrap();
    for title in ["One", "Two", "Three"] {
        center.publish(&account, &draft(title)).await.unwrap();
    }
    let mut rx = center.watch_unread(&account).await;
    wait_for_count(&mut rx, 3).await;

    assert!(center.ack_all(&account).await);
    wait_for_count(&mut rx, 0).await;
    assert_eq!(center.refresh(&account).await.unwrap(), 0);

    let unread = center
        .list(
            &account,
            &ListQuery {
                only_unread: true,
                ..ListQuery::default()
            },
        )
        .await
        .unwrap();
    assert!(unread.is_empty());

    center.detach(&account).await;
}

#[tokio::test]
async fn test_repeated_acks_never_underflow() {
    let (_ledger, center) = center();
    let account = AccountId::from("u1");

    center.attach(&account).await.unwrap();
    let record = center.publish(&account, &draft("Only")).await.unwrap();
    let mut rx = center.watch_unread(&account).await;
    wait_for_count(&mut rx, 1).await;

    assert!(center.ack(&account, record.id).await);
    assert!(center.ack(&account, record.id).await);
    assert!(center.ack(&account, record.id).await);

    wait_for_count(&mut rx, 0).await;
    assert_eq!(center.refresh(&account).await.unwrap(), 0);

    center.detach(&account).await;
}

#[tokio::test]
async fn test_inserts_missed_while_detached_converge_on_attach() {
    let (_ledger, center) = center();
    let account = AccountId::from("u1");

    // Rows created while nobody is listening - the feed never saw them
    center.publish(&account, &draft("Missed one")).await.unwrap();
    center.publish(&account, &draft("Missed two")).await.unwrap();
    assert_eq!(center.unread_count(&account).await, 0);

    // The seeding refresh on attach converges without any feed event
    center.attach(&account).await.unwrap();
    let mut rx = center.watch_unread(&account).await;
    wait_for_count(&mut rx, 2).await;

    center.detach(&account).await;
}

#[tokio::test]
async fn test_accounts_are_isolated() {
    let (_ledger, center) = center();
    let alice = AccountId::from("u-alice");
    let bob = AccountId::from("u-bob");

    center.attach(&alice).await.unwrap();
    center.attach(&bob).await.unwrap();
    let mut alice_rx = center.watch_unread(&alice).await;
    let mut bob_rx = center.watch_unread(&bob).await;

    center.publish(&alice, &draft("For Alice")).await.unwrap();
    wait_for_count(&mut alice_rx, 1).await;
    assert_eq!(center.unread_count(&bob).await, 0);

    center
        .publish_many(&[alice.clone(), bob.clone()], &draft("Site-wide"))
        .await
        .unwrap();
    wait_for_count(&mut alice_rx, 2).await;
    wait_for_count(&mut bob_rx, 1).await;

    center.detach(&alice).await;
    center.detach(&bob).await;
}

#[tokio::test]
async fn test_ack_on_one_session_updates_another() {
    init_logs();
    // Two centers over one shared ledger, like two devices of one user
    let ledger = Arc::new(MemoryLedger::new());
    let phone = NotificationCenter::new(ledger.clone(), ledger.clone());
    let tablet = NotificationCenter::new(ledger.clone(), ledger.clone());
    let account = AccountId::from("u1");

    phone.attach(&account).await.unwrap();
    tablet.attach(&account).await.unwrap();
    let mut phone_rx = phone.watch_unread(&account).await;
    let mut tablet_rx = tablet.watch_unread(&account).await;

    let record = phone.publish(&account, &draft("Shared")).await.unwrap();
    wait_for_count(&mut phone_rx, 1).await;
    wait_for_count(&mut tablet_rx, 1).await;

    // Reading on the phone reaches the tablet through the update event
    assert!(phone.ack(&account, record.id).await);
    wait_for_count(&mut phone_rx, 0).await;
    wait_for_count(&mut tablet_rx, 0).await;

    phone.detach(&account).await;
    tablet.detach(&account).await;
}

#[tokio::test]
async fn test_attached_session_surfaces_inserts_locally() {
    let ledger = Arc::new(MemoryLedger::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let center = NotificationCenter::new(ledger.clone(), ledger.clone())
        .with_surfacer(scheduler.clone());
    let account = AccountId::from("u1");
    let other = AccountId::from("u2");

    center.attach(&account).await.unwrap();

    let before = Utc::now();
    let record = center.publish(&account, &draft("Gate call")).await.unwrap();
    // A row for an unattached account must not surface here
    center.publish(&other, &draft("Elsewhere")).await.unwrap();

    let mut alerts = Vec::new();
    for _ in 0..40 {
        alerts = scheduler.snapshot().await;
        if !alerts.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].handle, record.id.0);
    assert_eq!(alerts[0].title, "Gate call");
    // Surfacing is deferred, never immediate
    assert!(alerts[0].fire_at > before);

    center.detach(&account).await;
}
