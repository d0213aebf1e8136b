//! Account-scoped change-feed subscriptions.
//!
//! The ledger is mutated by many sessions at once; the change feed is
//! how one session observes everyone else. This module multiplexes
//! any number of in-process consumers onto exactly one upstream stream
//! per account.
//!
//! # Architecture
//!
//! ```text
//! ChangeFeed (trait)                 ChangeFeedListener
//! ├── MemoryLedger ──┐                    │
//! └── RealtimeFeed ──┴── mpsc ──► pump ──► broadcast ──► FeedSubscription
//!                                                        FeedSubscription
//! ```
//!
//! Delivery is at-least-once and consumers must be idempotent on
//! notification id. A consumer that falls behind sees a [`FeedEvent::Resync`]
//! instead of the missed deltas and is expected to rebuild derived state
//! from the ledger.

// Rust guideline compliant 2026-01

pub mod realtime;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::constants::FEED_FANOUT_CAPACITY;
use crate::types::{AccountId, NotificationRecord};

pub use realtime::RealtimeFeed;

/// One observed ledger mutation, or a resynchronization marker.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A new notification row appeared.
    Insert(NotificationRecord),
    /// An existing row mutated in place (read flag flip).
    Update(NotificationRecord),
    /// The stream (re)connected or dropped events. Derived state must
    /// be rebuilt from the ledger, not patched from deltas.
    Resync,
}

/// Errors raised while establishing a feed subscription.
#[derive(Debug)]
pub enum FeedError {
    /// The upstream feed could not be reached.
    Connect(String),
    /// The feed infrastructure is no longer running.
    Closed,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "Feed connection failed: {msg}"),
            Self::Closed => write!(f, "Feed closed"),
        }
    }
}

impl std::error::Error for FeedError {}

/// Server-pushed stream of ledger mutations for one account.
///
/// Implementations emit [`FeedEvent::Resync`] as the first event of
/// every (re)established stream, and again after any gap in delivery.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, account: &AccountId)
        -> Result<mpsc::Receiver<FeedEvent>, FeedError>;
}

/// A live, cancellable view of one account's change stream.
pub struct FeedSubscription {
    id: Uuid,
    account: AccountId,
    events: broadcast::Receiver<FeedEvent>,
}

impl FeedSubscription {
    /// Handle identifying this subscriber to the listener.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Waits for the next event; `None` once the feed is gone for good.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        match self.events.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!(
                    "[Feed] Subscription {} lagged by {skipped} events, resyncing",
                    self.id
                );
                Some(FeedEvent::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

struct ActiveUpstream {
    fanout: broadcast::Sender<FeedEvent>,
    subscribers: HashSet<Uuid>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Multiplexes consumers so each account holds exactly one upstream
/// subscription per session, however many consumers attach.
pub struct ChangeFeedListener {
    feed: Arc<dyn ChangeFeed>,
    active: Mutex<HashMap<AccountId, ActiveUpstream>>,
}

impl ChangeFeedListener {
    #[must_use]
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a subscriber to `account`'s stream, opening the
    /// upstream subscription when this is the first one.
    pub async fn subscribe(&self, account: &AccountId) -> Result<FeedSubscription, FeedError> {
        let mut active = self.active.lock().await;

        // A pump that already exited leaves a dead fan-out behind;
        // rebuild rather than hand out subscriptions to it.
        if active.get(account).is_some_and(|u| u.task.is_finished()) {
            log::warn!("[Feed] Upstream for account {account} had ended, reopening");
            active.remove(account);
        }

        let upstream = match active.entry(account.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let events = self.feed.subscribe(account).await?;
                let (fanout, _) = broadcast::channel(FEED_FANOUT_CAPACITY);
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let task = tokio::spawn(pump(
                    account.clone(),
                    events,
                    fanout.clone(),
                    shutdown_rx,
                ));
                log::info!("[Feed] Opened upstream subscription for account {account}");
                entry.insert(ActiveUpstream {
                    fanout,
                    subscribers: HashSet::new(),
                    shutdown: shutdown_tx,
                    task,
                })
            }
        };

        let id = Uuid::new_v4();
        upstream.subscribers.insert(id);
        Ok(FeedSubscription {
            id,
            account: account.clone(),
            events: upstream.fanout.subscribe(),
        })
    }

    /// Detaches one subscriber. The upstream subscription closes when
    /// the last subscriber for its account leaves, and this call only
    /// returns after the pump has stopped.
    pub async fn unsubscribe(&self, subscription: FeedSubscription) {
        let FeedSubscription { id, account, events } = subscription;
        drop(events);

        let mut active = self.active.lock().await;
        let Some(upstream) = active.get_mut(&account) else {
            return;
        };
        upstream.subscribers.remove(&id);
        if !upstream.subscribers.is_empty() {
            return;
        }

        let Some(upstream) = active.remove(&account) else {
            return;
        };
        drop(active);

        let _ = upstream.shutdown.send(());
        let _ = upstream.task.await;
        log::info!("[Feed] Closed upstream subscription for account {account}");
    }
}

/// Forwards one upstream stream into the per-account fan-out until the
/// upstream ends or the listener shuts it down.
async fn pump(
    account: AccountId,
    mut events: mpsc::Receiver<FeedEvent>,
    fanout: broadcast::Sender<FeedEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::debug!("[Feed] Pump for account {account} shutting down");
                break;
            }
            event = events.recv() => {
                match event {
                    // No receivers right now is fine; more may attach
                    Some(event) => {
                        let _ = fanout.send(event);
                    }
                    None => {
                        log::warn!("[Feed] Upstream stream for account {account} ended");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::types::NotificationId;

    struct StubFeed {
        subscribes: AtomicUsize,
        senders: std::sync::Mutex<Vec<mpsc::Sender<FeedEvent>>>,
    }

    impl StubFeed {
        fn new() -> Self {
            Self {
                subscribes: AtomicUsize::new(0),
                senders: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn sender(&self, index: usize) -> mpsc::Sender<FeedEvent> {
            self.senders.lock().expect("senders lock poisoned")[index].clone()
        }
    }

    #[async_trait]
    impl ChangeFeed for StubFeed {
        async fn subscribe(
            &self,
            _account: &AccountId,
        ) -> Result<mpsc::Receiver<FeedEvent>, FeedError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let _ = tx.send(FeedEvent::Resync).await;
            self.senders.lock().expect("senders lock poisoned").push(tx);
            Ok(rx)
        }
    }

    fn record(id: i64) -> NotificationRecord {
        NotificationRecord {
            id: NotificationId(id),
            account: AccountId::from("acct-1"),
            title: "Pour scheduled".to_string(),
            message: "Slab pour moved to 07:00".to_string(),
            category: crate::types::Category::Info,
            source: None,
            source_id: None,
            read: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_share_one_upstream() {
        let stub = Arc::new(StubFeed::new());
        let listener = ChangeFeedListener::new(stub.clone() as Arc<dyn ChangeFeed>);
        let account = AccountId::from("acct-1");

        let mut first = listener.subscribe(&account).await.unwrap();
        let mut second = listener.subscribe(&account).await.unwrap();
        assert_eq!(stub.subscribes.load(Ordering::SeqCst), 1);
        assert_ne!(first.id(), second.id());

        assert!(matches!(first.next().await, Some(FeedEvent::Resync)));
        assert!(matches!(second.next().await, Some(FeedEvent::Resync)));

        stub.sender(0).send(FeedEvent::Insert(record(1))).await.unwrap();
        assert!(matches!(first.next().await, Some(FeedEvent::Insert(_))));
        assert!(matches!(second.next().await, Some(FeedEvent::Insert(_))));
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_upstream() {
        let stub = Arc::new(StubFeed::new());
        let listener = ChangeFeedListener::new(stub.clone() as Arc<dyn ChangeFeed>);
        let account = AccountId::from("acct-1");

        let first = listener.subscribe(&account).await.unwrap();
        let second = listener.subscribe(&account).await.unwrap();

        listener.unsubscribe(first).await;
        assert!(!stub.sender(0).is_closed());

        listener.unsubscribe(second).await;
        assert!(stub.sender(0).is_closed());

        // The next subscriber gets a brand new upstream
        let _third = listener.subscribe(&account).await.unwrap();
        assert_eq!(stub.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_different_accounts_get_separate_upstreams() {
        let stub = Arc::new(StubFeed::new());
        let listener = ChangeFeedListener::new(stub.clone() as Arc<dyn ChangeFeed>);

        let _a = listener.subscribe(&AccountId::from("acct-1")).await.unwrap();
        let _b = listener.subscribe(&AccountId::from("acct-2")).await.unwrap();

        assert_eq!(stub.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_resyncs() {
        let stub = Arc::new(StubFeed::new());
        let listener = ChangeFeedListener::new(stub.clone() as Arc<dyn ChangeFeed>);
        let account = AccountId::from("acct-1");

        let mut slow = listener.subscribe(&account).await.unwrap();

        let sender = stub.sender(0);
        for i in 0..(i64::try_from(FEED_FANOUT_CAPACITY).unwrap() + 16) {
            sender.send(FeedEvent::Insert(record(i))).await.unwrap();
        }
        // Give the pump time to drain the upstream into the fan-out
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Initial Resync plus the overflow both collapsed into a lag,
        // so the next observed event must be a Resync marker
        assert!(matches!(slow.next().await, Some(FeedEvent::Resync)));
    }
}
