//! The constructed-once facade wiring every component together.
//!
//! # Architecture
//!
//! ```text
//! NotificationCenter
//! ├── EndpointRegistry ──┐
//! ├── DispatchEngine ────┼── Ledger (memory or REST)
//! ├── ReadStateReducer ──┤
//! ├── ChangeFeedListener ┴── ChangeFeed (memory or realtime)
//! ├── LocalSurfacer
//! └── sessions: one pump task per attached account
//! ```
//!
//! An attached account has a session: a task that consumes the
//! account's feed subscription, surfaces qualifying inserts locally and
//! refreshes the unread counter after every mutating event. Detaching
//! stops the task and releases the subscription deterministically, so
//! the upstream feed connection closes once the last session on it is
//! gone.

// Rust guideline compliant 2025-01

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{DispatchEngine, DispatchError, DispatchReport};
use crate::feed::{
    ChangeFeed, ChangeFeedListener, FeedError, FeedEvent, FeedSubscription, RealtimeFeed,
};
use crate::gateway::{CredentialProvider, JwtGrantExchanger, PushGateway};
use crate::ledger::{Ledger, LedgerError, RestLedger};
use crate::registry::EndpointRegistry;
use crate::surfacer::{AlertScheduler, LocalSurfacer};
use crate::types::{
    AccountId, EndpointToken, ListQuery, NotificationDraft, NotificationId, NotificationRecord,
};
use crate::unread::ReadStateReducer;

/// One attached account's pump task and its stop signal.
///
/// The task returns the feed subscription when it exits so the center
/// can hand it back to the listener for release.
struct Session {
    shutdown: oneshot::Sender<()>,
    pump: JoinHandle<FeedSubscription>,
}

/// Single entry point for producing, delivering and observing
/// notifications.
pub struct NotificationCenter {
    ledger: Arc<dyn Ledger>,
    registry: Arc<EndpointRegistry>,
    reducer: Arc<ReadStateReducer>,
    listener: Arc<ChangeFeedListener>,
    surfacer: Arc<LocalSurfacer>,
    dispatcher: Option<Arc<DispatchEngine>>,
    sessions: Mutex<HashMap<AccountId, Session>>,
}

impl NotificationCenter {
    /// Builds a center around a ledger and its change feed, without
    /// push delivery or on-device alerts.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            registry: Arc::new(EndpointRegistry::new(Arc::clone(&ledger))),
            reducer: Arc::new(ReadStateReducer::new(Arc::clone(&ledger))),
            listener: Arc::new(ChangeFeedListener::new(feed)),
            surfacer: Arc::new(LocalSurfacer::inert()),
            dispatcher: None,
            sessions: Mutex::new(HashMap::new()),
            ledger,
        }
    }

    /// Enables push delivery through `gateway`, authorized by
    /// `credentials`.
    #[must_use]
    pub fn with_gateway(mut self, gateway: PushGateway, credentials: CredentialProvider) -> Self {
        self.dispatcher = Some(Arc::new(DispatchEngine::new(
            Arc::clone(&self.registry),
            Arc::new(credentials),
            Arc::new(gateway),
        )));
        self
    }

    /// Enables on-device alerts for feed inserts.
    #[must_use]
    pub fn with_surfacer(mut self, scheduler: Arc<dyn AlertScheduler>) -> Self {
        self.surfacer = Arc::new(LocalSurfacer::new(scheduler));
        self
    }

    /// Wires the full hosted stack from configuration: REST ledger,
    /// realtime change feed and authenticated push gateway.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let account = config.service_account()?;
        let ledger: Arc<dyn Ledger> = Arc::new(RestLedger::new(
            &config.ledger_url,
            &config.ledger_api_key,
        )?);
        let feed: Arc<dyn ChangeFeed> = Arc::new(RealtimeFeed::new(
            &config.ledger_url,
            &config.ledger_api_key,
        ));
        let gateway = PushGateway::new(&config.gateway_url, &account.project_id)?;
        let credentials = CredentialProvider::new(account, Arc::new(JwtGrantExchanger::new()?));
        Ok(Self::new(ledger, feed).with_gateway(gateway, credentials))
    }

    // Endpoint lifecycle

    /// Registers (or refreshes) a device endpoint for an account.
    pub async fn register_endpoint(
        &self,
        account: &AccountId,
        token: EndpointToken,
    ) -> Result<(), LedgerError> {
        self.registry.register(account, token).await
    }

    /// Removes one device endpoint registration.
    pub async fn remove_endpoint(
        &self,
        account: &AccountId,
        token: &EndpointToken,
    ) -> Result<(), LedgerError> {
        self.registry.remove(account, token).await
    }

    // Delivery

    /// Sends a push to every registered endpoint of `account`.
    ///
    /// Delivery only; nothing is appended to the ledger. Fails with
    /// [`DispatchError::Disabled`] when the center was built without a
    /// gateway.
    pub async fn dispatch(
        &self,
        account: &AccountId,
        title: &str,
        body: &str,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<DispatchReport, DispatchError> {
        let Some(dispatcher) = &self.dispatcher else {
            return Err(DispatchError::Disabled);
        };
        dispatcher.dispatch(account, title, body, data).await
    }

    // Generation

    /// Appends one notification row; attached sessions learn of it
    /// through the change feed.
    pub async fn publish(
        &self,
        account: &AccountId,
        draft: &NotificationDraft,
    ) -> Result<NotificationRecord, LedgerError> {
        self.ledger.insert(account, draft).await
    }

    /// Appends the same draft once per account.
    pub async fn publish_many(
        &self,
        accounts: &[AccountId],
        draft: &NotificationDraft,
    ) -> Result<Vec<NotificationRecord>, LedgerError> {
        self.ledger.insert_many(accounts, draft).await
    }

    /// Lists an account's notifications, newest first.
    pub async fn list(
        &self,
        account: &AccountId,
        query: &ListQuery,
    ) -> Result<Vec<NotificationRecord>, LedgerError> {
        self.ledger.list(account, query).await
    }

    // Read state

    /// Current cached unread count; 0 before the first refresh.
    pub async fn unread_count(&self, account: &AccountId) -> u64 {
        self.reducer.count(account).await
    }

    /// Recomputes the unread counter from the ledger.
    pub async fn refresh(&self, account: &AccountId) -> Result<u64, LedgerError> {
        self.reducer.refresh(account).await
    }

    /// Acknowledges one notification. Returns false only when the
    /// ledger write failed.
    pub async fn ack(&self, account: &AccountId, id: NotificationId) -> bool {
        self.reducer.ack(account, id).await
    }

    /// Acknowledges everything unread for an account.
    pub async fn ack_all(&self, account: &AccountId) -> bool {
        self.reducer.ack_all(account).await
    }

    /// Observes the account's unread counter.
    pub async fn watch_unread(&self, account: &AccountId) -> watch::Receiver<u64> {
        self.reducer.watch(account).await
    }

    // Sessions

    /// Starts a live session for an account: subscribes to its change
    /// feed and seeds the unread counter from the ledger.
    ///
    /// Attaching an already-attached account is a no-op.
    pub async fn attach(&self, account: &AccountId) -> Result<(), FeedError> {
        let mut sessions = self.sessions.lock().await;

        // A pump that exited on its own (feed permanently gone) leaves
        // a stale entry; release it and attach fresh.
        if let Some(session) = sessions.get(account) {
            if !session.pump.is_finished() {
                log::debug!("[Center] Account {account} already attached");
                return Ok(());
            }
            if let Some(stale) = sessions.remove(account) {
                drop(stale.shutdown);
                if let Ok(subscription) = stale.pump.await {
                    self.listener.unsubscribe(subscription).await;
                }
            }
        }

        let subscription = self.listener.subscribe(account).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pump = tokio::spawn(session_pump(
            account.clone(),
            subscription,
            Arc::clone(&self.reducer),
            Arc::clone(&self.surfacer),
            shutdown_rx,
        ));
        sessions.insert(
            account.clone(),
            Session {
                shutdown: shutdown_tx,
                pump,
            },
        );
        drop(sessions);
        log::info!("[Center] Account {account} attached");

        if let Err(e) = self.reducer.refresh(account).await {
            log::warn!("[Center] Seeding refresh for account {account} failed: {e}");
        }
        Ok(())
    }

    /// Ends an account's session and releases its feed subscription.
    ///
    /// Returns once the pump task has stopped, so no further counter
    /// updates or alerts for this account happen afterwards.
    pub async fn detach(&self, account: &AccountId) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(account)
        };
        let Some(session) = session else {
            log::debug!("[Center] Detach for account {account} with no active session");
            return;
        };

        let _ = session.shutdown.send(());
        match session.pump.await {
            Ok(subscription) => self.listener.unsubscribe(subscription).await,
            Err(e) => log::warn!("[Center] Session pump for account {account} ended abnormally: {e}"),
        }
        log::info!("[Center] Account {account} detached");
    }
}

/// Consumes one account's feed events until told to stop.
///
/// Inserts surface a local alert and refresh the counter; updates and
/// resyncs refresh the counter only. A missed-then-resynced insert is
/// never surfaced retroactively.
async fn session_pump(
    account: AccountId,
    mut subscription: FeedSubscription,
    reducer: Arc<ReadStateReducer>,
    surfacer: Arc<LocalSurfacer>,
    mut shutdown: oneshot::Receiver<()>,
) -> FeedSubscription {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = subscription.next() => match event {
                Some(FeedEvent::Insert(record)) => {
                    surfacer.maybe_surface(&record);
                    refresh_counter(&reducer, &account).await;
                }
                Some(FeedEvent::Update(_) | FeedEvent::Resync) => {
                    refresh_counter(&reducer, &account).await;
                }
                None => {
                    log::warn!("[Center] Feed for account {account} ended");
                    break;
                }
            },
        }
    }
    subscription
}

async fn refresh_counter(reducer: &ReadStateReducer, account: &AccountId) {
    if let Err(e) = reducer.refresh(account).await {
        log::warn!("[Center] Counter refresh for account {account} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::ledger::MemoryLedger;

    fn center() -> (Arc<MemoryLedger>, NotificationCenter) {
        let ledger = Arc::new(MemoryLedger::new());
        let center = NotificationCenter::new(ledger.clone(), ledger.clone());
        (ledger, center)
    }

    fn draft() -> NotificationDraft {
        NotificationDraft::new("Inspection", "Scaffold sign-off due today")
    }

    async fn wait_for_count(rx: &mut watch::Receiver<u64>, expected: u64) {
        while *rx.borrow_and_update() != expected {
            timeout(Duration::from_secs(2), rx.changed())
                .await
                .expect("counter update within deadline")
                .expect("watch channel open");
        }
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (ledger, center) = center();
        let account = AccountId::from("acct-1");

        center.attach(&account).await.unwrap();
        center.attach(&account).await.unwrap();
        assert_eq!(ledger.change_subscriber_count(), 1);

        center.detach(&account).await;
    }

    #[tokio::test]
    async fn test_detach_without_attach_is_noop() {
        let (_ledger, center) = center();
        center.detach(&AccountId::from("acct-1")).await;
    }

    #[tokio::test]
    async fn test_publish_reaches_attached_watcher() {
        let (_ledger, center) = center();
        let account = AccountId::from("acct-1");

        let mut rx = center.watch_unread(&account).await;
        center.attach(&account).await.unwrap();

        center.publish(&account, &draft()).await.unwrap();
        wait_for_count(&mut rx, 1).await;

        center.detach(&account).await;
    }

    #[tokio::test]
    async fn test_detach_stops_counter_updates() {
        let (_ledger, center) = center();
        let account = AccountId::from("acct-1");

        center.attach(&account).await.unwrap();
        center.detach(&account).await;

        center.publish(&account, &draft()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(center.unread_count(&account).await, 0);

        // An explicit refresh still sees the ledger truth
        assert_eq!(center.refresh(&account).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_gateway_is_refused() {
        let (_ledger, center) = center();
        let err = center
            .dispatch(
                &AccountId::from("acct-1"),
                "T",
                "B",
                &serde_json::Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Disabled));
    }

    #[tokio::test]
    async fn test_reattach_after_detach_resumes_updates() {
        let (_ledger, center) = center();
        let account = AccountId::from("acct-1");

        center.attach(&account).await.unwrap();
        center.detach(&account).await;
        center.attach(&account).await.unwrap();

        let mut rx = center.watch_unread(&account).await;
        center.publish(&account, &draft()).await.unwrap();
        wait_for_count(&mut rx, 1).await;

        center.detach(&account).await;
    }
}
