//! In-process ledger backed by a guarded vector.
//!
//! Used by tests and by embedded deployments that do not talk to the
//! hosted backend. Behaves like the REST ledger down to the change
//! events it emits, so the layers above cannot tell them apart.

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::constants::{DEFAULT_LIST_LIMIT, FEED_CHANNEL_CAPACITY, FEED_FANOUT_CAPACITY};
use crate::feed::{ChangeFeed, FeedError, FeedEvent};
use crate::ledger::{ChangeEvent, Ledger, LedgerError};
use crate::types::{
    AccountId, DeviceEndpoint, EndpointToken, ListQuery, NotificationDraft, NotificationId,
    NotificationRecord,
};

#[derive(Default)]
struct State {
    next_id: i64,
    records: Vec<NotificationRecord>,
    endpoints: Vec<DeviceEndpoint>,
}

/// Ledger implementation holding everything in memory.
pub struct MemoryLedger {
    inner: RwLock<State>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_FANOUT_CAPACITY);
        Self {
            inner: RwLock::new(State {
                next_id: 1,
                ..State::default()
            }),
            changes,
        }
    }

    /// Subscribes to the raw, unfiltered change stream.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// How many receivers currently observe the change stream.
    #[must_use]
    pub fn change_subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn build_record(
        id: i64,
        account: &AccountId,
        draft: &NotificationDraft,
        now: DateTime<Utc>,
    ) -> NotificationRecord {
        NotificationRecord {
            id: NotificationId(id),
            account: account.clone(),
            title: draft.title.clone(),
            message: draft.message.clone(),
            category: draft.category,
            source: draft.source.clone(),
            source_id: draft.source_id,
            read: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert(
        &self,
        account: &AccountId,
        draft: &NotificationDraft,
    ) -> Result<NotificationRecord, LedgerError> {
        let mut state = self.inner.write().await;
        let record = Self::build_record(state.next_id, account, draft, Utc::now());
        state.next_id += 1;
        state.records.push(record.clone());
        let _ = self.changes.send(ChangeEvent::Inserted(record.clone()));
        Ok(record)
    }

    async fn insert_many(
        &self,
        accounts: &[AccountId],
        draft: &NotificationDraft,
    ) -> Result<Vec<NotificationRecord>, LedgerError> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        let mut created = Vec::with_capacity(accounts.len());
        for account in accounts {
            let record = Self::build_record(state.next_id, account, draft, now);
            state.next_id += 1;
            state.records.push(record.clone());
            let _ = self.changes.send(ChangeEvent::Inserted(record.clone()));
            created.push(record);
        }
        Ok(created)
    }

    async fn list(
        &self,
        account: &AccountId,
        query: &ListQuery,
    ) -> Result<Vec<NotificationRecord>, LedgerError> {
        let state = self.inner.read().await;
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let offset = query.offset.unwrap_or(0);
        // Rows append in id order, so reverse iteration is newest first.
        let rows = state
            .records
            .iter()
            .rev()
            .filter(|r| r.account == *account && (!query.only_unread || !r.read))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn count_unread(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let state = self.inner.read().await;
        let count = state
            .records
            .iter()
            .filter(|r| r.account == *account && !r.read)
            .count();
        Ok(count as u64)
    }

    async fn mark_read(&self, id: NotificationId) -> Result<bool, LedgerError> {
        let mut state = self.inner.write().await;
        let Some(record) = state.records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        if record.read {
            return Ok(false);
        }
        record.read = true;
        record.updated_at = Utc::now();
        let updated = record.clone();
        let _ = self.changes.send(ChangeEvent::Updated(updated));
        Ok(true)
    }

    async fn mark_all_read(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        let mut flipped = 0u64;
        for record in state
            .records
            .iter_mut()
            .filter(|r| r.account == *account && !r.read)
        {
            record.read = true;
            record.updated_at = now;
            let _ = self.changes.send(ChangeEvent::Updated(record.clone()));
            flipped += 1;
        }
        Ok(flipped)
    }

    async fn upsert_endpoint(&self, endpoint: DeviceEndpoint) -> Result<(), LedgerError> {
        let mut state = self.inner.write().await;
        if let Some(existing) = state
            .endpoints
            .iter_mut()
            .find(|e| e.account == endpoint.account && e.token == endpoint.token)
        {
            existing.updated_at = endpoint.updated_at;
        } else {
            state.endpoints.push(endpoint);
        }
        Ok(())
    }

    async fn endpoints(&self, account: &AccountId) -> Result<Vec<DeviceEndpoint>, LedgerError> {
        let state = self.inner.read().await;
        Ok(state
            .endpoints
            .iter()
            .filter(|e| e.account == *account)
            .cloned()
            .collect())
    }

    async fn remove_endpoint(
        &self,
        account: &AccountId,
        token: &EndpointToken,
    ) -> Result<(), LedgerError> {
        let mut state = self.inner.write().await;
        state
            .endpoints
            .retain(|e| !(e.account == *account && e.token == *token));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryLedger {
    async fn subscribe(&self, account: &AccountId) -> Result<mpsc::Receiver<FeedEvent>, FeedError> {
        // Take the broadcast receiver before the initial resync so no
        // event written in between can be missed.
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let account = account.clone();

        tokio::spawn(async move {
            if tx.send(FeedEvent::Resync).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(ChangeEvent::Inserted(record)) => {
                        if record.account == account
                            && !record.read
                            && tx.send(FeedEvent::Insert(record)).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(ChangeEvent::Updated(record)) => {
                        if record.account == account
                            && tx.send(FeedEvent::Update(record)).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[MemoryLedger] Feed lagged by {skipped} events, resyncing");
                        if tx.send(FeedEvent::Resync).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
