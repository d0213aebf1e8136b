//! Per-account unread counters, observed through watch channels.
//!
//! The counter is a cache, never the source of truth. `refresh` is the
//! only authoritative path; acknowledgements adjust the cache
//! optimistically, and any drift (failed ack, missed feed event) lasts
//! only until the next refresh converges it with the ledger aggregate.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::ledger::{Ledger, LedgerError};
use crate::types::{AccountId, NotificationId};

/// Maintains in-memory unread counters derived from the ledger.
pub struct ReadStateReducer {
    ledger: Arc<dyn Ledger>,
    counters: RwLock<HashMap<AccountId, watch::Sender<u64>>>,
}

impl ReadStateReducer {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Recomputes the counter from the ledger aggregate.
    pub async fn refresh(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let count = self.ledger.count_unread(account).await?;
        self.with_sender(account, |sender| {
            sender.send_replace(count);
        })
        .await;
        log::debug!("[Unread] Account {account} refreshed to {count} unread");
        Ok(count)
    }

    /// Current counter value; 0 for accounts never refreshed.
    pub async fn count(&self, account: &AccountId) -> u64 {
        let counters = self.counters.read().await;
        counters.get(account).map_or(0, |sender| *sender.borrow())
    }

    /// Observes the counter; the receiver wakes on every change.
    pub async fn watch(&self, account: &AccountId) -> watch::Receiver<u64> {
        self.with_sender(account, watch::Sender::subscribe).await
    }

    /// Acknowledges one notification: flips the ledger row and
    /// optimistically decrements the counter, floored at zero.
    ///
    /// Acking an already-read id succeeds without decrementing again
    /// (the ledger reports no transition). Returns false only when the
    /// ledger write failed; the counter is then left for the next
    /// refresh to correct.
    pub async fn ack(&self, account: &AccountId, id: NotificationId) -> bool {
        match self.ledger.mark_read(id).await {
            Ok(true) => {
                self.with_sender(account, |sender| {
                    sender.send_modify(|count| *count = count.saturating_sub(1));
                })
                .await;
                log::debug!("[Unread] Account {account} acked notification {id}");
                true
            }
            Ok(false) => true,
            Err(e) => {
                log::warn!("[Unread] Ack of notification {id} failed: {e}");
                false
            }
        }
    }

    /// Acknowledges everything unread and zeroes the counter.
    pub async fn ack_all(&self, account: &AccountId) -> bool {
        match self.ledger.mark_all_read(account).await {
            Ok(flipped) => {
                self.with_sender(account, |sender| {
                    sender.send_replace(0);
                })
                .await;
                log::debug!("[Unread] Account {account} acked all ({flipped} rows)");
                true
            }
            Err(e) => {
                log::warn!("[Unread] Ack-all for account {account} failed: {e}");
                false
            }
        }
    }

    /// Runs `f` against the account's watch sender, creating the
    /// channel on first use.
    async fn with_sender<R>(
        &self,
        account: &AccountId,
        f: impl FnOnce(&watch::Sender<u64>) -> R,
    ) -> R {
        let mut counters = self.counters.write().await;
        let sender = counters
            .entry(account.clone())
            .or_insert_with(|| watch::channel(0).0);
        f(sender)
    }
}
