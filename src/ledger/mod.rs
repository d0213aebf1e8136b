//! Shared notification ledger abstraction.
//!
//! The ledger is the source of truth: a persistent store of notification
//! rows and device endpoints observed concurrently by many sessions.
//! Everything above it (dispatch, counters, feeds) derives from what the
//! ledger says.
//!
//! # Architecture
//!
//! ```text
//! Ledger (trait)
//!     │
//!     ├── MemoryLedger
//!     │   └── In-process store + broadcast change events (tests, embedded)
//!     │
//!     └── RestLedger
//!         └── HTTP client against the hosted relational backend
//! ```
//!
//! Row mutations surface as [`ChangeEvent`]s; the change-feed layer turns
//! those into per-account subscriptions.

// Rust guideline compliant 2026-02

pub mod memory;
pub mod rest;

use async_trait::async_trait;

use crate::types::{
    AccountId, DeviceEndpoint, EndpointToken, ListQuery, NotificationDraft, NotificationId,
    NotificationRecord,
};

/// Errors raised by ledger reads and writes.
///
/// A failed operation leaves local state unchanged; callers decide
/// whether and when to retry.
#[derive(Debug)]
pub enum LedgerError {
    /// A read failed (network, backend, or decode).
    Query(String),
    /// A write failed (network, backend, or decode).
    Write(String),
    /// The backend answered with something unparseable.
    MalformedResponse(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(msg) => write!(f, "Ledger query failed: {msg}"),
            Self::Write(msg) => write!(f, "Ledger write failed: {msg}"),
            Self::MalformedResponse(msg) => write!(f, "Malformed ledger response: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// A row-level mutation observed on the ledger.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A new notification row was created.
    Inserted(NotificationRecord),
    /// An existing row mutated in place (read flag flip).
    Updated(NotificationRecord),
}

/// Persistent store of notification rows and device endpoints.
///
/// Implementors must keep rows append-only apart from the `read` and
/// `updated_at` columns, and must treat `(account, token)` as the
/// identity of an endpoint row.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Appends one notification row for `account`, created unread.
    async fn insert(
        &self,
        account: &AccountId,
        draft: &NotificationDraft,
    ) -> Result<NotificationRecord, LedgerError>;

    /// Appends one row per account, all carrying the same content.
    ///
    /// Returns the created rows in account order.
    async fn insert_many(
        &self,
        accounts: &[AccountId],
        draft: &NotificationDraft,
    ) -> Result<Vec<NotificationRecord>, LedgerError>;

    /// Lists an account's rows, newest first.
    async fn list(
        &self,
        account: &AccountId,
        query: &ListQuery,
    ) -> Result<Vec<NotificationRecord>, LedgerError>;

    /// Counts an account's unread rows.
    async fn count_unread(&self, account: &AccountId) -> Result<u64, LedgerError>;

    /// Flips one row's read flag from false to true.
    ///
    /// Returns `true` only when a row actually transitioned; an already
    /// read or missing row yields `false`. This is what makes repeated
    /// acknowledgements of the same id idempotent upstream.
    async fn mark_read(&self, id: NotificationId) -> Result<bool, LedgerError>;

    /// Flips every unread row for `account` and returns how many flipped.
    async fn mark_all_read(&self, account: &AccountId) -> Result<u64, LedgerError>;

    /// Adds or refreshes a device endpoint registration.
    ///
    /// Re-registering an existing `(account, token)` pair only refreshes
    /// its `updated_at`; the endpoint set never grows duplicates.
    async fn upsert_endpoint(&self, endpoint: DeviceEndpoint) -> Result<(), LedgerError>;

    /// Returns every endpoint registered for `account`.
    ///
    /// An empty result is not an error; it means nothing to deliver to.
    async fn endpoints(&self, account: &AccountId) -> Result<Vec<DeviceEndpoint>, LedgerError>;

    /// Removes one endpoint registration. Removing an absent endpoint
    /// succeeds silently.
    async fn remove_endpoint(
        &self,
        account: &AccountId,
        token: &EndpointToken,
    ) -> Result<(), LedgerError>;
}

pub use memory::MemoryLedger;
pub use rest::RestLedger;
