//! Sitebell - notification delivery and read-state core.
//!
//! This crate provides the notification subsystem for site management
//! apps: producing notification rows, fanning pushes out to device
//! endpoints through an external gateway, and keeping per-account
//! unread counters consistent with a shared ledger observed live over
//! a change feed.
//!
//! # Architecture
//!
//! The crate follows a constructed-once service pattern:
//!
//! - **NotificationCenter** - Facade, wires components, owns sessions
//! - **Ledger** - Storage trait (in-memory and hosted REST backends)
//! - **Dispatch** - Bounded concurrent fan-out to the push gateway
//! - **Feed** - Account-scoped live subscription to ledger changes
//! - **Unread** - Optimistic per-account counter, watchable
//!
//! # Modules
//!
//! - [`center`] - Public facade and per-account session lifecycle
//! - [`dispatch`] - Push fan-out engine and outcome reporting
//! - [`gateway`] - Gateway client and credential exchange
//! - [`ledger`] - Storage trait and its two backends
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod center;
pub mod dispatch;
pub mod feed;
pub mod gateway;
pub mod ledger;
pub mod registry;
pub mod surfacer;
pub mod unread;

pub mod config;
pub mod constants;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ServiceAccount};
pub use dispatch::{DispatchEngine, DispatchError, DispatchReport};
pub use feed::{ChangeFeedListener, FeedEvent, FeedSubscription};
pub use ledger::{Ledger, LedgerError, MemoryLedger, RestLedger};
pub use types::{
    AccountId, Category, DeviceEndpoint, DispatchErrorKind, DispatchOutcome, EndpointToken,
    ListQuery, NotificationDraft, NotificationId, NotificationRecord,
};

// Re-export the facade
pub use center::NotificationCenter;
