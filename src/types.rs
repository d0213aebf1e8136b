//! Core domain types shared across the crate.
//!
//! Identifier newtypes, the persisted record shapes owned by the ledger,
//! and the transient per-endpoint dispatch outcome.

// Rust guideline compliant 2026-02

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account identifier (opaque, owned by the surrounding application).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ledger-assigned notification identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NotificationId(pub i64);

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for NotificationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque per-device push delivery address issued by the platform.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointToken(pub String);

impl std::fmt::Display for EndpointToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncate for display; real tokens run to hundreds of
        // characters and are not guaranteed ASCII
        match self.0.char_indices().nth(16) {
            Some((cut, _)) => write!(f, "{}...", &self.0[..cut]),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<String> for EndpointToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EndpointToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for EndpointToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Severity category of a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Informational update.
    #[default]
    Info,
    /// Something completed successfully.
    Success,
    /// Needs attention soon.
    Warning,
    /// Something went wrong.
    Error,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// A persisted notification row, owned by the ledger.
///
/// Created once and append-only apart from `read` and `updated_at`,
/// which flip in place when the notification is acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Ledger-assigned identifier.
    pub id: NotificationId,
    /// Target account.
    pub account: AccountId,
    /// Short headline shown in alerts and lists.
    pub title: String,
    /// Longer body text.
    pub message: String,
    /// Severity category.
    pub category: Category,
    /// Originating domain object kind (e.g. "order"), if any.
    pub source: Option<String>,
    /// Identifier of the originating domain object, if any.
    pub source_id: Option<i64>,
    /// Whether the account has acknowledged this notification.
    pub read: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A device's registered push delivery endpoint.
///
/// One account holds many endpoints (one per signed-in device). The pair
/// (account, token) is the identity; re-registering only refreshes
/// `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    /// Owning account.
    pub account: AccountId,
    /// Platform-issued delivery address.
    pub token: EndpointToken,
    /// Last registration time.
    pub updated_at: DateTime<Utc>,
}

/// Content half of a notification, supplied by producers.
///
/// The target account is passed separately so the same draft can be
/// published to many accounts at once.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    /// Short headline.
    pub title: String,
    /// Longer body text.
    pub message: String,
    /// Severity category (defaults to [`Category::Info`]).
    pub category: Category,
    /// Originating domain object kind, if any.
    pub source: Option<String>,
    /// Identifier of the originating domain object, if any.
    pub source_id: Option<i64>,
}

impl NotificationDraft {
    /// Creates a draft with the default `Info` category and no source.
    #[must_use]
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            category: Category::default(),
            source: None,
            source_id: None,
        }
    }

    /// Sets the severity category.
    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Sets the originating domain object.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>, source_id: i64) -> Self {
        self.source = Some(source.into());
        self.source_id = Some(source_id);
        self
    }
}

/// Filters and pagination for ledger listings.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only return unacknowledged rows.
    pub only_unread: bool,
    /// Page size; the ledger applies a default when absent.
    pub limit: Option<usize>,
    /// Rows to skip (newest-first ordering).
    pub offset: Option<usize>,
}

/// Per-endpoint failure classification for a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// The gateway no longer recognizes the endpoint token.
    InvalidEndpoint,
    /// The gateway rejected the bearer token at send time.
    Unauthorized,
    /// Network failure, timeout, throttling or server error; the whole
    /// dispatch may be retried later by the caller.
    Transient,
    /// Anything the gateway reported that fits no other bucket.
    Unknown,
}

impl std::fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::InvalidEndpoint => "invalid endpoint",
            Self::Unauthorized => "unauthorized",
            Self::Transient => "transient",
            Self::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// Result of one endpoint's send within a dispatch call.
///
/// Transient: returned to the caller, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// The endpoint this outcome describes.
    pub endpoint: EndpointToken,
    /// Whether the gateway accepted the send.
    pub success: bool,
    /// Failure classification when `success` is false.
    pub error: Option<DispatchErrorKind>,
    /// Gateway-assigned message id when `success` is true.
    pub message_id: Option<String>,
}

impl DispatchOutcome {
    /// Outcome for a send the gateway accepted.
    #[must_use]
    pub fn delivered(endpoint: EndpointToken, message_id: String) -> Self {
        Self {
            endpoint,
            success: true,
            error: None,
            message_id: Some(message_id),
        }
    }

    /// Outcome for a send the gateway rejected or that failed in transit.
    #[must_use]
    pub fn failed(endpoint: EndpointToken, kind: DispatchErrorKind) -> Self {
        Self {
            endpoint,
            success: false,
            error: Some(kind),
            message_id: None,
        }
    }
}
