//! Local alert surfacing for device-resident sessions.
//!
//! Runs off the change feed, not the gateway path: a connected session
//! sees its alert even when its endpoint registration is stale or
//! missing. The actual alert mechanism lives behind [`AlertScheduler`];
//! hosts without one run the surfacer inert.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::constants::ALERT_DEFER;
use crate::types::NotificationRecord;

/// An on-device alert request handed to the platform scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAlert {
    /// Stable handle derived from the notification id, so a later
    /// replace or cancel targets the right alert.
    pub handle: i64,
    /// Alert headline.
    pub title: String,
    /// Alert body.
    pub body: String,
    /// When the alert should fire.
    pub fire_at: DateTime<Utc>,
}

/// Error reported by a platform alert scheduler.
#[derive(Debug)]
pub struct AlertError(pub String);

impl std::fmt::Display for AlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Alert scheduling failed: {}", self.0)
    }
}

impl std::error::Error for AlertError {}

/// Platform seam for scheduling on-device alerts.
#[async_trait]
pub trait AlertScheduler: Send + Sync {
    async fn schedule(&self, alert: LocalAlert) -> Result<(), AlertError>;
}

/// Surfaces qualifying notifications as local alerts.
pub struct LocalSurfacer {
    scheduler: Option<Arc<dyn AlertScheduler>>,
}

impl LocalSurfacer {
    #[must_use]
    pub fn new(scheduler: Arc<dyn AlertScheduler>) -> Self {
        Self {
            scheduler: Some(scheduler),
        }
    }

    /// A surfacer that drops everything, for hosts without local alert
    /// capability.
    #[must_use]
    pub fn inert() -> Self {
        Self { scheduler: None }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Schedules an alert for an unread notification, slightly deferred
    /// so the in-app surface settles first.
    ///
    /// Fire and forget: scheduling failures are logged and swallowed.
    /// The record stays visible in-app either way.
    pub fn maybe_surface(&self, record: &NotificationRecord) {
        let Some(scheduler) = self.scheduler.clone() else {
            return;
        };
        if record.read {
            return;
        }

        let handle = record.id;
        let alert = LocalAlert {
            handle: handle.0,
            title: record.title.clone(),
            body: record.message.clone(),
            fire_at: Utc::now() + ALERT_DEFER,
        };

        tokio::spawn(async move {
            log::debug!("[Surfacer] Scheduling local alert for notification {handle}");
            if let Err(e) = scheduler.schedule(alert).await {
                log::warn!("[Surfacer] Could not schedule alert for notification {handle}: {e}");
            }
        });
    }
}
