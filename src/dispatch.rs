//! Push dispatch: fan one notification out to an account's devices.
//!
//! The engine resolves the account's registered endpoints, acquires one
//! bearer token for the whole call, then issues one independent send
//! per endpoint with a bounded number in flight. Partial failure is the
//! normal case: every endpoint gets its own outcome, and one bad token
//! never suppresses delivery to its siblings.
//!
//! Retry policy belongs to the caller. The engine's only reactions to
//! failure are housekeeping: endpoints the gateway no longer recognizes
//! are dropped from the registry, and an unauthorized rejection
//! invalidates the cached bearer token for the next call.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::constants::MAX_IN_FLIGHT_SENDS;
use crate::gateway::{CredentialError, CredentialProvider, PushGateway};
use crate::ledger::LedgerError;
use crate::registry::EndpointRegistry;
use crate::types::{AccountId, DispatchErrorKind, DispatchOutcome};

/// Errors that stop a dispatch before any send goes out.
///
/// Per-endpoint failures never surface here; they come back inside
/// [`DispatchReport::Sent`].
#[derive(Debug)]
pub enum DispatchError {
    /// Push delivery is not configured on this center.
    Disabled,
    /// No bearer token could be acquired.
    Credential(CredentialError),
    /// The endpoint registry could not be read.
    Registry(LedgerError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "Dispatch aborted: no push gateway configured"),
            Self::Credential(e) => write!(f, "Dispatch aborted: {e}"),
            Self::Registry(e) => write!(f, "Dispatch aborted: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<CredentialError> for DispatchError {
    fn from(e: CredentialError) -> Self {
        Self::Credential(e)
    }
}

impl From<LedgerError> for DispatchError {
    fn from(e: LedgerError) -> Self {
        Self::Registry(e)
    }
}

/// What a dispatch call did.
#[derive(Debug)]
pub enum DispatchReport {
    /// The account has no registered endpoints; nothing was sent.
    NoRecipients,
    /// One outcome per endpoint, in registry order.
    Sent(Vec<DispatchOutcome>),
}

impl DispatchReport {
    /// Per-endpoint outcomes; empty when there were no recipients.
    #[must_use]
    pub fn outcomes(&self) -> &[DispatchOutcome] {
        match self {
            Self::NoRecipients => &[],
            Self::Sent(outcomes) => outcomes,
        }
    }

    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.outcomes().iter().filter(|o| o.success).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes().iter().filter(|o| !o.success).count()
    }
}

/// Fans notifications out to every endpoint of a target account.
pub struct DispatchEngine {
    registry: Arc<EndpointRegistry>,
    credentials: Arc<CredentialProvider>,
    gateway: Arc<PushGateway>,
    limiter: Arc<Semaphore>,
}

impl DispatchEngine {
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        credentials: Arc<CredentialProvider>,
        gateway: Arc<PushGateway>,
    ) -> Self {
        Self {
            registry,
            credentials,
            gateway,
            limiter: Arc::new(Semaphore::new(MAX_IN_FLIGHT_SENDS)),
        }
    }

    /// Sends `title`/`body` (plus a data payload) to every device
    /// endpoint registered for `account`.
    ///
    /// Returns [`DispatchReport::NoRecipients`] when the account has no
    /// endpoints, otherwise one [`DispatchOutcome`] per endpoint in
    /// registry order. Errors only for pre-send preconditions: registry
    /// read failure or bearer-token acquisition failure.
    pub async fn dispatch(
        &self,
        account: &AccountId,
        title: &str,
        body: &str,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<DispatchReport, DispatchError> {
        let endpoints = self.registry.endpoints(account).await?;
        if endpoints.is_empty() {
            log::debug!("[Dispatch] No endpoints registered for account {account}");
            return Ok(DispatchReport::NoRecipients);
        }

        // One token per call, shared across the fan-out
        let bearer = self.credentials.bearer_token().await?;

        let dispatch_id = Uuid::new_v4();
        log::info!(
            "[Dispatch] {dispatch_id}: sending \"{title}\" to {} endpoint(s) of account {account}",
            endpoints.len()
        );

        let sends = endpoints.into_iter().map(|endpoint| {
            let limiter = Arc::clone(&self.limiter);
            let gateway = Arc::clone(&self.gateway);
            let bearer = bearer.clone();
            async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .expect("send limiter never closed");
                match gateway
                    .send(&bearer, &endpoint.token, title, body, data)
                    .await
                {
                    Ok(message_id) => DispatchOutcome::delivered(endpoint.token, message_id),
                    Err(e) => {
                        log::warn!(
                            "[Dispatch] {dispatch_id}: endpoint {} failed: {e}",
                            endpoint.token
                        );
                        DispatchOutcome::failed(endpoint.token, e.kind)
                    }
                }
            }
        });
        // join_all keeps outcome order aligned with registry order
        let outcomes = join_all(sends).await;

        self.absorb_failures(account, dispatch_id, &outcomes).await;

        log::info!(
            "[Dispatch] {dispatch_id}: {}/{} delivered",
            outcomes.iter().filter(|o| o.success).count(),
            outcomes.len()
        );
        Ok(DispatchReport::Sent(outcomes))
    }

    /// Post-send housekeeping: prune endpoints the gateway disowned and
    /// drop the cached bearer token if it was rejected at send time.
    async fn absorb_failures(
        &self,
        account: &AccountId,
        dispatch_id: Uuid,
        outcomes: &[DispatchOutcome],
    ) {
        let mut saw_unauthorized = false;
        for outcome in outcomes {
            match outcome.error {
                Some(DispatchErrorKind::InvalidEndpoint) => {
                    log::info!(
                        "[Dispatch] {dispatch_id}: dropping stale endpoint {}",
                        outcome.endpoint
                    );
                    if let Err(e) = self.registry.remove(account, &outcome.endpoint).await {
                        log::warn!(
                            "[Dispatch] {dispatch_id}: could not drop endpoint {}: {e}",
                            outcome.endpoint
                        );
                    }
                }
                Some(DispatchErrorKind::Unauthorized) => saw_unauthorized = true,
                _ => {}
            }
        }

        if saw_unauthorized {
            self.credentials.invalidate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointToken;

    fn outcome_set() -> Vec<DispatchOutcome> {
        vec![
            DispatchOutcome::failed(
                EndpointToken::from("tokA"),
                DispatchErrorKind::InvalidEndpoint,
            ),
            DispatchOutcome::delivered(
                EndpointToken::from("tokB"),
                "projects/p/messages/1".to_string(),
            ),
        ]
    }

    #[test]
    fn test_report_counts() {
        let report = DispatchReport::Sent(outcome_set());
        assert_eq!(report.outcomes().len(), 2);
        assert_eq!(report.delivered_count(), 1);
        assert_eq!(report.failed_count(), 1);

        let empty = DispatchReport::NoRecipients;
        assert!(empty.outcomes().is_empty());
        assert_eq!(empty.delivered_count(), 0);
    }

    #[test]
    fn test_precondition_errors_wrap_their_sources() {
        let err: DispatchError = CredentialError::Exchange("offline".to_string()).into();
        assert!(matches!(err, DispatchError::Credential(_)));
        assert!(err.to_string().contains("offline"));

        let err: DispatchError = LedgerError::Query("timeout".to_string()).into();
        assert!(matches!(err, DispatchError::Registry(_)));
    }
}
