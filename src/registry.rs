//! Device endpoint registration.
//!
//! Thin policy layer over the ledger's endpoint table. Registration is
//! an upsert keyed on (account, token), so a device re-registering on
//! every app start refreshes its row instead of duplicating it.

use std::sync::Arc;

use chrono::Utc;

use crate::ledger::{Ledger, LedgerError};
use crate::types::{AccountId, DeviceEndpoint, EndpointToken};

/// Tracks which device endpoints belong to which account.
pub struct EndpointRegistry {
    ledger: Arc<dyn Ledger>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Registers or refreshes an endpoint for an account.
    pub async fn register(
        &self,
        account: &AccountId,
        token: EndpointToken,
    ) -> Result<(), LedgerError> {
        log::debug!("[Registry] Registering endpoint {token} for account {account}");
        self.ledger
            .upsert_endpoint(DeviceEndpoint {
                account: account.clone(),
                token,
                updated_at: Utc::now(),
            })
            .await
    }

    /// All endpoints currently registered for an account.
    pub async fn endpoints(&self, account: &AccountId) -> Result<Vec<DeviceEndpoint>, LedgerError> {
        self.ledger.endpoints(account).await
    }

    /// Removes one endpoint registration.
    ///
    /// Also called by the dispatch layer when the gateway reports a
    /// token as no longer valid.
    pub async fn remove(
        &self,
        account: &AccountId,
        token: &EndpointToken,
    ) -> Result<(), LedgerError> {
        log::debug!("[Registry] Removing endpoint {token} for account {account}");
        self.ledger.remove_endpoint(account, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    #[tokio::test]
    async fn test_reregistration_refreshes_instead_of_duplicating() {
        let registry = EndpointRegistry::new(Arc::new(MemoryLedger::new()));
        let account = AccountId::from("acct-1");

        registry
            .register(&account, EndpointToken::from("tokA"))
            .await
            .unwrap();
        registry
            .register(&account, EndpointToken::from("tokA"))
            .await
            .unwrap();
        registry
            .register(&account, EndpointToken::from("tokB"))
            .await
            .unwrap();

        let endpoints = registry.endpoints(&account).await.unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_scopes_to_account() {
        let registry = EndpointRegistry::new(Arc::new(MemoryLedger::new()));
        let first = AccountId::from("acct-1");
        let second = AccountId::from("acct-2");
        let shared = EndpointToken::from("family-tablet");

        registry.register(&first, shared.clone()).await.unwrap();
        registry.register(&second, shared.clone()).await.unwrap();
        registry.remove(&first, &shared).await.unwrap();

        assert!(registry.endpoints(&first).await.unwrap().is_empty());
        assert_eq!(registry.endpoints(&second).await.unwrap().len(), 1);
    }
}
