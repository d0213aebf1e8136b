//! Ledger backed by the hosted relational API.
//!
//! Speaks the PostgREST dialect: filters are query parameters like
//! `account=eq.acct-1`, writes ask for `return=representation` so the
//! affected rows come back in the response, and unread counts ride in
//! the `Content-Range` header of a HEAD request.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;

use crate::constants::{DEFAULT_LIST_LIMIT, LEDGER_REQUEST_TIMEOUT};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{
    AccountId, DeviceEndpoint, EndpointToken, ListQuery, NotificationDraft, NotificationId,
    NotificationRecord,
};

const NOTIFICATIONS_PATH: &str = "/rest/v1/notifications";
const ENDPOINTS_PATH: &str = "/rest/v1/device_endpoints";

/// HTTP client for the hosted notification tables.
pub struct RestLedger {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestLedger {
    /// Builds a ledger client with the standard request timeout applied.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LEDGER_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build ledger HTTP client")?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    /// Builds a ledger around an existing HTTP client (used by tests).
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn insert_row(account: &AccountId, draft: &NotificationDraft) -> serde_json::Value {
        serde_json::json!({
            "account": account,
            "title": draft.title,
            "message": draft.message,
            "category": draft.category,
            "source": draft.source,
            "source_id": draft.source_id,
            "read": false,
        })
    }
}

/// Sends a request and rejects non-2xx answers, wrapping failures with
/// the supplied error constructor.
async fn checked(
    request: reqwest::RequestBuilder,
    op: &'static str,
    wrap: fn(String) -> LedgerError,
) -> Result<reqwest::Response, LedgerError> {
    let response = request
        .send()
        .await
        .map_err(|e| wrap(format!("{op}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(wrap(format!("{op} returned {status}: {body}")));
    }
    Ok(response)
}

async fn decode_rows(
    response: reqwest::Response,
    op: &'static str,
) -> Result<Vec<NotificationRecord>, LedgerError> {
    response
        .json::<Vec<NotificationRecord>>()
        .await
        .map_err(|e| LedgerError::MalformedResponse(format!("{op}: {e}")))
}

#[async_trait]
impl Ledger for RestLedger {
    async fn insert(
        &self,
        account: &AccountId,
        draft: &NotificationDraft,
    ) -> Result<NotificationRecord, LedgerError> {
        let response = checked(
            self.request(Method::POST, NOTIFICATIONS_PATH)
                .header("Prefer", "return=representation")
                .json(&Self::insert_row(account, draft)),
            "insert notification",
            LedgerError::Write,
        )
        .await?;

        let mut rows = decode_rows(response, "insert notification").await?;
        rows.pop().ok_or_else(|| {
            LedgerError::MalformedResponse("insert returned no rows".to_string())
        })
    }

    async fn insert_many(
        &self,
        accounts: &[AccountId],
        draft: &NotificationDraft,
    ) -> Result<Vec<NotificationRecord>, LedgerError> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }
        let body: Vec<serde_json::Value> = accounts
            .iter()
            .map(|account| Self::insert_row(account, draft))
            .collect();

        let response = checked(
            self.request(Method::POST, NOTIFICATIONS_PATH)
                .header("Prefer", "return=representation")
                .json(&body),
            "insert notifications",
            LedgerError::Write,
        )
        .await?;

        decode_rows(response, "insert notifications").await
    }

    async fn list(
        &self,
        account: &AccountId,
        query: &ListQuery,
    ) -> Result<Vec<NotificationRecord>, LedgerError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let offset = query.offset.unwrap_or(0);
        let mut request = self.request(Method::GET, NOTIFICATIONS_PATH).query(&[
            ("account", format!("eq.{account}")),
            ("order", "created_at.desc,id.desc".to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]);
        if query.only_unread {
            request = request.query(&[("read", "eq.false")]);
        }

        let response = checked(request, "list notifications", LedgerError::Query).await?;
        decode_rows(response, "list notifications").await
    }

    async fn count_unread(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let response = checked(
            self.request(Method::HEAD, NOTIFICATIONS_PATH)
                .query(&[
                    ("account", format!("eq.{account}")),
                    ("read", "eq.false".to_string()),
                    ("select", "id".to_string()),
                ])
                .header("Prefer", "count=exact"),
            "count unread",
            LedgerError::Query,
        )
        .await?;

        // Content-Range looks like "0-24/57"; the total sits after the slash.
        let range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                LedgerError::MalformedResponse("count response missing Content-Range".to_string())
            })?;
        range
            .rsplit('/')
            .next()
            .and_then(|total| total.parse::<u64>().ok())
            .ok_or_else(|| {
                LedgerError::MalformedResponse(format!("unparseable Content-Range: {range}"))
            })
    }

    async fn mark_read(&self, id: NotificationId) -> Result<bool, LedgerError> {
        // Filtering on read=eq.false makes the update a compare-and-set:
        // an already read row matches nothing and comes back empty.
        let response = checked(
            self.request(Method::PATCH, NOTIFICATIONS_PATH)
                .query(&[
                    ("id", format!("eq.{id}")),
                    ("read", "eq.false".to_string()),
                ])
                .header("Prefer", "return=representation")
                .json(&serde_json::json!({ "read": true, "updated_at": Utc::now() })),
            "mark read",
            LedgerError::Write,
        )
        .await?;

        let rows = decode_rows(response, "mark read").await?;
        Ok(!rows.is_empty())
    }

    async fn mark_all_read(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let response = checked(
            self.request(Method::PATCH, NOTIFICATIONS_PATH)
                .query(&[
                    ("account", format!("eq.{account}")),
                    ("read", "eq.false".to_string()),
                ])
                .header("Prefer", "return=representation")
                .json(&serde_json::json!({ "read": true, "updated_at": Utc::now() })),
            "mark all read",
            LedgerError::Write,
        )
        .await?;

        let rows = decode_rows(response, "mark all read").await?;
        Ok(rows.len() as u64)
    }

    async fn upsert_endpoint(&self, endpoint: DeviceEndpoint) -> Result<(), LedgerError> {
        checked(
            self.request(Method::POST, ENDPOINTS_PATH)
                .query(&[("on_conflict", "account,token")])
                .header("Prefer", "resolution=merge-duplicates")
                .json(&endpoint),
            "upsert endpoint",
            LedgerError::Write,
        )
        .await?;
        Ok(())
    }

    async fn endpoints(&self, account: &AccountId) -> Result<Vec<DeviceEndpoint>, LedgerError> {
        let response = checked(
            self.request(Method::GET, ENDPOINTS_PATH)
                .query(&[("account", format!("eq.{account}"))]),
            "list endpoints",
            LedgerError::Query,
        )
        .await?;

        response
            .json::<Vec<DeviceEndpoint>>()
            .await
            .map_err(|e| LedgerError::MalformedResponse(format!("list endpoints: {e}")))
    }

    async fn remove_endpoint(
        &self,
        account: &AccountId,
        token: &EndpointToken,
    ) -> Result<(), LedgerError> {
        checked(
            self.request(Method::DELETE, ENDPOINTS_PATH).query(&[
                ("account", format!("eq.{account}")),
                ("token", format!("eq.{token}")),
            ]),
            "remove endpoint",
            LedgerError::Write,
        )
        .await?;
        Ok(())
    }
}
