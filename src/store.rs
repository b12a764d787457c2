//! Durable record store. The pipeline talks to the `MailStore` trait; the
//! shipped implementation is a PostgREST-style REST table keyed by the
//! provider mail id.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::retry::Retryable;
use crate::schema::MailRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store rate limited: {0}")]
    RateLimited(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store rejected request: {0}")]
    Rejected(String),
    #[error("record store response decode failed: {0}")]
    Decode(String),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::RateLimited(_) | StoreError::Unavailable(_))
    }
}

/// One page of a filtered scan. `next_offset` is `None` once the scan is
/// exhausted.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub records: Vec<MailRecord>,
    pub next_offset: Option<u64>,
}

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<MailRecord>, StoreError>;
    async fn put(&self, record: &MailRecord) -> Result<(), StoreError>;
    async fn update(&self, record: &MailRecord) -> Result<(), StoreError>;
    /// Validated, non-shredded records in id order, `limit` rows starting at
    /// `offset`.
    async fn scan_dispatchable(&self, offset: u64, limit: u64) -> Result<ScanPage, StoreError>;
}

/// REST table client (`/rest/v1/mail_records`).
#[derive(Clone)]
pub struct RestMailStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl RestMailStore {
    pub fn new(client: Client, base_url: String, service_key: String) -> Self {
        Self { client, base_url, service_key }
    }

    fn table_url(&self, query: &str) -> String {
        format!("{}/rest/v1/mail_records{}", self.base_url, query)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn fetch_rows(&self, operation: &str, query: &str) -> Result<Vec<MailRecord>, StoreError> {
        let resp = self
            .authed(self.client.get(self.table_url(query)))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{operation}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(operation, status, &text));
        }

        resp.json()
            .await
            .map_err(|e| StoreError::Decode(format!("{operation}: {e}")))
    }

    async fn write(
        &self,
        operation: &str,
        builder: reqwest::RequestBuilder,
        record: &MailRecord,
    ) -> Result<(), StoreError> {
        let resp = self
            .authed(builder)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{operation} mail {}: {e}", record.id)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(
                &format!("{operation} mail {}", record.id),
                status,
                &text,
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl MailStore for RestMailStore {
    async fn get(&self, id: i64) -> Result<Option<MailRecord>, StoreError> {
        let rows = self
            .fetch_rows("get mail record", &format!("?id=eq.{id}&limit=1"))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn put(&self, record: &MailRecord) -> Result<(), StoreError> {
        self.write("create", self.client.post(self.table_url("")), record)
            .await
    }

    async fn update(&self, record: &MailRecord) -> Result<(), StoreError> {
        self.write(
            "update",
            self.client
                .patch(self.table_url(&format!("?id=eq.{}", record.id))),
            record,
        )
        .await
    }

    async fn scan_dispatchable(&self, offset: u64, limit: u64) -> Result<ScanPage, StoreError> {
        let records = self
            .fetch_rows(
                "scan dispatchable records",
                &format!(
                    "?is_valid=eq.true&is_shredded=eq.false&order=id.asc&limit={limit}&offset={offset}"
                ),
            )
            .await?;
        let next_offset = if records.len() as u64 == limit {
            Some(offset + limit)
        } else {
            None
        };
        Ok(ScanPage { records, next_offset })
    }
}

fn classify_status(operation: &str, status: StatusCode, body: &str) -> StoreError {
    let detail = format!("{operation}: {status} - {body}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::RateLimited(detail)
    } else if status.is_server_error() {
        StoreError::Unavailable(detail)
    } else {
        StoreError::Rejected(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_and_outages_are_transient() {
        assert!(classify_status("op", StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(classify_status("op", StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status("op", StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        assert!(!classify_status("op", StatusCode::CONFLICT, "duplicate key").is_transient());
        assert!(!classify_status("op", StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!StoreError::Decode("bad json".into()).is_transient());
    }
}
