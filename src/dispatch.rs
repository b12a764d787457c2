//! Hand-off of validated records to the downstream consumer API. Records go
//! out in fixed-size chunks; a failed chunk is reported and skipped, it never
//! aborts the chunks after it.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::schema::MailRecord;
use crate::store::{MailStore, StoreError};

/// Consumer acknowledgement for one chunk. A chunk only counts as delivered
/// when the HTTP status was 2xx and `status` is `"ok"`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReceipt {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub accepted_ids: Vec<i64>,
}

#[async_trait]
pub trait ConsumerApi: Send + Sync {
    async fn post_records(&self, records: &[MailRecord]) -> Result<ConsumerReceipt>;
}

pub struct HttpConsumerApi {
    client: Client,
    url: String,
    token: String,
}

impl HttpConsumerApi {
    pub fn new(client: Client, url: String, token: String) -> Self {
        Self { client, url, token }
    }
}

#[async_trait]
impl ConsumerApi for HttpConsumerApi {
    async fn post_records(&self, records: &[MailRecord]) -> Result<ConsumerReceipt> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&json!({ "records": records }))
            .send()
            .await
            .context("consumer request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("consumer returned {status}: {text}");
        }

        response
            .json()
            .await
            .context("consumer receipt was not valid JSON")
    }
}

#[derive(Debug, Serialize)]
pub struct DispatchReport {
    pub accepted_ids: Vec<i64>,
    pub chunks_total: usize,
    pub chunks_failed: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    NoEligibleRecords,
    Dispatched(DispatchReport),
}

/// Page size for the eligibility scan. Chunk size is operator-tunable, the
/// scan stride is not.
pub const SCAN_PAGE_SIZE: u64 = 500;

pub struct Dispatcher {
    store: Arc<dyn MailStore>,
    consumer: Arc<dyn ConsumerApi>,
    chunk_size: usize,
    scan_page_size: u64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MailStore>,
        consumer: Arc<dyn ConsumerApi>,
        chunk_size: usize,
        scan_page_size: u64,
    ) -> Self {
        Self { store, consumer, chunk_size, scan_page_size }
    }

    /// Push `records` downstream chunk by chunk, sequentially. Accepted ids
    /// come from the receipt when the consumer reports them, otherwise the
    /// chunk's own ids stand in.
    pub async fn dispatch(&self, records: &[MailRecord]) -> DispatchReport {
        let chunks: Vec<&[MailRecord]> = records.chunks(self.chunk_size.max(1)).collect();
        let chunks_total = chunks.len();
        let mut accepted_ids = Vec::new();
        let mut chunks_failed = 0;

        for (index, chunk) in chunks.into_iter().enumerate() {
            match self.consumer.post_records(chunk).await {
                Ok(receipt) if receipt.status == "ok" => {
                    if receipt.accepted_ids.is_empty() {
                        accepted_ids.extend(chunk.iter().map(|r| r.id));
                    } else {
                        accepted_ids.extend(&receipt.accepted_ids);
                    }
                    info!(
                        "dispatch chunk {}/{chunks_total}: {} records accepted",
                        index + 1,
                        chunk.len()
                    );
                }
                Ok(receipt) => {
                    warn!(
                        "dispatch chunk {}/{chunks_total}: consumer declined, status {:?}",
                        index + 1,
                        receipt.status
                    );
                    chunks_failed += 1;
                }
                Err(e) => {
                    warn!("dispatch chunk {}/{chunks_total}: {e:#}", index + 1);
                    chunks_failed += 1;
                }
            }
        }

        DispatchReport { accepted_ids, chunks_total, chunks_failed }
    }

    /// Collect every validated, not-yet-shredded record from the store and
    /// dispatch the lot.
    pub async fn dispatch_pending(&self) -> Result<DispatchOutcome, StoreError> {
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .scan_dispatchable(offset, self.scan_page_size)
                .await?;
            records.extend(page.records);
            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }

        if records.is_empty() {
            info!("dispatch: no eligible records");
            return Ok(DispatchOutcome::NoEligibleRecords);
        }

        info!("dispatch: {} eligible records", records.len());
        let report = self.dispatch(&records).await;
        Ok(DispatchOutcome::Dispatched(report))
    }
}
