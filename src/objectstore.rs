//! Object storage for archived scans. Locators are `obj://bucket/key`; the
//! archived key embeds the provider mail id (`card_{id}.jpg`) so later
//! pipeline stages can recover the id from the locator alone.

use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use tracing::info;

use crate::feed::MailFeed;
use crate::schema::MailRecord;

pub fn join_locator(bucket: &str, key: &str) -> String {
    format!("obj://{bucket}/{key}")
}

/// Split an `obj://bucket/key` locator into bucket and key.
pub fn split_locator(locator: &str) -> Result<(String, String)> {
    let rest = locator
        .strip_prefix("obj://")
        .ok_or_else(|| anyhow!("locator {locator:?} does not start with obj://"))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| anyhow!("locator {locator:?} has no key part"))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(anyhow!("locator {locator:?} has an empty bucket or key"));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Provider mail id embedded in a scan locator (`.../card_{id}.jpg`).
pub fn mail_id_from_locator(locator: &str) -> Option<i64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"card_(\d+)\.\w+$").expect("card id pattern is valid")
    });
    pattern
        .captures(locator)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn archive_key(assigned_date: DateTime<Utc>, mail_id: i64) -> String {
    format!(
        "images/{}/card_{mail_id}.jpg",
        assigned_date.format("%Y-%m-%d")
    )
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch_bytes(&self, locator: &str) -> Result<Vec<u8>>;
    /// Store `bytes` under `locator`, returning the locator of the stored
    /// object (replacing any previous content).
    async fn put_bytes(&self, locator: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Storage REST API client (`/storage/v1/object/{bucket}/{key}`).
#[derive(Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl HttpObjectStore {
    pub fn new(client: Client, base_url: String, service_key: String) -> Self {
        Self { client, base_url, service_key }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/{bucket}/{key}", self.base_url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch_bytes(&self, locator: &str) -> Result<Vec<u8>> {
        let (bucket, key) = split_locator(locator)?;
        let resp = self
            .client
            .get(self.object_url(&bucket, &key))
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .with_context(|| format!("fetch object {locator}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("fetch object {locator} failed: {status} - {text}");
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("read object body {locator}"))?;
        Ok(bytes.to_vec())
    }

    async fn put_bytes(&self, locator: &str, bytes: Vec<u8>) -> Result<String> {
        let (bucket, key) = split_locator(locator)?;
        let content_type = if key.ends_with(".jpg") || key.ends_with(".jpeg") {
            "image/jpeg"
        } else {
            "application/octet-stream"
        };

        let resp = self
            .client
            .post(self.object_url(&bucket, &key))
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("store object {locator}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("store object {locator} failed: {status} - {text}");
        }

        Ok(locator.to_string())
    }
}

/// Copies the full-size scan of a harvested record from the provider into
/// object storage. The record keeps its provider URL if archival fails;
/// extraction can still fall back to it.
pub struct ImageArchiver {
    feed: Arc<dyn MailFeed>,
    objects: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ImageArchiver {
    pub fn new(feed: Arc<dyn MailFeed>, objects: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { feed, objects, bucket }
    }

    /// Download the scan and store it, returning the archived locator.
    pub async fn archive(&self, record: &MailRecord) -> Result<String> {
        let bytes = self
            .feed
            .fetch_image(record.id)
            .await
            .with_context(|| format!("download scan for mail {}", record.id))?;
        let locator = join_locator(&self.bucket, &archive_key(record.assigned_date, record.id));
        let stored = self.objects.put_bytes(&locator, bytes).await?;
        info!("mail {}: scan archived at {stored}", record.id);
        Ok(stored)
    }
}
