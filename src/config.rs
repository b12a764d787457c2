//! Process configuration, read once at startup. A missing required value
//! aborts startup instead of surfacing somewhere mid-pipeline.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::model;
use crate::retry::RetryPolicy;
use crate::validate::ValidationRules;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub feed_base_url: String,
    pub feed_session_token: String,
    pub store_url: String,
    pub store_service_key: String,
    pub storage_bucket: String,
    pub openrouter_api_key: String,
    pub extraction_model: String,
    pub mistral_api_key: String,
    pub consumer_api_url: String,
    pub consumer_api_token: String,
    pub rules: ValidationRules,
    pub dispatch_chunk_size: usize,
    pub retry: RetryPolicy,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} has an unusable value: {raw:?}")),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut rules = ValidationRules::default();
        if let Some(statement) = optional("CANONICAL_STATEMENT") {
            rules.canonical_statement = statement;
        }

        Ok(Self {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            feed_base_url: required("FEED_BASE_URL")?,
            feed_session_token: required("FEED_SESSION_TOKEN")?,
            store_url: required("STORE_URL")?,
            store_service_key: required("STORE_SERVICE_KEY")?,
            storage_bucket: optional("STORAGE_BUCKET").unwrap_or_else(|| "scans".to_string()),
            openrouter_api_key: required("OPENROUTER_API_KEY")?,
            extraction_model: optional("EXTRACTION_MODEL")
                .unwrap_or_else(|| model::DEFAULT_MODEL.to_string()),
            mistral_api_key: required("MISTRAL_API_KEY")?,
            consumer_api_url: required("CONSUMER_API_URL")?,
            consumer_api_token: required("CONSUMER_API_TOKEN")?,
            rules,
            dispatch_chunk_size: parsed("DISPATCH_CHUNK_SIZE", 1000)?,
            retry: RetryPolicy::new(
                parsed("RETRY_MAX_ATTEMPTS", 3)?,
                Duration::from_millis(parsed("RETRY_BASE_DELAY_MS", 1000)?),
            ),
        })
    }
}
