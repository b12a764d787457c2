//! Mailbox provider client. The provider exposes a session-authenticated
//! AJAX inbox: a form POST returns one page of mail items ordered newest
//! first, keyed by a provider-issued `timestamp` token that doubles as the
//! pagination cursor.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

/// Assigned/last-action dates in feed items are plain text in this format.
pub const FEED_DATE_FORMAT: &str = "%m/%d/%Y";

/// Provider status code for "shred the physical item".
const SHRED_STATUS: &str = "81";

const SESSION_COOKIE: &str = "ASP.NET_SessionId";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("mailbox session invalid or expired: {0}")]
    Session(String),
    #[error("mailbox feed request failed: {0}")]
    Request(String),
    #[error("mailbox feed returned malformed payload: {0}")]
    Payload(String),
}

/// An authenticated session, held as the cookie token the provider issued.
#[derive(Debug, Clone)]
pub struct SessionCredential {
    pub token: String,
}

impl SessionCredential {
    fn cookie(&self) -> String {
        format!("{SESSION_COOKIE}={}", self.token)
    }
}

/// Source of session credentials. Browser login and CAPTCHA solving happen
/// outside this service; whatever performs them supplies the token.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self) -> Result<SessionCredential, FeedError>;
}

/// Session provider backed by a pre-acquired token from configuration.
pub struct StaticSessionProvider {
    token: String,
}

impl StaticSessionProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn acquire(&self) -> Result<SessionCredential, FeedError> {
        if self.token.trim().is_empty() {
            return Err(FeedError::Session("no session token configured".into()));
        }
        Ok(SessionCredential { token: self.token.clone() })
    }
}

/// One inbox item as the provider serves it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub mal_id: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub creation_date: String,
    pub assigned_date: String,
    pub last_action_date: String,
    /// Ordering token; the last item's value is the next page's cursor.
    #[serde(deserialize_with = "number_or_string")]
    pub timestamp: i64,
}

// The provider serves `timestamp` sometimes as a number, sometimes quoted.
fn number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct InboxResponse {
    #[serde(default)]
    mail: InboxMail,
}

#[derive(Debug, Default, Deserialize)]
struct InboxMail {
    #[serde(default)]
    items: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default)]
    success: bool,
}

#[async_trait]
pub trait MailFeed: Send + Sync {
    /// One inbox page starting at `cursor` (0 = newest).
    async fn fetch_page(&self, cursor: i64) -> Result<Vec<FeedItem>, FeedError>;
    /// Full-size scan of one mail item.
    async fn fetch_image(&self, mail_id: i64) -> Result<Vec<u8>, FeedError>;
    /// Ask the provider to shred the physical items. `Ok(false)` means the
    /// provider declined (e.g. items still pending), not a transport error.
    async fn shred(&self, mail_ids: &[i64]) -> Result<bool, FeedError>;
}

pub struct HttpMailFeed {
    client: Client,
    base_url: String,
    session: SessionCredential,
}

impl HttpMailFeed {
    pub fn new(client: Client, base_url: String, session: SessionCredential) -> Self {
        Self { client, base_url, session }
    }

    fn prepared(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("accept", "application/json")
            .header("user-agent", USER_AGENT)
            .header("cookie", self.session.cookie())
    }

    async fn ensure_success(&self, operation: &str, resp: Response) -> Result<Response, FeedError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FeedError::Session(format!("{operation}: {status} - {text}")));
        }
        Err(FeedError::Request(format!("{operation}: {status} - {text}")))
    }

    async fn post_action(&self, operation: &str, path: &str, form: &[(&str, String)]) -> Result<bool, FeedError> {
        let resp = self
            .prepared(self.client.post(format!("{}{path}", self.base_url)))
            .form(form)
            .send()
            .await
            .map_err(|e| FeedError::Request(format!("{operation}: {e}")))?;
        let resp = self.ensure_success(operation, resp).await?;
        let body: ActionResponse = resp
            .json()
            .await
            .map_err(|e| FeedError::Payload(format!("{operation}: {e}")))?;
        Ok(body.success)
    }
}

#[async_trait]
impl MailFeed for HttpMailFeed {
    async fn fetch_page(&self, cursor: i64) -> Result<Vec<FeedItem>, FeedError> {
        let form = [
            ("loadMenu", "1".to_string()),
            ("refMalId", "0".to_string()),
            ("refTimestamp", cursor.to_string()),
            ("subsetMalIds", String::new()),
            ("filter", String::new()),
        ];

        let resp = self
            .prepared(self.client.post(format!("{}/app/mailbox-ajax/inbox", self.base_url)))
            .form(&form)
            .send()
            .await
            .map_err(|e| FeedError::Request(format!("inbox page at cursor {cursor}: {e}")))?;
        let resp = self.ensure_success("inbox page", resp).await?;

        let body: InboxResponse = resp
            .json()
            .await
            .map_err(|e| FeedError::Payload(format!("inbox page at cursor {cursor}: {e}")))?;
        Ok(body.mail.items)
    }

    async fn fetch_image(&self, mail_id: i64) -> Result<Vec<u8>, FeedError> {
        let url = format!("{}/imagestore/{mail_id}.s800.jpg", self.base_url);
        let resp = self
            .prepared(self.client.get(&url))
            .send()
            .await
            .map_err(|e| FeedError::Request(format!("image for mail {mail_id}: {e}")))?;
        let resp = self
            .ensure_success(&format!("image for mail {mail_id}"), resp)
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FeedError::Payload(format!("image for mail {mail_id}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn shred(&self, mail_ids: &[i64]) -> Result<bool, FeedError> {
        let joined = mail_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let confirmed = self
            .post_action(
                "shred pending check",
                "/app/mail-ajax/pendingcheck",
                &[("malids", joined.clone())],
            )
            .await?;
        if !confirmed {
            warn!("provider declined shred pending check for ids [{joined}]");
            return Ok(false);
        }

        self.post_action(
            "shred action",
            "/app/mail-ajax/action",
            &[("ids", joined), ("status", SHRED_STATUS.to_string())],
        )
        .await
    }
}
