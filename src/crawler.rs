//! Inbox crawl. `Crawler` classifies one provider page per call against the
//! harvest window and never touches the store; `Harvester` composes it with
//! the synchronizer and the scan archiver so a caller can drive the walk one
//! page at a time.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::feed::{FeedError, FeedItem, MailFeed, FEED_DATE_FORMAT};
use crate::objectstore::ImageArchiver;
use crate::schema::{DateRange, MailRecord};
use crate::sync::RecordSynchronizer;

/// One classified inbox page. `done` means the walk has nothing further to
/// fetch: empty page, cursor no longer advancing, or the page reached items
/// last touched before the window start (the feed is newest first).
#[derive(Debug)]
pub struct CrawlPage {
    pub records: Vec<MailRecord>,
    pub next_cursor: i64,
    pub done: bool,
}

pub struct Crawler {
    feed: Arc<dyn MailFeed>,
}

impl Crawler {
    pub fn new(feed: Arc<dyn MailFeed>) -> Self {
        Self { feed }
    }

    /// Fetch the page at `cursor` and keep the items whose assigned date
    /// falls inside `range`. The whole page is always classified, even when
    /// a mid-page item already proves the walk is done.
    pub async fn crawl_page(&self, range: &DateRange, cursor: i64) -> Result<CrawlPage, FeedError> {
        let items = self.feed.fetch_page(cursor).await?;
        if items.is_empty() {
            debug!("cursor {cursor}: empty page, crawl finished");
            return Ok(CrawlPage { records: Vec::new(), next_cursor: cursor, done: true });
        }

        let mut records = Vec::new();
        let mut done = false;
        for item in &items {
            match NaiveDate::parse_from_str(&item.assigned_date, FEED_DATE_FORMAT) {
                Ok(assigned) if range.contains(assigned) => {
                    records.push(shell_record(item, assigned));
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "mail {}: unparseable assigned date {:?}, item skipped: {e}",
                    item.mal_id, item.assigned_date
                ),
            }
            if let Ok(last_action) =
                NaiveDate::parse_from_str(&item.last_action_date, FEED_DATE_FORMAT)
            {
                if last_action < range.start {
                    done = true;
                }
            }
        }

        let next_cursor = items.last().map(|item| item.timestamp).unwrap_or(cursor);
        if next_cursor == cursor {
            debug!("cursor {cursor}: not advancing, crawl finished");
            done = true;
        }

        debug!(
            "cursor {cursor}: {} items, {} in window, next cursor {next_cursor}, done {done}",
            items.len(),
            records.len()
        );
        Ok(CrawlPage { records, next_cursor, done })
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    NaiveDateTime::new(date, NaiveTime::MIN).and_utc()
}

/// Harvest-time shell of a record: provider fields carried over, extraction
/// fields untouched. Dates the feed serves malformed fall back rather than
/// dropping the item once its assigned date put it in the window.
fn shell_record(item: &FeedItem, assigned: NaiveDate) -> MailRecord {
    let assigned_at = midnight_utc(assigned);
    let creation = NaiveDate::parse_from_str(&item.creation_date, FEED_DATE_FORMAT)
        .map(midnight_utc)
        .unwrap_or_else(|_| Utc::now());
    let last_action = NaiveDate::parse_from_str(&item.last_action_date, FEED_DATE_FORMAT)
        .map(midnight_utc)
        .unwrap_or(assigned_at);

    MailRecord {
        id: item.mal_id,
        raw_message: item.message.clone(),
        image_reference: item.image_url.clone(),
        creation_date: creation,
        assigned_date: assigned_at,
        last_action_date: last_action,
        extracted: None,
        is_valid: None,
        reason: None,
        is_shredded: false,
    }
}

/// What one harvested page amounted to, as reported to the caller driving
/// the walk. `records` carries the synced rows, locators already rewritten
/// where archival succeeded.
#[derive(Debug, Serialize)]
pub struct HarvestOutcome {
    pub records: Vec<MailRecord>,
    pub synced: usize,
    pub failed: usize,
    pub next_cursor: i64,
    pub done: bool,
}

pub struct Harvester {
    crawler: Crawler,
    synchronizer: Arc<RecordSynchronizer>,
    archiver: Arc<ImageArchiver>,
}

impl Harvester {
    pub fn new(
        crawler: Crawler,
        synchronizer: Arc<RecordSynchronizer>,
        archiver: Arc<ImageArchiver>,
    ) -> Self {
        Self { crawler, synchronizer, archiver }
    }

    /// Crawl one page and sync every in-window record, archiving its scan.
    /// Records fail independently; one bad row never sinks the page.
    pub async fn harvest_page(
        &self,
        range: &DateRange,
        cursor: i64,
    ) -> anyhow::Result<HarvestOutcome> {
        let run = Uuid::new_v4();
        info!(
            "harvest {run}: cursor {cursor}, window {} to {}",
            range.start, range.end
        );

        let page = self.crawler.crawl_page(range, cursor).await?;
        let results = join_all(page.records.iter().cloned().map(|record| {
            let id = record.id;
            async move { self.sync_one(record).await.map_err(|e| (id, e)) }
        }))
        .await;

        let mut records = Vec::new();
        let mut failed = 0;
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err((id, e)) => {
                    warn!("harvest {run}: mail {id} failed: {e:#}");
                    failed += 1;
                }
            }
        }

        let synced = records.len();
        info!(
            "harvest {run}: {synced} synced, {failed} failed, next cursor {}, done {}",
            page.next_cursor, page.done
        );
        Ok(HarvestOutcome {
            records,
            synced,
            failed,
            next_cursor: page.next_cursor,
            done: page.done,
        })
    }

    async fn sync_one(&self, mut record: MailRecord) -> anyhow::Result<MailRecord> {
        self.synchronizer
            .upsert(&record)
            .await
            .with_context(|| format!("sync mail {}", record.id))?;

        // Archival is best effort; the provider URL stays usable until the
        // provider shreds the item.
        match self.archiver.archive(&record).await {
            Ok(locator) => {
                record.image_reference = locator;
                self.synchronizer
                    .upsert(&record)
                    .await
                    .with_context(|| format!("store archived locator for mail {}", record.id))?;
            }
            Err(e) => warn!(
                "mail {}: scan archival failed, keeping provider url: {e:#}",
                record.id
            ),
        }
        Ok(record)
    }
}
