//! Terminal pipeline step: flag dispatched records as shredded in the store,
//! then ask the provider to destroy the physical items.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::feed::MailFeed;
use crate::sync::RecordSynchronizer;

pub struct Completer {
    synchronizer: Arc<RecordSynchronizer>,
    feed: Arc<dyn MailFeed>,
}

impl Completer {
    pub fn new(synchronizer: Arc<RecordSynchronizer>, feed: Arc<dyn MailFeed>) -> Self {
        Self { synchronizer, feed }
    }

    /// Mark every given record shredded, then request the physical shred.
    /// Returns how many records were marked; the provider-side shred is best
    /// effort and never unwinds the store flags.
    pub async fn complete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let results = join_all(ids.iter().map(|&id| async move {
            match self.mark_shredded(id).await {
                Ok(marked) => marked,
                Err(e) => {
                    warn!("mail {id}: completion failed: {e:#}");
                    false
                }
            }
        }))
        .await;
        let marked = results.iter().filter(|ok| **ok).count();

        match self.feed.shred(ids).await {
            Ok(true) => info!("provider accepted shred for {} items", ids.len()),
            Ok(false) => warn!("provider declined to shred {} items", ids.len()),
            Err(e) => warn!("shred request failed: {e:#}"),
        }

        Ok(marked)
    }

    async fn mark_shredded(&self, id: i64) -> Result<bool> {
        let Some(mut record) = self.synchronizer.get(id).await? else {
            warn!("mail {id}: not in store, nothing to complete");
            return Ok(false);
        };
        record.is_shredded = true;
        self.synchronizer.upsert(&record).await?;
        Ok(true)
    }
}
