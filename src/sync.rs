//! Idempotent persistence of harvested records. Every store call runs under
//! the retry policy; whether a record is created or updated is decided by a
//! point read on the provider id, which is safe because ids come from a
//! single cursor walk per run.

use std::sync::Arc;

use tracing::debug;

use crate::retry::RetryPolicy;
use crate::schema::MailRecord;
use crate::store::{MailStore, StoreError};

#[derive(Clone)]
pub struct RecordSynchronizer {
    store: Arc<dyn MailStore>,
    retry: RetryPolicy,
}

impl RecordSynchronizer {
    pub fn new(store: Arc<dyn MailStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Create the record if its id is unseen, otherwise overwrite the stored
    /// row. Calling this twice with the same record leaves the same state as
    /// calling it once.
    pub async fn upsert(&self, record: &MailRecord) -> Result<(), StoreError> {
        let existing = self
            .retry
            .execute(&format!("load mail {}", record.id), || {
                self.store.get(record.id)
            })
            .await?;

        if existing.is_some() {
            self.retry
                .execute(&format!("update mail {}", record.id), || {
                    self.store.update(record)
                })
                .await?;
            debug!("mail {}: updated", record.id);
        } else {
            self.retry
                .execute(&format!("create mail {}", record.id), || {
                    self.store.put(record)
                })
                .await?;
            debug!("mail {}: created", record.id);
        }
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<MailRecord>, StoreError> {
        self.retry
            .execute(&format!("load mail {id}"), || self.store.get(id))
            .await
    }
}
