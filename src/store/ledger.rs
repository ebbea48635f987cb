//! Accumulation ledger: processed records and the auto-reply log.
//!
//! Both lists accumulate between digest rotations and are rotated together.
//! Read-modify-write cycles are serialized in-process; across processes the
//! store only offers last-write-wins.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::pipeline::types::ProcessedRecord;
use crate::store::traits::{StateStore, load, save};

/// Namespace holding the accumulation lists.
pub const DIGEST_NAMESPACE: &str = "digest";
/// Key of the processed-record list.
pub const PROCESSED_KEY: &str = "processed";
/// Key of the auto-reply id list.
pub const AUTO_REPLIED_KEY: &str = "auto_replied";

/// How a successful auto-reply is recorded.
///
/// `Overwrite` replaces the whole log with the single new id. That caps the
/// digest's auto-reply count at one and weakens the duplicate-reply check.
/// It stays available until the product owner confirms which behaviour is
/// wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyLogMode {
    #[default]
    Union,
    Overwrite,
}

impl FromStr for ReplyLogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "union" => Ok(Self::Union),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(format!("expected 'union' or 'overwrite', got '{other}'")),
        }
    }
}

/// Snapshot of everything accumulated since the last rotation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub processed: Vec<ProcessedRecord>,
    pub auto_replied: Vec<String>,
}

/// Typed access to the accumulation lists.
pub struct Ledger {
    store: Arc<dyn StateStore>,
    reply_mode: ReplyLogMode,
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(store: Arc<dyn StateStore>, reply_mode: ReplyLogMode) -> Self {
        if reply_mode == ReplyLogMode::Overwrite {
            warn!("Auto-reply log in overwrite mode: only the latest reply is kept");
        }
        Self {
            store,
            reply_mode,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn processed(&self) -> Result<Vec<ProcessedRecord>, StoreError> {
        Ok(load(self.store.as_ref(), DIGEST_NAMESPACE, PROCESSED_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn auto_replied(&self) -> Result<Vec<String>, StoreError> {
        Ok(load(self.store.as_ref(), DIGEST_NAMESPACE, AUTO_REPLIED_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Append a processed record. Returns `false` if the message was already
    /// recorded in this window (redelivered event).
    pub async fn append_processed(&self, record: ProcessedRecord) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.processed().await?;
        if records.iter().any(|r| r.message_id == record.message_id) {
            debug!(id = %record.message_id, "Processed record already present");
            return Ok(false);
        }
        records.push(record);
        save(self.store.as_ref(), DIGEST_NAMESPACE, PROCESSED_KEY, &records).await?;
        Ok(true)
    }

    pub async fn has_replied(&self, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.auto_replied().await?.iter().any(|id| id == message_id))
    }

    /// Record a successful auto-reply according to the configured mode.
    pub async fn record_reply(&self, message_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let ids = match self.reply_mode {
            ReplyLogMode::Union => {
                let mut ids = self.auto_replied().await?;
                if !ids.iter().any(|id| id == message_id) {
                    ids.push(message_id.to_string());
                }
                ids
            }
            ReplyLogMode::Overwrite => vec![message_id.to_string()],
        };
        save(self.store.as_ref(), DIGEST_NAMESPACE, AUTO_REPLIED_KEY, &ids).await
    }

    /// Read both lists.
    pub async fn snapshot(&self) -> Result<LedgerSnapshot, StoreError> {
        let _guard = self.write_lock.lock().await;
        Ok(LedgerSnapshot {
            processed: self.processed().await?,
            auto_replied: self.auto_replied().await?,
        })
    }

    /// Remove everything a published snapshot covered.
    ///
    /// Entries appended after the snapshot was taken stay for the next
    /// window. Processed records go first: a failure between the two writes
    /// leaves reply ids behind, which only suppresses duplicate replies.
    pub async fn rotate(&self, published: &LedgerSnapshot) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let covered: HashSet<&str> = published
            .processed
            .iter()
            .map(|r| r.message_id.as_str())
            .collect();
        let mut records = self.processed().await?;
        records.retain(|r| !covered.contains(r.message_id.as_str()));
        save(self.store.as_ref(), DIGEST_NAMESPACE, PROCESSED_KEY, &records).await?;

        let covered: HashSet<&str> = published.auto_replied.iter().map(String::as_str).collect();
        let mut ids = self.auto_replied().await?;
        ids.retain(|id| !covered.contains(id.as_str()));
        save(self.store.as_ref(), DIGEST_NAMESPACE, AUTO_REPLIED_KEY, &ids).await?;

        debug!(
            kept_processed = records.len(),
            kept_replies = ids.len(),
            "Ledger rotated"
        );
        Ok(())
    }
}
