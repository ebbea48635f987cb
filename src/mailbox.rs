//! Contracts the triage core needs from the mail provider.
//!
//! Adapters are pure I/O. Cursor handling, classification and idempotency
//! live in the core. Timeouts and retries are the adapter's business.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalError;

/// One change-log entry: the position it sits at and the messages it added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub position: String,
    pub added_message_ids: Vec<String>,
}

/// Raw message content as returned by the provider.
///
/// `subject` and `sender` are optional so malformed messages stay
/// distinguishable from empty ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub message_id: String,
    pub thread_id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub snippet: String,
    pub labels: BTreeSet<String>,
}

/// An automatic reply, threaded onto the message it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub from: String,
    pub to: String,
    /// Message id used for `In-Reply-To` and `References`.
    pub in_reply_to: String,
    pub thread_id: String,
    pub subject: String,
    pub body: String,
}

/// Registers push notifications for the mailbox.
#[async_trait]
pub trait WatchApi: Send + Sync {
    /// Start (or renew) the watch. Returns the current change-log position.
    async fn watch(&self) -> Result<String, ExternalError>;
}

/// Reads the mailbox change log.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Entries from `from` to now, oldest first.
    async fn list_since(&self, from: &str) -> Result<Vec<ChangeRecord>, ExternalError>;
}

/// Fetches full message content.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn get(&self, message_id: &str) -> Result<FetchedMessage, ExternalError>;
}

/// Label management. `apply_labels` must have set semantics.
#[async_trait]
pub trait LabelApi: Send + Sync {
    /// Return the id of the label with this exact name, creating it if needed.
    async fn find_or_create(&self, name: &str) -> Result<String, ExternalError>;

    async fn apply_labels(
        &self,
        message_id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), ExternalError>;
}

/// Sends outgoing mail.
#[async_trait]
pub trait SendApi: Send + Sync {
    async fn send(&self, reply: &OutgoingReply) -> Result<(), ExternalError>;
}

/// Strip an optional display name: `"Ava <ava@x.com>"` → `"ava@x.com"`.
pub fn bare_address(sender: &str) -> &str {
    let trimmed = sender.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => trimmed[start + 1..end].trim(),
        _ => trimmed,
    }
}

/// Case-insensitive address comparison, ignoring display names.
pub fn same_address(a: &str, b: &str) -> bool {
    bare_address(a).eq_ignore_ascii_case(bare_address(b))
}
