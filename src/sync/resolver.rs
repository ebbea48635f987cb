//! Change resolver: turns a notification into concrete messages.
//!
//! Order of operations:
//! 1. Read the cursor (`CursorUninitialized` if absent)
//! 2. Advance the cursor to the notification's position, **before** reading
//!    the change log
//! 3. List change-log entries since the old position, keep added messages
//! 4. Pick messages per `SelectionPolicy`
//! 5. Fetch each one, rejecting mail without a subject or sender and mail
//!    sent by the responder itself
//!
//! Step 2 makes the cursor mean "notifications seen", not "notifications
//! processed". A crash after it never reprocesses the range, but a message
//! whose resolution fails after the cursor moved is skipped for good. Later
//! notifications only list from their own start position, so nothing
//! revisits it.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::mailbox::{ChangeLog, FetchedMessage, MessageFetcher, same_address};
use crate::pipeline::types::{Message, Notification};
use crate::sync::cursor::CursorStore;

/// Which added messages of one notification window get resolved.
///
/// `First` and `Newest` bound the cost to one fetch per notification; when
/// several messages arrive inside one window, all but one are never surfaced.
/// `All` surfaces the whole burst at the cost of one fetch per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Earliest added message in the window.
    #[default]
    First,
    /// Latest added message in the window.
    Newest,
    /// Every added message, in change-log order.
    All,
}

impl SelectionPolicy {
    /// Apply the policy to the window's added ids (oldest first).
    pub fn select(&self, added: Vec<String>) -> Vec<String> {
        match self {
            Self::First => added.into_iter().take(1).collect(),
            Self::Newest => added.into_iter().last().into_iter().collect(),
            Self::All => added,
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "newest" => Ok(Self::Newest),
            "all" => Ok(Self::All),
            other => Err(format!("expected 'first', 'newest' or 'all', got '{other}'")),
        }
    }
}

/// Resolves notifications against the change log.
pub struct ChangeResolver {
    cursor: CursorStore,
    change_log: Arc<dyn ChangeLog>,
    fetcher: Arc<dyn MessageFetcher>,
    policy: SelectionPolicy,
    /// Auto-responder address; mail from it is never resolved.
    self_address: String,
}

impl ChangeResolver {
    pub fn new(
        cursor: CursorStore,
        change_log: Arc<dyn ChangeLog>,
        fetcher: Arc<dyn MessageFetcher>,
        policy: SelectionPolicy,
        self_address: impl Into<String>,
    ) -> Self {
        Self {
            cursor,
            change_log,
            fetcher,
            policy,
            self_address: self_address.into(),
        }
    }

    /// Resolve a notification.
    ///
    /// Under `First`/`Newest` the result holds exactly one message. Under
    /// `All`, unusable messages are skipped and the call fails only when
    /// none resolved.
    pub async fn resolve(&self, notification: &Notification) -> Result<Vec<Message>, ResolveError> {
        let start = self.cursor.require().await?;

        // Advance before reading the change log; see module docs.
        self.cursor.advance(&notification.new_position).await?;

        let records = self
            .change_log
            .list_since(&start)
            .await
            .map_err(ResolveError::ChangeLog)?;

        let added: Vec<String> = records
            .into_iter()
            .flat_map(|r| r.added_message_ids)
            .collect();
        let window = added.len();

        let selected = self.policy.select(added);
        if selected.is_empty() {
            return Err(ResolveError::NoNewMessage { from: start });
        }
        if window > selected.len() {
            info!(
                notification = %notification.notification_id,
                window,
                selected = selected.len(),
                policy = ?self.policy,
                "Change-log window holds more messages than the policy surfaces"
            );
        }

        let mut messages = Vec::with_capacity(selected.len());
        let mut first_error = None;
        for message_id in selected {
            match self.fetch(&message_id).await {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(id = %message_id, error = %e, "Skipping unresolvable message");
                    first_error.get_or_insert(e);
                }
            }
        }

        match (messages.is_empty(), first_error) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(ResolveError::NoNewMessage { from: start }),
            _ => {
                debug!(
                    notification = %notification.notification_id,
                    count = messages.len(),
                    "Notification resolved"
                );
                Ok(messages)
            }
        }
    }

    /// Fetch one message and validate it.
    async fn fetch(&self, message_id: &str) -> Result<Message, ResolveError> {
        let fetched = self
            .fetcher
            .get(message_id)
            .await
            .map_err(|source| ResolveError::Fetch {
                message_id: message_id.to_string(),
                source,
            })?;
        self.validate(fetched)
    }

    fn validate(&self, fetched: FetchedMessage) -> Result<Message, ResolveError> {
        let subject = match fetched.subject {
            Some(s) if !s.trim().is_empty() => s,
            _ => {
                return Err(ResolveError::NoSubject {
                    message_id: fetched.message_id,
                });
            }
        };

        let sender = match fetched.sender {
            Some(s) if !s.trim().is_empty() => s,
            _ => {
                return Err(ResolveError::NoSender {
                    message_id: fetched.message_id,
                });
            }
        };
        if same_address(&sender, &self.self_address) {
            return Err(ResolveError::SelfOriginated {
                message_id: fetched.message_id,
                sender,
            });
        }

        Ok(Message {
            message_id: fetched.message_id,
            thread_id: fetched.thread_id,
            subject,
            sender,
            snippet: fetched.snippet,
            labels: fetched.labels,
        })
    }
}
