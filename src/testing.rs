//! In-memory mailbox for tests and local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ExternalError;
use crate::mailbox::{
    ChangeLog, ChangeRecord, FetchedMessage, LabelApi, MessageFetcher, OutgoingReply, SendApi,
    WatchApi,
};

/// Provider-managed labels; their id equals their name.
const SYSTEM_LABELS: &[&str] = &["INBOX", "UNREAD", "SPAM", "TRASH"];

/// First change-log position handed out.
const INITIAL_POSITION: u64 = 1000;

#[derive(Default)]
struct State {
    position: u64,
    changes: Vec<(u64, ChangeRecord)>,
    messages: HashMap<String, FetchedMessage>,
    /// Label name → id.
    labels: BTreeMap<String, String>,
    label_lookups: usize,
    sent: Vec<OutgoingReply>,
    fail_change_log: bool,
    fail_sends: bool,
    next_id: u64,
}

/// Mailbox double implementing every provider trait.
///
/// Positions are increasing integers, labels have set semantics and outgoing
/// replies are recorded instead of sent.
pub struct FakeMailbox {
    state: Mutex<State>,
}

impl Default for FakeMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMailbox {
    pub fn new() -> Self {
        let labels = SYSTEM_LABELS
            .iter()
            .map(|name| (name.to_string(), name.to_string()))
            .collect();
        Self {
            state: Mutex::new(State {
                position: INITIAL_POSITION,
                labels,
                ..Default::default()
            }),
        }
    }

    /// Current change-log position.
    pub async fn position(&self) -> String {
        self.state.lock().await.position.to_string()
    }

    /// Add a well-formed message to the inbox. Returns its id.
    pub async fn deliver(&self, sender: &str, subject: &str, snippet: &str) -> String {
        self.deliver_raw(Some(subject), Some(sender), snippet).await
    }

    /// Add a message whose headers may be missing. Returns its id.
    pub async fn deliver_raw(
        &self,
        subject: Option<&str>,
        sender: Option<&str>,
        snippet: &str,
    ) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let message_id = format!("msg-{}", state.next_id);
        let thread_id = format!("thread-{}", state.next_id);

        state.messages.insert(
            message_id.clone(),
            FetchedMessage {
                message_id: message_id.clone(),
                thread_id,
                subject: subject.map(str::to_string),
                sender: sender.map(str::to_string),
                snippet: snippet.to_string(),
                labels: BTreeSet::from(["INBOX".to_string()]),
            },
        );

        state.position += 1;
        let position = state.position;
        state.changes.push((
            position,
            ChangeRecord {
                position: position.to_string(),
                added_message_ids: vec![message_id.clone()],
            },
        ));
        message_id
    }

    /// Make the change log fail until turned off again.
    pub async fn fail_change_log(&self, fail: bool) {
        self.state.lock().await.fail_change_log = fail;
    }

    /// Make sends fail until turned off again.
    pub async fn fail_sends(&self, fail: bool) {
        self.state.lock().await.fail_sends = fail;
    }

    /// Label names currently on a message.
    pub async fn label_names(&self, message_id: &str) -> BTreeSet<String> {
        let state = self.state.lock().await;
        let Some(message) = state.messages.get(message_id) else {
            return BTreeSet::new();
        };
        message
            .labels
            .iter()
            .map(|id| {
                state
                    .labels
                    .iter()
                    .find(|(_, label_id)| *label_id == id)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| id.clone())
            })
            .collect()
    }

    /// Number of `find_or_create` calls so far.
    pub async fn label_lookups(&self) -> usize {
        self.state.lock().await.label_lookups
    }

    /// Replies sent so far.
    pub async fn sent(&self) -> Vec<OutgoingReply> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl WatchApi for FakeMailbox {
    async fn watch(&self) -> Result<String, ExternalError> {
        Ok(self.position().await)
    }
}

#[async_trait]
impl ChangeLog for FakeMailbox {
    async fn list_since(&self, from: &str) -> Result<Vec<ChangeRecord>, ExternalError> {
        let state = self.state.lock().await;
        if state.fail_change_log {
            return Err(ExternalError::Api {
                service: "fake mailbox".into(),
                reason: "change log unavailable".into(),
            });
        }
        let from: u64 = from.parse().map_err(|_| ExternalError::Api {
            service: "fake mailbox".into(),
            reason: format!("invalid start position '{from}'"),
        })?;
        Ok(state
            .changes
            .iter()
            .filter(|(position, _)| *position > from)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[async_trait]
impl MessageFetcher for FakeMailbox {
    async fn get(&self, message_id: &str) -> Result<FetchedMessage, ExternalError> {
        self.state
            .lock()
            .await
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| ExternalError::NotFound {
                entity: "message".into(),
                id: message_id.to_string(),
            })
    }
}

#[async_trait]
impl LabelApi for FakeMailbox {
    async fn find_or_create(&self, name: &str) -> Result<String, ExternalError> {
        let mut state = self.state.lock().await;
        state.label_lookups += 1;
        if let Some(id) = state.labels.get(name) {
            return Ok(id.clone());
        }
        let id = format!("Label_{}", state.labels.len() + 1);
        state.labels.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn apply_labels(
        &self,
        message_id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), ExternalError> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| ExternalError::NotFound {
                entity: "message".into(),
                id: message_id.to_string(),
            })?;
        message.labels.extend(add.iter().cloned());
        message.labels.retain(|id| !remove.contains(id));
        Ok(())
    }
}

#[async_trait]
impl SendApi for FakeMailbox {
    async fn send(&self, reply: &OutgoingReply) -> Result<(), ExternalError> {
        let mut state = self.state.lock().await;
        if state.fail_sends {
            return Err(ExternalError::Http("send rejected".into()));
        }
        state.sent.push(reply.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn change_log_lists_after_position() {
        let mailbox = FakeMailbox::new();
        let start = mailbox.position().await;
        let a = mailbox.deliver("a@x.com", "A", "").await;
        let middle = mailbox.position().await;
        let b = mailbox.deliver("b@x.com", "B", "").await;

        let all = mailbox.list_since(&start).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].added_message_ids, vec![a]);

        let rest = mailbox.list_since(&middle).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].added_message_ids, vec![b]);
    }

    #[tokio::test]
    async fn labels_have_set_semantics() {
        let mailbox = FakeMailbox::new();
        let id = mailbox.deliver("a@x.com", "A", "").await;
        let work = mailbox.find_or_create("Work").await.unwrap();
        assert_eq!(mailbox.find_or_create("Work").await.unwrap(), work);

        let add = BTreeSet::from([work]);
        mailbox.apply_labels(&id, &add, &BTreeSet::new()).await.unwrap();
        mailbox.apply_labels(&id, &add, &BTreeSet::new()).await.unwrap();
        assert_eq!(
            mailbox.label_names(&id).await,
            BTreeSet::from(["INBOX".to_string(), "Work".to_string()])
        );
    }

    #[tokio::test]
    async fn unknown_message_is_not_found() {
        let mailbox = FakeMailbox::new();
        assert!(matches!(
            mailbox.get("nope").await,
            Err(ExternalError::NotFound { .. })
        ));
    }
}
