//! Labeler/archiver: applies classification labels to the mailbox.
//!
//! Runs on `MessageClassified`. Labels are resolved by name (created on first
//! use, ids cached) and applied with set semantics, so repeated runs for the
//! same message leave the label set unchanged.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, SideEffectError};
use crate::mailbox::LabelApi;
use crate::pipeline::bus::{EventHandler, TriageEvent};
use crate::pipeline::types::{ClassifiedMessage, ProcessedRecord};
use crate::store::Ledger;

/// System label removed when a message is archived.
pub const INBOX_LABEL: &str = "INBOX";

/// What one organize run did.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizeOutcome {
    /// Label names applied, in classification order.
    pub labels: Vec<String>,
    pub archived: bool,
    /// `false` if the processed record was already present.
    pub recorded: bool,
}

pub struct Organizer {
    labels: Arc<dyn LabelApi>,
    ledger: Arc<Ledger>,
    archive_label: String,
    /// Label name → provider label id.
    label_ids: RwLock<HashMap<String, String>>,
}

impl Organizer {
    pub fn new(
        labels: Arc<dyn LabelApi>,
        ledger: Arc<Ledger>,
        archive_label: impl Into<String>,
    ) -> Self {
        Self {
            labels,
            ledger,
            archive_label: archive_label.into(),
            label_ids: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a label id by name, creating the label if needed.
    async fn label_id(&self, name: &str) -> Result<String, SideEffectError> {
        if let Some(id) = self.label_ids.read().await.get(name) {
            return Ok(id.clone());
        }

        let id = self
            .labels
            .find_or_create(name)
            .await
            .map_err(|source| SideEffectError::Label {
                name: name.to_string(),
                source,
            })?;
        debug!(label = %name, label_id = %id, "Label resolved");
        self.label_ids
            .write()
            .await
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    /// Label (and possibly archive) a classified message, then record it.
    pub async fn organize(
        &self,
        classified: &ClassifiedMessage,
    ) -> Result<OrganizeOutcome, SideEffectError> {
        let message_id = &classified.message.message_id;
        let names = classified.classification.label_names();

        let mut add = BTreeSet::new();
        for name in &names {
            add.insert(self.label_id(name).await?);
        }
        self.apply(message_id, &add, &BTreeSet::new()).await?;
        info!(id = %message_id, labels = ?names, "Labels applied");

        let archived = classified.classification.should_archive;
        if archived {
            let archive = BTreeSet::from([self.label_id(&self.archive_label).await?]);
            let inbox = BTreeSet::from([INBOX_LABEL.to_string()]);
            self.apply(message_id, &archive, &inbox).await?;
            info!(id = %message_id, label = %self.archive_label, "Message archived");
        }

        let recorded = self
            .ledger
            .append_processed(ProcessedRecord::from_classified(classified))
            .await?;

        Ok(OrganizeOutcome {
            labels: names,
            archived,
            recorded,
        })
    }

    async fn apply(
        &self,
        message_id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), SideEffectError> {
        self.labels
            .apply_labels(message_id, add, remove)
            .await
            .map_err(|source| SideEffectError::Apply {
                message_id: message_id.to_string(),
                source,
            })
    }
}

#[async_trait]
impl EventHandler for Organizer {
    fn name(&self) -> &str {
        "organizer"
    }

    async fn handle(&self, event: &TriageEvent) -> Result<Vec<TriageEvent>, Error> {
        let TriageEvent::MessageClassified(classified) = event else {
            return Ok(vec![]);
        };

        let outcome = self.organize(classified).await?;
        let message_id = classified.message.message_id.clone();

        let mut events = Vec::with_capacity(2);
        if outcome.archived {
            events.push(TriageEvent::MessageArchived {
                message_id: message_id.clone(),
                archive_label: self.archive_label.clone(),
            });
        }
        events.push(TriageEvent::MessageOrganized {
            message_id,
            labels: outcome.labels,
        });
        Ok(events)
    }
}
