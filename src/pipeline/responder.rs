//! Auto-responder: canned replies for work and personal mail.
//!
//! The reply body depends only on the category. Every other category is
//! skipped, which is a normal outcome. The auto-reply log prevents a second
//! reply to the same message.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ResponderConfig;
use crate::error::{Error, SideEffectError};
use crate::mailbox::{OutgoingReply, SendApi};
use crate::pipeline::bus::{EventHandler, TriageEvent};
use crate::pipeline::types::{Category, ClassifiedMessage};
use crate::store::Ledger;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Sent(OutgoingReply),
    /// No canned reply exists for the category.
    Skipped { category: Category },
    /// The message is already in the auto-reply log.
    AlreadyReplied,
}

/// Canned reply for a category, signed with the responder's name.
pub fn reply_body(category: Category, responder_name: &str) -> Option<String> {
    match category {
        Category::Work => Some(format!(
            "Hi,\n\nThanks for your message. I'll review it and get back to you soon.\n\nRegards,\n{responder_name}"
        )),
        Category::Personal => Some(format!(
            "Hi,\n\nThank you for reaching out. I'll read your message carefully once I can give it my full attention, and reply as soon as I can.\n\nBest wishes,\n{responder_name}"
        )),
        _ => None,
    }
}

pub struct AutoResponder {
    sender: Arc<dyn SendApi>,
    ledger: Arc<Ledger>,
    responder: ResponderConfig,
}

impl AutoResponder {
    pub fn new(sender: Arc<dyn SendApi>, ledger: Arc<Ledger>, responder: ResponderConfig) -> Self {
        Self {
            sender,
            ledger,
            responder,
        }
    }

    /// Reply to a classified message if its category calls for it.
    pub async fn respond(
        &self,
        classified: &ClassifiedMessage,
    ) -> Result<ReplyOutcome, SideEffectError> {
        let message = &classified.message;
        let category = classified.classification.category;

        let Some(body) = reply_body(category, &self.responder.name) else {
            debug!(id = %message.message_id, category = %category, "No auto-reply for category");
            return Ok(ReplyOutcome::Skipped { category });
        };

        if self.ledger.has_replied(&message.message_id).await? {
            debug!(id = %message.message_id, "Already replied");
            return Ok(ReplyOutcome::AlreadyReplied);
        }

        let reply = OutgoingReply {
            from: self.responder.email.clone(),
            to: message.sender.clone(),
            in_reply_to: message.message_id.clone(),
            thread_id: message.thread_id.clone(),
            subject: format!("Re: {}", message.subject),
            body,
        };

        self.sender
            .send(&reply)
            .await
            .map_err(|source| SideEffectError::Send {
                message_id: message.message_id.clone(),
                source,
            })?;
        self.ledger.record_reply(&message.message_id).await?;

        info!(id = %message.message_id, to = %reply.to, category = %category, "Auto-reply sent");
        Ok(ReplyOutcome::Sent(reply))
    }
}

#[async_trait]
impl EventHandler for AutoResponder {
    fn name(&self) -> &str {
        "auto_responder"
    }

    async fn handle(&self, event: &TriageEvent) -> Result<Vec<TriageEvent>, Error> {
        let TriageEvent::MessageClassified(classified) = event else {
            return Ok(vec![]);
        };

        match self.respond(classified).await? {
            ReplyOutcome::Sent(reply) => Ok(vec![TriageEvent::MessageReplied {
                message_id: reply.in_reply_to,
                thread_id: reply.thread_id,
                subject: classified.message.subject.clone(),
                category: classified.classification.category,
            }]),
            ReplyOutcome::Skipped { .. } | ReplyOutcome::AlreadyReplied => Ok(vec![]),
        }
    }
}
