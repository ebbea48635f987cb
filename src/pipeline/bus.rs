//! Event bus: typed topics, concurrent fan-out, follow-up delivery.
//!
//! Every subscriber of a topic receives the event concurrently. Handler
//! failures are contained and counted; the follow-up events a handler returns
//! are delivered breadth-first after the current event's fan-out completes.
//! All published events are also broadcast to observers.
//!
//! Only the length of a follow-up chain is bounded, never its width: a
//! notification that resolves a thousand messages still gets every message
//! classified and acted on, while a handler cycle stops after
//! `MAX_FOLLOW_UP_DEPTH` hops.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::pipeline::digest::DigestSummary;
use crate::pipeline::types::{Category, ClassifiedMessage, Message, Notification};

/// Broadcast channel capacity for observers.
const OBSERVER_CAPACITY: usize = 256;

/// Longest follow-up chain delivered from one published event. The triage
/// flow itself is three hops deep.
pub const MAX_FOLLOW_UP_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    NotificationReceived,
    MessageResolved,
    MessageClassified,
    MessageOrganized,
    MessageArchived,
    MessageReplied,
    DigestPublished,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotificationReceived => "notification.received",
            Self::MessageResolved => "message.resolved",
            Self::MessageClassified => "message.classified",
            Self::MessageOrganized => "message.organized",
            Self::MessageArchived => "message.archived",
            Self::MessageReplied => "message.replied",
            Self::DigestPublished => "digest.published",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events flowing through the triage pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriageEvent {
    NotificationReceived(Notification),
    MessageResolved(Message),
    MessageClassified(ClassifiedMessage),
    MessageOrganized {
        message_id: String,
        labels: Vec<String>,
    },
    MessageArchived {
        message_id: String,
        archive_label: String,
    },
    MessageReplied {
        message_id: String,
        thread_id: String,
        subject: String,
        category: Category,
    },
    DigestPublished(DigestSummary),
}

impl TriageEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::NotificationReceived(_) => Topic::NotificationReceived,
            Self::MessageResolved(_) => Topic::MessageResolved,
            Self::MessageClassified(_) => Topic::MessageClassified,
            Self::MessageOrganized { .. } => Topic::MessageOrganized,
            Self::MessageArchived { .. } => Topic::MessageArchived,
            Self::MessageReplied { .. } => Topic::MessageReplied,
            Self::DigestPublished(_) => Topic::DigestPublished,
        }
    }
}

/// A consumer of bus events.
///
/// Handlers must tolerate being invoked more than once for the same event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and delivery reports.
    fn name(&self) -> &str;

    /// Handle one event. Returned events are published as follow-ups.
    async fn handle(&self, event: &TriageEvent) -> Result<Vec<TriageEvent>, Error>;
}

/// A handler failure recorded during delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub handler: String,
    pub topic: Topic,
    pub error: String,
}

/// Outcome of one `publish` call, follow-ups included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    /// Events delivered (the published one plus follow-ups).
    pub events: usize,
    /// Handler invocations.
    pub deliveries: usize,
    pub failures: Vec<HandlerFailure>,
    /// Follow-ups dropped for exceeding `MAX_FOLLOW_UP_DEPTH`.
    pub dropped: usize,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.dropped == 0
    }

    pub fn succeeded(&self) -> usize {
        self.deliveries - self.failures.len()
    }

    pub fn failed_handlers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.handler.as_str()).collect()
    }
}

/// Topic-based publish/subscribe bus.
pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Arc<dyn EventHandler>>>>,
    tx: broadcast::Sender<TriageEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Register a handler for a topic.
    pub async fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        debug!(topic = %topic, handler = handler.name(), "Handler subscribed");
        self.handlers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(handler);
    }

    /// Names of the handlers subscribed to a topic.
    pub async fn subscribers(&self, topic: Topic) -> Vec<String> {
        self.handlers
            .read()
            .await
            .get(&topic)
            .map(|hs| hs.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Receive a copy of every published event.
    pub fn observe(&self) -> broadcast::Receiver<TriageEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event and all follow-ups it causes.
    pub async fn publish(&self, event: TriageEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut queue = VecDeque::from([(event, 0usize)]);

        while let Some((event, depth)) = queue.pop_front() {
            report.events += 1;

            let topic = event.topic();
            // Ok if nobody observes.
            let _ = self.tx.send(event.clone());

            let handlers = self
                .handlers
                .read()
                .await
                .get(&topic)
                .cloned()
                .unwrap_or_default();
            if handlers.is_empty() {
                debug!(topic = %topic, "No subscribers");
                continue;
            }

            let event = &event;
            let results = join_all(handlers.iter().map(|handler| async move {
                (handler.name().to_string(), handler.handle(event).await)
            }))
            .await;

            for (handler, result) in results {
                report.deliveries += 1;
                match result {
                    Ok(follow_ups) => {
                        debug!(
                            topic = %topic,
                            handler = %handler,
                            follow_ups = follow_ups.len(),
                            "Event handled"
                        );
                        if depth >= MAX_FOLLOW_UP_DEPTH {
                            if !follow_ups.is_empty() {
                                warn!(
                                    topic = %topic,
                                    handler = %handler,
                                    dropped = follow_ups.len(),
                                    "Follow-up chain too deep, dropping events"
                                );
                            }
                            report.dropped += follow_ups.len();
                        } else {
                            queue.extend(follow_ups.into_iter().map(|e| (e, depth + 1)));
                        }
                    }
                    Err(e) => {
                        error!(topic = %topic, handler = %handler, error = %e, "Event handler failed");
                        report.failures.push(HandlerFailure {
                            handler,
                            topic,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        report
    }
}
