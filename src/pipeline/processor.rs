//! Triage pipeline: wires resolver, classifier and side effects onto the bus.
//!
//! Flow:
//! 1. `NotificationReceived` → `ResolveHandler` → `MessageResolved`
//! 2. `MessageResolved` → `ClassifyHandler` → `MessageClassified`
//! 3. `MessageClassified` → `Organizer` and `AutoResponder`, independently
//!
//! Each step fails alone: a handler error is logged and counted in the
//! delivery report and never reaches the caller that triggered it.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TriageConfig;
use crate::error::{DigestError, Error};
use crate::mailbox::{ChangeLog, LabelApi, MessageFetcher, SendApi, WatchApi};
use crate::pipeline::bus::{DeliveryReport, EventBus, EventHandler, Topic, TriageEvent};
use crate::pipeline::classifier::{Classifier, UpstreamClassifier};
use crate::pipeline::digest::{self, DigestAggregator, DigestSummary};
use crate::pipeline::organizer::Organizer;
use crate::pipeline::responder::AutoResponder;
use crate::pipeline::types::{
    ClassifiedMessage, Classification, Message, Notification, UpstreamClassification,
};
use crate::sink::DigestSink;
use crate::store::{Ledger, StateStore};
use crate::sync::cursor::{CursorStore, WatchError, register_watch};
use crate::sync::resolver::ChangeResolver;

// ── Handlers ────────────────────────────────────────────────────────

/// Resolves notifications into messages.
pub struct ResolveHandler {
    resolver: ChangeResolver,
}

impl ResolveHandler {
    pub fn new(resolver: ChangeResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl EventHandler for ResolveHandler {
    fn name(&self) -> &str {
        "resolver"
    }

    async fn handle(&self, event: &TriageEvent) -> Result<Vec<TriageEvent>, Error> {
        let TriageEvent::NotificationReceived(notification) = event else {
            return Ok(vec![]);
        };

        match self.resolver.resolve(notification).await {
            Ok(messages) => Ok(messages
                .into_iter()
                .map(TriageEvent::MessageResolved)
                .collect()),
            Err(e) if e.is_resolution_failure() => {
                info!(
                    notification = %notification.notification_id,
                    position = %notification.new_position,
                    reason = %e,
                    "Notification produced no message"
                );
                Ok(vec![])
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Classifies resolved messages, consulting the upstream classifier first.
pub struct ClassifyHandler {
    classifier: Classifier,
    upstream: Option<Arc<dyn UpstreamClassifier>>,
}

impl ClassifyHandler {
    pub fn new(classifier: Classifier, upstream: Option<Arc<dyn UpstreamClassifier>>) -> Self {
        Self {
            classifier,
            upstream,
        }
    }

    /// Upstream payload for a message, if the upstream classifier has one.
    async fn upstream_payload(&self, message: &Message) -> Option<UpstreamClassification> {
        let upstream = self.upstream.as_ref()?;
        match upstream.classify(message).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %message.message_id, error = %e, "Upstream classifier failed");
                None
            }
        }
    }

    pub fn classify(
        &self,
        message: &Message,
        upstream: Option<&UpstreamClassification>,
    ) -> Classification {
        self.classifier.classify(message, upstream)
    }
}

#[async_trait]
impl EventHandler for ClassifyHandler {
    fn name(&self) -> &str {
        "classifier"
    }

    async fn handle(&self, event: &TriageEvent) -> Result<Vec<TriageEvent>, Error> {
        let TriageEvent::MessageResolved(message) = event else {
            return Ok(vec![]);
        };

        let payload = self.upstream_payload(message).await;
        let classification = self.classify(message, payload.as_ref());
        debug!(
            id = %message.message_id,
            category = %classification.category,
            urgency = %classification.urgency,
            importance = %classification.importance,
            "Message classified"
        );

        Ok(vec![TriageEvent::MessageClassified(ClassifiedMessage {
            message: message.clone(),
            classification,
        })])
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Provider-side collaborators of the pipeline.
pub struct PipelineDeps {
    pub watch: Arc<dyn WatchApi>,
    pub change_log: Arc<dyn ChangeLog>,
    pub fetcher: Arc<dyn MessageFetcher>,
    pub labels: Arc<dyn LabelApi>,
    pub sender: Arc<dyn SendApi>,
    pub upstream: Option<Arc<dyn UpstreamClassifier>>,
    pub digest_sink: Arc<dyn DigestSink>,
}

/// The assembled triage pipeline.
pub struct TriagePipeline {
    bus: Arc<EventBus>,
    cursor: CursorStore,
    ledger: Arc<Ledger>,
    classify: Arc<ClassifyHandler>,
    digest: Arc<DigestAggregator>,
    watch: Arc<dyn WatchApi>,
}

impl TriagePipeline {
    /// Build the pipeline and subscribe every handler to its topic.
    pub async fn new(
        config: &TriageConfig,
        store: Arc<dyn StateStore>,
        deps: PipelineDeps,
    ) -> Self {
        let cursor = CursorStore::new(Arc::clone(&store));
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), config.reply_log_mode));

        let resolve = Arc::new(ResolveHandler::new(ChangeResolver::new(
            cursor.clone(),
            deps.change_log,
            deps.fetcher,
            config.selection_policy,
            config.responder.email.clone(),
        )));
        let classify = Arc::new(ClassifyHandler::new(
            Classifier::default_rules(),
            deps.upstream,
        ));
        let organizer = Arc::new(Organizer::new(
            deps.labels,
            Arc::clone(&ledger),
            config.archive_label.clone(),
        ));
        let responder = Arc::new(AutoResponder::new(
            deps.sender,
            Arc::clone(&ledger),
            config.responder.clone(),
        ));

        let bus = Arc::new(EventBus::new());
        bus.subscribe(Topic::NotificationReceived, resolve).await;
        bus.subscribe(Topic::MessageResolved, classify.clone()).await;
        bus.subscribe(Topic::MessageClassified, organizer).await;
        bus.subscribe(Topic::MessageClassified, responder).await;

        let digest = Arc::new(DigestAggregator::new(Arc::clone(&ledger), deps.digest_sink));

        info!(
            policy = ?config.selection_policy,
            reply_log = ?config.reply_log_mode,
            "Triage pipeline ready"
        );

        Self {
            bus,
            cursor,
            ledger,
            classify,
            digest,
            watch: deps.watch,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Register the mailbox watch and initialize the cursor.
    pub async fn register_watch(&self) -> Result<String, WatchError> {
        register_watch(self.watch.as_ref(), &self.cursor).await
    }

    /// Process one notification end to end.
    pub async fn handle_notification(&self, notification: Notification) -> DeliveryReport {
        info!(
            notification = %notification.notification_id,
            position = %notification.new_position,
            "Notification received"
        );
        self.bus
            .publish(TriageEvent::NotificationReceived(notification))
            .await
    }

    /// Decode a push envelope and process it.
    pub async fn handle_push(&self, body: &[u8]) -> crate::error::Result<DeliveryReport> {
        let notification = Notification::from_push(body)?;
        Ok(self.handle_notification(notification).await)
    }

    /// Feed a message that was classified elsewhere straight to the side
    /// effects. A payload without a category falls back to the heuristics.
    pub async fn ingest_classified(
        &self,
        message: Message,
        upstream: UpstreamClassification,
    ) -> DeliveryReport {
        let classification = self.classify.classify(&message, Some(&upstream));
        self.bus
            .publish(TriageEvent::MessageClassified(ClassifiedMessage {
                message,
                classification,
            }))
            .await
    }

    /// Run one digest now and announce it on the bus.
    pub async fn run_digest(&self) -> Result<DigestSummary, DigestError> {
        let summary = self.digest.run_once().await?;
        self.bus
            .publish(TriageEvent::DigestPublished(summary.clone()))
            .await;
        Ok(summary)
    }

    /// Start the scheduled digest job for this pipeline.
    pub fn spawn_digest_job(
        &self,
        schedule: &str,
    ) -> Result<(JoinHandle<()>, Arc<AtomicBool>), DigestError> {
        digest::spawn_digest_job(
            Arc::clone(&self.digest),
            schedule,
            Some(Arc::clone(&self.bus)),
        )
    }
}
