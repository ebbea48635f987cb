//! End-to-end tests of the triage pipeline.
//!
//! Each test assembles a `TriagePipeline` over a `FakeMailbox` and drives it
//! through notifications, pre-classified ingestion and digest runs.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::broadcast;

use mail_triage::config::TriageConfig;
use mail_triage::error::{DigestError, ExternalError};
use mail_triage::pipeline::bus::{Topic, TriageEvent};
use mail_triage::pipeline::digest::DigestSummary;
use mail_triage::pipeline::types::{
    Category, Message, Notification, UpstreamCategory, UpstreamClassification, Urgency,
};
use mail_triage::pipeline::{PipelineDeps, TriagePipeline};
use mail_triage::sink::DigestSink;
use mail_triage::store::{LibSqlStore, MemoryStore, StateStore};
use mail_triage::sync::SelectionPolicy;
use mail_triage::testing::FakeMailbox;

const RESPONDER: &str = "ava@example.com";

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<DigestSummary>>,
}

#[async_trait]
impl DigestSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(&self, summary: &DigestSummary) -> Result<(), ExternalError> {
        self.published.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

struct Harness {
    mailbox: Arc<FakeMailbox>,
    sink: Arc<RecordingSink>,
    pipeline: TriagePipeline,
}

async fn harness_with(config: TriageConfig, store: Arc<dyn StateStore>) -> Harness {
    let mailbox = Arc::new(FakeMailbox::new());
    let sink = Arc::new(RecordingSink::default());
    let pipeline = TriagePipeline::new(
        &config,
        store,
        PipelineDeps {
            watch: mailbox.clone(),
            change_log: mailbox.clone(),
            fetcher: mailbox.clone(),
            labels: mailbox.clone(),
            sender: mailbox.clone(),
            upstream: None,
            digest_sink: sink.clone(),
        },
    )
    .await;
    Harness {
        mailbox,
        sink,
        pipeline,
    }
}

async fn harness() -> Harness {
    let h = harness_with(
        TriageConfig::new("Ava", RESPONDER),
        Arc::new(MemoryStore::new()),
    )
    .await;
    h.pipeline.register_watch().await.unwrap();
    h
}

fn drain(observer: &mut broadcast::Receiver<TriageEvent>) -> Vec<TriageEvent> {
    let mut events = Vec::new();
    while let Ok(event) = observer.try_recv() {
        events.push(event);
    }
    events
}

fn count(events: &[TriageEvent], topic: Topic) -> usize {
    events.iter().filter(|e| e.topic() == topic).count()
}

fn upstream(category: &str) -> UpstreamClassification {
    UpstreamClassification {
        category: Some(UpstreamCategory {
            category: category.into(),
            confidence: Some(0.95),
            promotion_score: None,
        }),
        ..Default::default()
    }
}

async fn fetched(mailbox: &FakeMailbox, id: &str, subject: &str, sender: &str) -> Message {
    Message {
        message_id: id.into(),
        thread_id: format!("thread-{}", id.trim_start_matches("msg-")),
        subject: subject.into(),
        sender: sender.into(),
        snippet: String::new(),
        labels: mailbox.label_names(id).await,
    }
}

#[tokio::test]
async fn urgent_work_mail_is_labeled_and_answered() {
    let h = harness().await;
    let id = h
        .mailbox
        .deliver(
            "Bob <bob@example.com>",
            "URGENT: project deadline today",
            "Can you send the final deck?",
        )
        .await;

    let report = h
        .pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;
    assert!(report.is_clean(), "{report:?}");

    let labels = h.mailbox.label_names(&id).await;
    assert!(labels.contains("Work"));
    assert!(labels.contains("Urgent"));

    let sent = h.mailbox.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "Bob <bob@example.com>");
    assert_eq!(sent[0].in_reply_to, id);
    assert_eq!(sent[0].subject, "Re: URGENT: project deadline today");

    let processed = h.pipeline.ledger().processed().await.unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].category, Category::Work);
    assert_eq!(processed[0].urgency, Urgency::High);
}

#[tokio::test]
async fn cursor_ends_at_last_position_regardless_of_outcome() {
    let h = harness().await;
    let mut positions = Vec::new();

    h.mailbox.deliver("a@example.com", "Meeting notes", "see attached").await;
    positions.push(h.mailbox.position().await);
    h.mailbox.deliver_raw(None, Some("b@example.com"), "no subject").await;
    positions.push(h.mailbox.position().await);
    h.mailbox.deliver(RESPONDER, "Re: Meeting notes", "auto").await;
    positions.push(h.mailbox.position().await);

    for position in &positions {
        h.pipeline.handle_notification(Notification::at(position)).await;
    }
    let last = positions.last().cloned();
    assert_eq!(h.pipeline.cursor().read().await.unwrap(), last);

    // A late redelivery of an older notification does not rewind the cursor.
    h.pipeline
        .handle_notification(Notification::at(&positions[0]))
        .await;
    assert_eq!(h.pipeline.cursor().read().await.unwrap(), last);
}

#[tokio::test]
async fn first_policy_surfaces_one_message_per_notification() {
    let h = harness().await;
    let mut observer = h.pipeline.bus().observe();

    h.mailbox.deliver("a@example.com", "Family dinner", "Sunday?").await;
    h.mailbox.deliver("b@example.com", "Project update", "status").await;
    h.mailbox.deliver("c@example.com", "Vacation photos", "enjoy").await;

    h.pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;

    let events = drain(&mut observer);
    assert_eq!(count(&events, Topic::MessageResolved), 1);
    assert_eq!(count(&events, Topic::MessageOrganized), 1);
    assert!(h.mailbox.sent().await.len() <= 1);
}

#[tokio::test]
async fn all_policy_surfaces_every_message() {
    let mut config = TriageConfig::new("Ava", RESPONDER);
    config.selection_policy = SelectionPolicy::All;
    let h = harness_with(config, Arc::new(MemoryStore::new())).await;
    h.pipeline.register_watch().await.unwrap();
    let mut observer = h.pipeline.bus().observe();

    h.mailbox.deliver("a@example.com", "Family dinner", "Sunday?").await;
    h.mailbox.deliver("b@example.com", "Project update", "status").await;

    h.pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;

    let events = drain(&mut observer);
    assert_eq!(count(&events, Topic::MessageOrganized), 2);
    assert_eq!(h.mailbox.sent().await.len(), 2);
}

#[tokio::test]
async fn all_policy_handles_a_large_window_completely() {
    let mut config = TriageConfig::new("Ava", RESPONDER);
    config.selection_policy = SelectionPolicy::All;
    let h = harness_with(config, Arc::new(MemoryStore::new())).await;
    h.pipeline.register_watch().await.unwrap();

    const BURST: usize = 1100;
    for i in 0..BURST {
        h.mailbox
            .deliver(&format!("user{i}@example.com"), "Project note", "status")
            .await;
    }
    let target = h.mailbox.position().await;

    let report = h
        .pipeline
        .handle_notification(Notification::at(&target))
        .await;
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.dropped, 0);

    assert_eq!(h.pipeline.ledger().processed().await.unwrap().len(), BURST);
    assert_eq!(h.mailbox.sent().await.len(), BURST);
    assert_eq!(h.pipeline.cursor().read().await.unwrap(), Some(target));
}

#[tokio::test]
async fn senderless_mail_is_never_answered() {
    let h = harness().await;
    let mut observer = h.pipeline.bus().observe();

    h.mailbox
        .deliver_raw(Some("Project meeting"), None, "agenda")
        .await;
    let report = h
        .pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;

    assert!(report.is_clean());
    assert_eq!(count(&drain(&mut observer), Topic::MessageClassified), 0);
    assert!(h.mailbox.sent().await.is_empty());
}

#[tokio::test]
async fn self_originated_mail_is_never_classified() {
    let h = harness().await;
    let mut observer = h.pipeline.bus().observe();

    h.mailbox
        .deliver("Ava <AVA@example.com>", "Re: Project", "Thanks for your message")
        .await;
    let report = h
        .pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;

    assert!(report.is_clean());
    let events = drain(&mut observer);
    assert_eq!(count(&events, Topic::MessageClassified), 0);
    assert!(h.mailbox.sent().await.is_empty());
    assert!(h.pipeline.ledger().processed().await.unwrap().is_empty());
}

#[tokio::test]
async fn dotted_upstream_category_applies_secondary_label() {
    let h = harness().await;
    let id = h.mailbox.deliver("shop@store.com", "Weekend sale", "").await;
    let message = fetched(&h.mailbox, &id, "Weekend sale", "shop@store.com").await;

    let report = h
        .pipeline
        .ingest_classified(message, upstream("promotion.flash-sale"))
        .await;
    assert!(report.is_clean());

    let labels = h.mailbox.label_names(&id).await;
    assert!(labels.contains("Promotional"));
    assert!(labels.contains("flash-sale"));
    assert!(h.mailbox.sent().await.is_empty());
}

#[tokio::test]
async fn archived_promotion_leaves_inbox() {
    let h = harness().await;
    let id = h.mailbox.deliver("deals@shop.com", "Big discount", "50% off").await;
    let message = fetched(&h.mailbox, &id, "Big discount", "deals@shop.com").await;

    let mut payload = upstream("promotion");
    payload.should_archive = true;
    let mut observer = h.pipeline.bus().observe();
    h.pipeline.ingest_classified(message, payload).await;

    let labels = h.mailbox.label_names(&id).await;
    assert!(labels.contains("Archived_Promotions"));
    assert!(!labels.contains("INBOX"));
    assert_eq!(count(&drain(&mut observer), Topic::MessageArchived), 1);
}

#[tokio::test]
async fn repeated_side_effects_are_idempotent() {
    let h = harness().await;
    let id = h.mailbox.deliver("friend@example.com", "Hello", "").await;
    let message = fetched(&h.mailbox, &id, "Hello", "friend@example.com").await;

    h.pipeline
        .ingest_classified(message.clone(), upstream("personal"))
        .await;
    let after_first = h.mailbox.label_names(&id).await;
    h.pipeline.ingest_classified(message, upstream("personal")).await;

    assert_eq!(h.mailbox.label_names(&id).await, after_first);
    assert_eq!(h.mailbox.sent().await.len(), 1);
    assert_eq!(h.pipeline.ledger().processed().await.unwrap().len(), 1);
}

#[tokio::test]
async fn labeling_failure_does_not_block_the_reply() {
    let h = harness().await;
    // Never delivered, so applying labels to it fails.
    let message = Message {
        message_id: "msg-ghost".into(),
        thread_id: "thread-ghost".into(),
        subject: "Project kickoff".into(),
        sender: "carol@example.com".into(),
        snippet: String::new(),
        labels: BTreeSet::new(),
    };

    let report = h.pipeline.ingest_classified(message, upstream("work")).await;

    assert_eq!(report.failed_handlers(), vec!["organizer"]);
    let sent = h.mailbox.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].in_reply_to, "msg-ghost");
    assert!(h.pipeline.ledger().processed().await.unwrap().is_empty());
    assert_eq!(
        h.pipeline.ledger().auto_replied().await.unwrap(),
        vec!["msg-ghost"]
    );
}

#[tokio::test]
async fn send_failure_does_not_block_labeling() {
    let h = harness().await;
    let id = h.mailbox.deliver("carol@example.com", "Project kickoff", "").await;
    let message = fetched(&h.mailbox, &id, "Project kickoff", "carol@example.com").await;
    h.mailbox.fail_sends(true).await;

    let report = h.pipeline.ingest_classified(message, upstream("work")).await;

    assert_eq!(report.failed_handlers(), vec!["auto_responder"]);
    assert!(h.mailbox.label_names(&id).await.contains("Work"));
    assert_eq!(h.pipeline.ledger().processed().await.unwrap().len(), 1);
    assert!(h.pipeline.ledger().auto_replied().await.unwrap().is_empty());
}

#[tokio::test]
async fn spam_gets_no_reply_and_no_log_entry() {
    let h = harness().await;
    let id = h.mailbox.deliver("win@lottery.biz", "You won", "").await;
    let message = fetched(&h.mailbox, &id, "You won", "win@lottery.biz").await;

    h.pipeline.ingest_classified(message, upstream("spam")).await;

    assert!(h.mailbox.sent().await.is_empty());
    assert!(h.pipeline.ledger().auto_replied().await.unwrap().is_empty());
    assert!(h.mailbox.label_names(&id).await.contains("Spam"));
}

#[tokio::test]
async fn empty_digest_publishes_and_resets_nothing() {
    let h = harness().await;
    h.pipeline.ledger().record_reply("stray").await.unwrap();

    assert!(matches!(
        h.pipeline.run_digest().await,
        Err(DigestError::Empty)
    ));
    assert!(h.sink.published.lock().unwrap().is_empty());
    assert_eq!(
        h.pipeline.ledger().auto_replied().await.unwrap(),
        vec!["stray"]
    );
}

#[tokio::test]
async fn digest_summarizes_window_and_rotates() {
    let h = harness().await;
    h.mailbox.deliver("a@example.com", "Project kickoff", "").await;
    h.pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;
    h.mailbox.deliver("b@example.com", "Newsletter", "").await;
    h.pipeline
        .handle_notification(Notification::at(h.mailbox.position().await))
        .await;

    let mut observer = h.pipeline.bus().observe();
    let summary = h.pipeline.run_digest().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.category_counts[&Category::Work], 1);
    assert_eq!(summary.category_counts[&Category::Promotional], 1);
    assert_eq!(summary.auto_replied_count, 1);
    assert_eq!(h.sink.published.lock().unwrap().len(), 1);
    assert_eq!(count(&drain(&mut observer), Topic::DigestPublished), 1);

    let snapshot = h.pipeline.ledger().snapshot().await.unwrap();
    assert!(snapshot.processed.is_empty());
    assert!(snapshot.auto_replied.is_empty());
}

#[tokio::test]
async fn push_envelope_drives_pipeline() {
    let h = harness().await;
    let id = h.mailbox.deliver("a@example.com", "Team meeting", "agenda").await;
    let position: u64 = h.mailbox.position().await.parse().unwrap();

    let data = serde_json::json!({ "emailAddress": RESPONDER, "historyId": position });
    let body = serde_json::json!({
        "message": { "data": BASE64.encode(data.to_string()), "messageId": "push-7" }
    });

    let report = h
        .pipeline
        .handle_push(body.to_string().as_bytes())
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(h.mailbox.label_names(&id).await.contains("Work"));
}

#[tokio::test]
async fn cursor_and_ledger_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    let position = {
        let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
        let h = harness_with(TriageConfig::new("Ava", RESPONDER), store).await;
        h.pipeline.register_watch().await.unwrap();
        h.mailbox.deliver("a@example.com", "Project kickoff", "").await;
        let position = h.mailbox.position().await;
        h.pipeline
            .handle_notification(Notification::at(&position))
            .await;
        position
    };

    let store = Arc::new(LibSqlStore::new_local(&path).await.unwrap());
    let h = harness_with(TriageConfig::new("Ava", RESPONDER), store).await;
    assert_eq!(
        h.pipeline.cursor().read().await.unwrap(),
        Some(position)
    );
    let processed = h.pipeline.ledger().processed().await.unwrap();
    assert_eq!(
        processed.iter().map(|r| r.category).collect::<BTreeSet<_>>(),
        BTreeSet::from([Category::Work])
    );
}
