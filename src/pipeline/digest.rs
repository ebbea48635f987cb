//! Digest aggregator: periodic summary of the accumulation ledger.
//!
//! A run snapshots both ledger lists, publishes a summary and then removes
//! what the snapshot covered; entries appended meanwhile roll into the next
//! digest. Nothing is removed unless publishing succeeded. A crash between publish and
//! reset reports the same window twice, at most once.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DigestError;
use crate::pipeline::bus::{EventBus, TriageEvent};
use crate::pipeline::types::{Category, Urgency};
use crate::sink::DigestSink;
use crate::store::Ledger;
use crate::store::ledger::LedgerSnapshot;

/// Aggregate report over one accumulation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSummary {
    pub date: NaiveDate,
    pub total: usize,
    pub category_counts: BTreeMap<Category, usize>,
    pub urgency_counts: BTreeMap<Urgency, usize>,
    pub auto_replied_count: usize,
    pub generated_at: DateTime<Utc>,
}

impl DigestSummary {
    /// Build a summary from a ledger snapshot.
    ///
    /// Only auto-replies whose message is among the processed records count.
    pub fn from_snapshot(snapshot: &LedgerSnapshot, now: DateTime<Utc>) -> Self {
        let mut category_counts = BTreeMap::new();
        let mut urgency_counts = BTreeMap::new();
        for record in &snapshot.processed {
            *category_counts.entry(record.category).or_insert(0) += 1;
            *urgency_counts.entry(record.urgency).or_insert(0) += 1;
        }

        let auto_replied_count = snapshot
            .auto_replied
            .iter()
            .filter(|id| snapshot.processed.iter().any(|r| &r.message_id == *id))
            .count();

        Self {
            date: now.date_naive(),
            total: snapshot.processed.len(),
            category_counts,
            urgency_counts,
            auto_replied_count,
            generated_at: now,
        }
    }

    /// Plain-text rendering used by log output and webhook payloads.
    pub fn render_text(&self) -> String {
        let counts = |pairs: Vec<(String, usize)>| {
            if pairs.is_empty() {
                "none".to_string()
            } else {
                pairs
                    .into_iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };
        format!(
            "Mail digest for {}: {} processed; categories [{}]; urgency [{}]; {} auto-replied",
            self.date,
            self.total,
            counts(
                self.category_counts
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect()
            ),
            counts(
                self.urgency_counts
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect()
            ),
            self.auto_replied_count,
        )
    }
}

/// Builds, publishes and rotates digests.
pub struct DigestAggregator {
    ledger: Arc<Ledger>,
    sink: Arc<dyn DigestSink>,
}

impl DigestAggregator {
    pub fn new(ledger: Arc<Ledger>, sink: Arc<dyn DigestSink>) -> Self {
        Self { ledger, sink }
    }

    /// One digest run.
    ///
    /// `Empty` means there was nothing to report; state is untouched.
    pub async fn run_once(&self) -> Result<DigestSummary, DigestError> {
        let snapshot = self.ledger.snapshot().await?;
        if snapshot.processed.is_empty() {
            return Err(DigestError::Empty);
        }

        let summary = DigestSummary::from_snapshot(&snapshot, Utc::now());
        self.sink
            .publish(&summary)
            .await
            .map_err(DigestError::Publish)?;
        info!(
            sink = self.sink.name(),
            total = summary.total,
            auto_replied = summary.auto_replied_count,
            "Digest published"
        );

        self.ledger.rotate(&snapshot).await?;
        Ok(summary)
    }
}

/// Parse a cron expression and compute the next fire time from now.
pub fn next_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(schedule.upcoming(Utc).next())
}

/// Run one digest and announce it, logging instead of failing.
///
/// Returns the summary when one was published.
pub async fn run_and_announce(
    aggregator: &DigestAggregator,
    bus: Option<&EventBus>,
) -> Option<DigestSummary> {
    match aggregator.run_once().await {
        Ok(summary) => {
            if let Some(bus) = bus {
                bus.publish(TriageEvent::DigestPublished(summary.clone()))
                    .await;
            }
            Some(summary)
        }
        Err(DigestError::Empty) => {
            info!("No processed messages, digest skipped");
            None
        }
        Err(e) => {
            error!(error = %e, "Digest run failed, state retained");
            None
        }
    }
}

/// Spawn the digest job on a cron schedule.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_digest_job(
    aggregator: Arc<DigestAggregator>,
    schedule: &str,
    bus: Option<Arc<EventBus>>,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>), DigestError> {
    let expression = schedule.to_string();
    let schedule = cron::Schedule::from_str(schedule)
        .map_err(|e| DigestError::Schedule(format!("invalid cron: {e}")))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(schedule = %expression, "Digest job started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Digest schedule has no upcoming fire time, stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "Waiting for next digest");
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Digest job shutting down");
                return;
            }

            run_and_announce(&aggregator, bus.as_deref()).await;
        }
    });

    Ok((handle, shutdown_flag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::ExternalError;
    use crate::pipeline::types::{Importance, ProcessedRecord};
    use crate::store::MemoryStore;
    use crate::store::ledger::ReplyLogMode;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<DigestSummary>>,
        fail: bool,
    }

    #[async_trait]
    impl DigestSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn publish(&self, summary: &DigestSummary) -> Result<(), ExternalError> {
            if self.fail {
                return Err(ExternalError::Http("webhook down".into()));
            }
            self.published.lock().unwrap().push(summary.clone());
            Ok(())
        }
    }

    fn record(id: &str, category: Category, urgency: Urgency) -> ProcessedRecord {
        ProcessedRecord {
            message_id: id.into(),
            thread_id: format!("t-{id}"),
            category,
            urgency,
            importance: Importance::Medium,
            processed_at: Utc::now(),
        }
    }

    fn ledger() -> Arc<Ledger> {
        Arc::new(Ledger::new(Arc::new(MemoryStore::new()), ReplyLogMode::Union))
    }

    #[tokio::test]
    async fn empty_ledger_publishes_nothing() {
        let ledger = ledger();
        ledger.record_reply("orphan").await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let aggregator = DigestAggregator::new(ledger.clone(), sink.clone());

        assert!(matches!(aggregator.run_once().await, Err(DigestError::Empty)));
        assert!(sink.published.lock().unwrap().is_empty());
        // Not reset.
        assert_eq!(ledger.auto_replied().await.unwrap(), vec!["orphan"]);
    }

    #[tokio::test]
    async fn summary_counts_and_reset() {
        let ledger = ledger();
        ledger.append_processed(record("m1", Category::Work, Urgency::High)).await.unwrap();
        ledger.append_processed(record("m2", Category::Work, Urgency::Low)).await.unwrap();
        ledger.append_processed(record("m3", Category::Spam, Urgency::Low)).await.unwrap();
        ledger.record_reply("m1").await.unwrap();
        ledger.record_reply("not-processed").await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let aggregator = DigestAggregator::new(ledger.clone(), sink.clone());
        let summary = aggregator.run_once().await.unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.category_counts[&Category::Work], 2);
        assert_eq!(summary.category_counts[&Category::Spam], 1);
        assert_eq!(summary.urgency_counts[&Urgency::Low], 2);
        assert_eq!(summary.auto_replied_count, 1);
        assert_eq!(sink.published.lock().unwrap().len(), 1);

        let after = ledger.snapshot().await.unwrap();
        assert!(after.processed.is_empty());
        assert!(after.auto_replied.is_empty());
    }

    /// Records a new message while the digest is being published.
    struct InterleavingSink {
        ledger: Arc<Ledger>,
    }

    #[async_trait]
    impl DigestSink for InterleavingSink {
        fn name(&self) -> &str {
            "interleaving"
        }

        async fn publish(&self, _summary: &DigestSummary) -> Result<(), ExternalError> {
            self.ledger
                .append_processed(record("late", Category::Personal, Urgency::Low))
                .await
                .map_err(|e| ExternalError::Http(e.to_string()))?;
            self.ledger
                .record_reply("late")
                .await
                .map_err(|e| ExternalError::Http(e.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn entries_recorded_during_publish_survive_rotation() {
        let ledger = ledger();
        ledger.append_processed(record("m1", Category::Work, Urgency::High)).await.unwrap();
        let aggregator = DigestAggregator::new(
            ledger.clone(),
            Arc::new(InterleavingSink {
                ledger: ledger.clone(),
            }),
        );

        let summary = aggregator.run_once().await.unwrap();
        assert_eq!(summary.total, 1);

        let after = ledger.snapshot().await.unwrap();
        assert_eq!(after.processed.len(), 1);
        assert_eq!(after.processed[0].message_id, "late");
        assert_eq!(after.auto_replied, vec!["late"]);
    }

    #[tokio::test]
    async fn publish_failure_retains_state() {
        let ledger = ledger();
        ledger.append_processed(record("m1", Category::Work, Urgency::High)).await.unwrap();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let aggregator = DigestAggregator::new(ledger.clone(), sink);

        assert!(matches!(aggregator.run_once().await, Err(DigestError::Publish(_))));
        assert_eq!(ledger.processed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn announce_publishes_event() {
        let ledger = ledger();
        ledger.append_processed(record("m1", Category::Work, Urgency::High)).await.unwrap();
        let aggregator = DigestAggregator::new(ledger, Arc::new(RecordingSink::default()));
        let bus = EventBus::new();
        let mut observer = bus.observe();

        let summary = run_and_announce(&aggregator, Some(&bus)).await.unwrap();
        assert!(matches!(
            observer.recv().await.unwrap(),
            TriageEvent::DigestPublished(s) if s == summary
        ));
        assert!(run_and_announce(&aggregator, Some(&bus)).await.is_none());
    }

    #[test]
    fn summary_serializes_with_lowercase_keys() {
        let snapshot = LedgerSnapshot {
            processed: vec![record("m1", Category::Promotional, Urgency::Medium)],
            auto_replied: vec![],
        };
        let summary = DigestSummary::from_snapshot(&snapshot, Utc::now());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["categoryCounts"]["promotional"], 1);
        assert_eq!(json["urgencyCounts"]["medium"], 1);
        assert!(summary.render_text().contains("promotional: 1"));
    }

    #[test]
    fn cron_parsing() {
        assert!(next_fire("0 0 1 * * *").unwrap().is_some());
        assert!(next_fire("not a schedule").is_err());
    }

    #[tokio::test]
    async fn spawn_rejects_bad_schedule() {
        let aggregator = Arc::new(DigestAggregator::new(
            ledger(),
            Arc::new(RecordingSink::default()),
        ));
        assert!(matches!(
            spawn_digest_job(aggregator, "bogus", None),
            Err(DigestError::Schedule(_))
        ));
    }
}
