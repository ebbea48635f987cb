//! Shared types for the triage pipeline.

use std::collections::BTreeSet;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ── Notification ────────────────────────────────────────────────────

/// Push signal that the mailbox change log advanced to `new_position`.
///
/// Delivered at-least-once: duplicates and out-of-order arrivals are normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    /// Opaque change-log position carried by the push.
    pub new_position: String,
    /// Mailbox the push refers to, when the envelope names one.
    pub email_address: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Pub/Sub push body: `{"message": {"data": "<base64>", "messageId": "..."}}`.
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: String,
    message_id: String,
}

/// Decoded `data` payload of a push.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushData {
    email_address: Option<String>,
    history_id: serde_json::Value,
}

impl Notification {
    pub fn new(notification_id: impl Into<String>, new_position: impl Into<String>) -> Self {
        Self {
            notification_id: notification_id.into(),
            new_position: new_position.into(),
            email_address: None,
            received_at: Utc::now(),
        }
    }

    /// Notification with a generated id (for locally triggered syncs).
    pub fn at(new_position: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), new_position)
    }

    /// Decode a Pub/Sub push envelope.
    ///
    /// The position may be encoded as a JSON number or string.
    pub fn from_push(body: &[u8]) -> crate::error::Result<Self> {
        let envelope: PushEnvelope = serde_json::from_slice(body)
            .map_err(|e| Error::Notification(format!("malformed envelope: {e}")))?;

        let decoded = BASE64
            .decode(envelope.message.data.trim())
            .map_err(|e| Error::Notification(format!("data is not base64: {e}")))?;

        let data: PushData = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Notification(format!("malformed data payload: {e}")))?;

        let new_position = match data.history_id {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            other => {
                return Err(Error::Notification(format!(
                    "unusable change-log position: {other}"
                )));
            }
        };

        Ok(Self {
            notification_id: envelope.message.message_id,
            new_position,
            email_address: data.email_address,
            received_at: Utc::now(),
        })
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// One concrete mail item, resolved from the change log. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    pub snippet: String,
    /// Mailbox labels present when the message was fetched.
    pub labels: BTreeSet<String>,
}

impl Message {
    /// Subject and snippet joined, the text the heuristics look at.
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.subject, self.snippet)
    }
}

// ── Classification levels ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    Personal,
    Spam,
    Promotional,
    Social,
    Other,
    Unknown,
}

impl Category {
    /// Mailbox label applied for this category.
    pub fn label_name(&self) -> &'static str {
        match self {
            Self::Work => "Work",
            Self::Personal => "Personal",
            Self::Spam => "Spam",
            Self::Promotional => "Promotional",
            Self::Social => "Social",
            Self::Other => "Other",
            Self::Unknown => "Unknown",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Personal => "personal",
            Self::Spam => "spam",
            Self::Promotional => "promotional",
            Self::Social => "social",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }

    /// Map the main part of an upstream category string (`"promotion"` in
    /// `"promotion.deals"`).
    pub fn from_upstream(main: &str) -> Self {
        match main {
            "work" => Self::Work,
            "personal" => Self::Personal,
            "social" => Self::Social,
            "promotion" => Self::Promotional,
            "spam" => Self::Spam,
            "update" => Self::Other,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn label_name(&self) -> &'static str {
        match self {
            Self::High => "Urgent",
            Self::Medium => "Normal",
            Self::Low => "Low-Priority",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Upstream urgency: `high` and `medium` map directly, anything else is low.
    pub fn from_upstream(value: &str) -> Self {
        match value {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn from_upstream(value: &str) -> Self {
        match value {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Upstream payload ────────────────────────────────────────────────

/// Classification computed by an external classifier.
///
/// Authoritative whenever `category.category` is non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamClassification {
    #[serde(default)]
    pub category: Option<UpstreamCategory>,
    #[serde(default)]
    pub urgency: Option<UpstreamUrgency>,
    #[serde(default)]
    pub importance: Option<UpstreamImportance>,
    #[serde(default)]
    pub should_archive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamCategory {
    /// Possibly dotted: `"promotion.flash-sale"`.
    pub category: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, alias = "promotionScore")]
    pub promotion_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamUrgency {
    pub urgency: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamImportance {
    pub importance: String,
    #[serde(default)]
    pub score: Option<f64>,
}

// ── Classification ──────────────────────────────────────────────────

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Upstream,
    Heuristic,
}

/// Derived labels for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    /// Sub-part of a dotted upstream category; becomes a secondary label.
    pub sub_category: Option<String>,
    pub urgency: Urgency,
    pub importance: Importance,
    pub confidence: Option<f64>,
    pub urgency_score: Option<f64>,
    pub importance_score: Option<f64>,
    pub should_archive: bool,
    pub source: ClassificationSource,
}

impl Classification {
    /// Label names implied by this classification: primary category,
    /// optional secondary, urgency.
    pub fn label_names(&self) -> Vec<String> {
        let mut names = vec![self.category.label_name().to_string()];
        if let Some(ref sub) = self.sub_category {
            names.push(sub.clone());
        }
        names.push(self.urgency.label_name().to_string());
        names
    }
}

/// A message paired with its classification, the payload of the classified event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedMessage {
    pub message: Message,
    pub classification: Classification,
}

// ── Processed record ────────────────────────────────────────────────

/// Audit trail entry, appended once a message's labels were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub message_id: String,
    pub thread_id: String,
    pub category: Category,
    pub urgency: Urgency,
    pub importance: Importance,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn from_classified(classified: &ClassifiedMessage) -> Self {
        Self {
            message_id: classified.message.message_id.clone(),
            thread_id: classified.message.thread_id.clone(),
            category: classified.classification.category,
            urgency: classified.classification.urgency,
            importance: classified.classification.importance,
            processed_at: Utc::now(),
        }
    }
}
