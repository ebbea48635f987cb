//! Message classifier: category, urgency and importance for one message.
//!
//! An upstream classification is authoritative whenever it carries a
//! non-empty category. Otherwise local heuristics run in strict order:
//! - Existing mailbox labels (substring, case-insensitive)
//! - Subject + snippet patterns
//! - Urgency and importance scoring
//!
//! The heuristic path is a normal outcome, not an error.

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::error::ExternalError;
use crate::pipeline::types::{
    Category, Classification, ClassificationSource, Importance, Message, UpstreamCategory,
    UpstreamClassification, Urgency,
};

/// External classifier consulted before the heuristics.
///
/// `Ok(None)` means "no opinion"; errors also fall back to the heuristics.
#[async_trait]
pub trait UpstreamClassifier: Send + Sync {
    async fn classify(&self, message: &Message)
    -> Result<Option<UpstreamClassification>, ExternalError>;
}

/// A text pattern that selects a category.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub category: Category,
    pub regex: Regex,
}

/// A text pattern that selects an urgency level.
#[derive(Debug, Clone)]
pub struct UrgencyRule {
    pub urgency: Urgency,
    pub regex: Regex,
}

/// Label substrings checked before any text pattern, in order.
const LABEL_HINTS: &[(&str, Category)] = &[
    ("work", Category::Work),
    ("personal", Category::Personal),
    ("social", Category::Social),
    ("promotions", Category::Promotional),
    ("spam", Category::Spam),
];

const VIP_SENDER_TERMS: &[&str] = &["boss", "ceo", "director", "manager", "supervisor", "client"];

const IMPORTANCE_BASE: f64 = 0.5;
const QUESTION_WEIGHT: f64 = 0.05;
const QUESTION_CAP: f64 = 0.2;

fn builtin(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in classifier pattern must compile")
}

/// Rule-based classifier with an upstream override.
pub struct Classifier {
    category_rules: Vec<CategoryRule>,
    urgency_rules: Vec<UrgencyRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::default_rules()
    }
}

impl Classifier {
    /// Classifier with the built-in category and urgency patterns.
    pub fn default_rules() -> Self {
        let category_rules = vec![
            CategoryRule {
                category: Category::Work,
                regex: builtin(r"(?i)work|task|project|deadline|meeting|presentation"),
            },
            CategoryRule {
                category: Category::Personal,
                regex: builtin(r"(?i)personal|family|friend|vacation|holiday"),
            },
            CategoryRule {
                category: Category::Social,
                regex: builtin(r"(?i)social|event|party|gathering|meetup"),
            },
            CategoryRule {
                category: Category::Promotional,
                regex: builtin(r"(?i)deal|discount|offer|subscription|newsletter|unsubscribe"),
            },
        ];

        let urgency_rules = vec![
            UrgencyRule {
                urgency: Urgency::High,
                regex: builtin(r"(?i)urgent|asap|emergency|immediately|deadline|today"),
            },
            UrgencyRule {
                urgency: Urgency::Medium,
                regex: builtin(r"(?i)important|priority|attention|soon"),
            },
        ];

        Self {
            category_rules,
            urgency_rules,
        }
    }

    /// Classifier without text patterns (labels and scoring still apply).
    pub fn empty() -> Self {
        Self {
            category_rules: Vec::new(),
            urgency_rules: Vec::new(),
        }
    }

    /// Append a category pattern after the existing ones.
    pub fn add_category_rule(
        &mut self,
        pattern: &str,
        category: Category,
    ) -> Result<(), regex::Error> {
        self.category_rules.push(CategoryRule {
            category,
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    /// Classify a message, preferring a usable upstream payload.
    pub fn classify(
        &self,
        message: &Message,
        upstream: Option<&UpstreamClassification>,
    ) -> Classification {
        let usable = upstream.and_then(|u| {
            u.category
                .as_ref()
                .filter(|c| !c.category.trim().is_empty())
                .map(|c| (u, c))
        });

        match usable {
            Some((payload, category)) => self.from_upstream(message, payload, category),
            None => {
                info!(id = %message.message_id, "Classification fallback used");
                self.heuristic(message)
            }
        }
    }

    fn from_upstream(
        &self,
        message: &Message,
        payload: &UpstreamClassification,
        upstream: &UpstreamCategory,
    ) -> Classification {
        // Only the first two dotted segments matter: "promotion.deals.summer"
        // labels as Promotional + "deals". Matching ignores case.
        let mut parts = upstream.category.trim().split('.');
        let main = parts.next().unwrap_or_default();
        let sub = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let category = Category::from_upstream(&main.trim().to_ascii_lowercase());

        let (urgency, urgency_score) = match payload
            .urgency
            .as_ref()
            .filter(|u| !u.urgency.trim().is_empty())
        {
            Some(u) => (
                Urgency::from_upstream(&u.urgency.trim().to_ascii_lowercase()),
                u.score,
            ),
            None => (self.urgency(message), None),
        };

        let (importance, importance_score) = match payload.importance.as_ref() {
            Some(i) => (
                Importance::from_upstream(&i.importance.trim().to_ascii_lowercase()),
                i.score,
            ),
            None => (Importance::Medium, None),
        };

        debug!(
            id = %message.message_id,
            category = %category,
            urgency = %urgency,
            "Using upstream classification"
        );

        Classification {
            category,
            sub_category: sub.map(str::to_string),
            urgency,
            importance,
            confidence: upstream.confidence,
            urgency_score,
            importance_score,
            should_archive: payload.should_archive,
            source: ClassificationSource::Upstream,
        }
    }

    fn heuristic(&self, message: &Message) -> Classification {
        let category = self.category(message);
        let urgency = self.urgency(message);
        let importance_score = importance_score(message);
        let importance = importance_level(importance_score);

        let should_archive = category == Category::Promotional
            && urgency == Urgency::Low
            && importance == Importance::Low;

        Classification {
            category,
            sub_category: None,
            urgency,
            importance,
            confidence: None,
            urgency_score: None,
            importance_score: Some(importance_score),
            should_archive,
            source: ClassificationSource::Heuristic,
        }
    }

    /// Category from existing labels, then text patterns.
    pub fn category(&self, message: &Message) -> Category {
        for (needle, category) in LABEL_HINTS {
            if message
                .labels
                .iter()
                .any(|l| l.to_ascii_lowercase().contains(needle))
            {
                return *category;
            }
        }

        let text = message.searchable_text();
        self.category_rules
            .iter()
            .find(|rule| rule.regex.is_match(&text))
            .map(|rule| rule.category)
            .unwrap_or(Category::Unknown)
    }

    /// Urgency from text patterns; low when nothing matches.
    pub fn urgency(&self, message: &Message) -> Urgency {
        let text = message.searchable_text();
        self.urgency_rules
            .iter()
            .find(|rule| rule.regex.is_match(&text))
            .map(|rule| rule.urgency)
            .unwrap_or(Urgency::Low)
    }
}

/// Importance score in `[0, 1]` from sender, addressing, length, threading
/// and questions.
pub fn importance_score(message: &Message) -> f64 {
    let mut score = IMPORTANCE_BASE;

    let sender = message.sender.to_lowercase();
    if VIP_SENDER_TERMS.iter().any(|term| sender.contains(term)) {
        score += 0.2;
    }

    let snippet = message.snippet.to_lowercase();
    let head = |n: usize| snippet.chars().take(n).collect::<String>();
    if head(100).contains("dear") || head(50).contains("hi ") {
        score += 0.1;
    }

    let length = message.snippet.chars().count();
    if (100..=1500).contains(&length) {
        score += 0.1;
    } else if length < 50 {
        score -= 0.1;
    }

    if message.subject.to_lowercase().contains("re:") {
        score += 0.1;
    }

    let questions = message.snippet.matches('?').count() as f64;
    score += (questions * QUESTION_WEIGHT).min(QUESTION_CAP);

    score.clamp(0.0, 1.0)
}

pub fn importance_level(score: f64) -> Importance {
    if score > 0.7 {
        Importance::High
    } else if score > 0.4 {
        Importance::Medium
    } else {
        Importance::Low
    }
}
