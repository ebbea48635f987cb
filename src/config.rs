//! Configuration types.

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::store::ledger::ReplyLogMode;
use crate::sync::resolver::SelectionPolicy;

/// Default digest schedule: every day at 01:00 UTC (sec min hour dom mon dow).
pub const DEFAULT_DIGEST_SCHEDULE: &str = "0 0 1 * * *";

/// Default label applied to archived messages.
pub const DEFAULT_ARCHIVE_LABEL: &str = "Archived_Promotions";

/// Auto-responder identity. Its address doubles as the self-origin guard.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub name: String,
    pub email: String,
}

/// Triage core configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub responder: ResponderConfig,
    /// Path of the libSQL state database.
    pub db_path: String,
    /// Cron expression for the digest job.
    pub digest_schedule: String,
    /// Webhook that receives the digest. `None` logs the digest instead.
    pub digest_webhook_url: Option<SecretString>,
    /// Which added messages a notification window resolves to.
    pub selection_policy: SelectionPolicy,
    /// How successful auto-replies are recorded in the reply log.
    pub reply_log_mode: ReplyLogMode,
    /// Label added when a message is archived.
    pub archive_label: String,
}

impl TriageConfig {
    /// Build config from environment variables.
    ///
    /// `TRIAGE_RESPONDER_EMAIL` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let email = std::env::var("TRIAGE_RESPONDER_EMAIL")
            .map_err(|_| ConfigError::MissingEnvVar("TRIAGE_RESPONDER_EMAIL".into()))?;
        let name = std::env::var("TRIAGE_RESPONDER_NAME").unwrap_or_else(|_| email.clone());

        let db_path = std::env::var("TRIAGE_DB_PATH")
            .unwrap_or_else(|_| "./data/mail-triage.db".to_string());

        let digest_schedule = std::env::var("TRIAGE_DIGEST_SCHEDULE")
            .unwrap_or_else(|_| DEFAULT_DIGEST_SCHEDULE.to_string());
        crate::pipeline::digest::next_fire(&digest_schedule).map_err(|e| {
            ConfigError::InvalidValue {
                key: "TRIAGE_DIGEST_SCHEDULE".into(),
                message: e,
            }
        })?;

        let digest_webhook_url = std::env::var("TRIAGE_DIGEST_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let selection_policy = parse_var("TRIAGE_SELECTION_POLICY")?.unwrap_or_default();
        let reply_log_mode = parse_var("TRIAGE_REPLY_LOG_MODE")?.unwrap_or_default();

        let archive_label = std::env::var("TRIAGE_ARCHIVE_LABEL")
            .unwrap_or_else(|_| DEFAULT_ARCHIVE_LABEL.to_string());

        Ok(Self {
            responder: ResponderConfig { name, email },
            db_path,
            digest_schedule,
            digest_webhook_url,
            selection_policy,
            reply_log_mode,
            archive_label,
        })
    }

    /// Config with defaults for the given responder (tests, embedding).
    pub fn new(responder_name: &str, responder_email: &str) -> Self {
        Self {
            responder: ResponderConfig {
                name: responder_name.to_string(),
                email: responder_email.to_string(),
            },
            db_path: "./data/mail-triage.db".to_string(),
            digest_schedule: DEFAULT_DIGEST_SCHEDULE.to_string(),
            digest_webhook_url: None,
            selection_policy: SelectionPolicy::default(),
            reply_log_mode: ReplyLogMode::default(),
            archive_label: DEFAULT_ARCHIVE_LABEL.to_string(),
        }
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|message| ConfigError::InvalidValue {
                key: key.to_string(),
                message,
            }),
        Err(_) => Ok(None),
    }
}
