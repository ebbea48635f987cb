//! Error types for mail triage.

/// Top-level error type for the triage core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Side effect error: {0}")]
    SideEffect(#[from] SideEffectError),

    #[error("Digest error: {0}")]
    Digest(#[from] DigestError),

    #[error("External API error: {0}")]
    External(#[from] ExternalError),

    #[error("Invalid notification: {0}")]
    Notification(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors reported by external collaborators (mail API, label API, sinks).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{service} API call failed: {reason}")]
    Api { service: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
}

/// Failures while turning a notification into concrete messages.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Sync cursor not initialized; register a watch first")]
    CursorUninitialized,

    #[error("No new messages in change log since position {from}")]
    NoNewMessage { from: String },

    #[error("No subject found for message {message_id}")]
    NoSubject { message_id: String },

    #[error("No sender found for message {message_id}")]
    NoSender { message_id: String },

    #[error("Ignoring self-originated message {message_id} from {sender}")]
    SelfOriginated { message_id: String, sender: String },

    #[error("Change log read failed: {0}")]
    ChangeLog(ExternalError),

    #[error("Message fetch failed for {message_id}: {source}")]
    Fetch {
        message_id: String,
        source: ExternalError,
    },

    #[error("Cursor store error: {0}")]
    Store(#[from] StoreError),
}

impl ResolveError {
    /// Malformed, self-originated, or empty-window failures.
    ///
    /// These are expected outcomes of at-least-once delivery and are logged
    /// and swallowed rather than treated as faults.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            Self::NoNewMessage { .. }
                | Self::NoSubject { .. }
                | Self::NoSender { .. }
                | Self::SelfOriginated { .. }
        )
    }
}

/// Label, archive, or send failures in the orchestrator consumers.
#[derive(Debug, thiserror::Error)]
pub enum SideEffectError {
    #[error("Failed to resolve label {name}: {source}")]
    Label { name: String, source: ExternalError },

    #[error("Failed to apply labels to {message_id}: {source}")]
    Apply {
        message_id: String,
        source: ExternalError,
    },

    #[error("Failed to send reply to {message_id}: {source}")]
    Send {
        message_id: String,
        source: ExternalError,
    },

    #[error("Ledger update failed: {0}")]
    Ledger(#[from] StoreError),
}

/// Digest aggregation errors.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("No processed messages to summarize")]
    Empty,

    #[error("Digest publish failed: {0}")]
    Publish(ExternalError),

    #[error("Digest store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid digest schedule: {0}")]
    Schedule(String),
}

/// Result type alias for the triage core.
pub type Result<T> = std::result::Result<T, Error>;
