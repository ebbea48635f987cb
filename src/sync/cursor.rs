//! Cursor store: the mailbox's last-seen change-log position.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ExternalError, ResolveError, StoreError};
use crate::mailbox::WatchApi;
use crate::store::traits::{StateStore, load, save};

/// Namespace holding the cursor.
pub const SYNC_NAMESPACE: &str = "sync";
/// Key of the cursor position.
pub const CURSOR_KEY: &str = "cursor";

/// What `advance` did with a proposed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Cursor moved forward (or was replaced by an opaque token).
    Advanced { from: String, to: String },
    /// Proposed position equals the stored one.
    Unchanged,
    /// Proposed position is behind the stored one; cursor kept.
    Stale { current: String, proposed: String },
}

/// Compare two positions when both are numeric. Opaque tokens are not ordered.
fn compare_positions(a: &str, b: &str) -> Option<Ordering> {
    let a: u64 = a.trim().parse().ok()?;
    let b: u64 = b.trim().parse().ok()?;
    Some(a.cmp(&b))
}

/// Persists and advances the synchronization position.
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn StateStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Current position, or `None` if no watch was ever registered.
    pub async fn read(&self) -> Result<Option<String>, StoreError> {
        load(self.store.as_ref(), SYNC_NAMESPACE, CURSOR_KEY).await
    }

    /// Current position; absence is `CursorUninitialized`, never `"0"`.
    pub async fn require(&self) -> Result<String, ResolveError> {
        self.read().await?.ok_or(ResolveError::CursorUninitialized)
    }

    /// Unconditional write. Last write wins.
    pub async fn write(&self, position: &str) -> Result<(), StoreError> {
        save(self.store.as_ref(), SYNC_NAMESPACE, CURSOR_KEY, position).await
    }

    /// Move the cursor to `position` unless that would move it backwards.
    ///
    /// Numeric positions never regress, so a late redelivery cannot rewind the
    /// cursor. Non-numeric tokens cannot be ordered and are written as given.
    pub async fn advance(&self, position: &str) -> Result<AdvanceOutcome, StoreError> {
        let current = self.read().await?;

        let outcome = match current {
            None => AdvanceOutcome::Advanced {
                from: String::new(),
                to: position.to_string(),
            },
            Some(current) if current == position => AdvanceOutcome::Unchanged,
            Some(current) => match compare_positions(position, &current) {
                Some(Ordering::Less) => AdvanceOutcome::Stale {
                    current,
                    proposed: position.to_string(),
                },
                _ => AdvanceOutcome::Advanced {
                    from: current,
                    to: position.to_string(),
                },
            },
        };

        match &outcome {
            AdvanceOutcome::Advanced { from, to } => {
                self.write(to).await?;
                debug!(from = %from, to = %to, "Cursor advanced");
            }
            AdvanceOutcome::Unchanged => debug!(position = %position, "Cursor unchanged"),
            AdvanceOutcome::Stale { current, proposed } => {
                warn!(current = %current, proposed = %proposed, "Ignoring stale cursor position");
            }
        }
        Ok(outcome)
    }
}

/// Failure while registering the mailbox watch.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watch registration failed: {0}")]
    Api(#[from] ExternalError),

    #[error("Failed to persist initial cursor: {0}")]
    Store(#[from] StoreError),
}

/// Register the mailbox watch and store the returned position as the cursor.
///
/// This is the out-of-band step that must run before any notification can be
/// resolved.
pub async fn register_watch(
    watch: &dyn WatchApi,
    cursor: &CursorStore,
) -> Result<String, WatchError> {
    let position = watch.watch().await?;
    cursor.write(&position).await?;
    info!(position = %position, "Mailbox watch registered");
    Ok(position)
}
