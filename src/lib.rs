//! Mail triage: notification-driven mailbox classification, labeling,
//! auto-reply and periodic digests.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod sink;
pub mod store;
pub mod sync;
pub mod testing;
