//! Incremental synchronization: cursor store and change resolver.

pub mod cursor;
pub mod resolver;

pub use cursor::{AdvanceOutcome, CursorStore, register_watch};
pub use resolver::{ChangeResolver, SelectionPolicy};
