//! Persistence layer: namespaced key–value state for cursor and ledger.

pub mod ledger;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use ledger::Ledger;
pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::StateStore;
