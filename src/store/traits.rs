//! `StateStore` trait: flat `(namespace, key)` persistence for all core state.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Backend-agnostic key–value store.
///
/// Values are JSON documents. There is no schema beyond the flat
/// `(namespace, key)` lookup; each pair is independently readable/writable.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value. `None` if the pair was never written (or was deleted).
    async fn get(&self, namespace: &str, key: &str)
    -> Result<Option<serde_json::Value>, StoreError>;

    /// Write a value, replacing any previous one (last write wins).
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Delete a value. Returns whether anything was removed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;
}

/// Read and deserialize a typed value.
pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(namespace, key).await? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{namespace}/{key}: {e}"))),
    }
}

/// Serialize and write a typed value.
pub async fn save<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json =
        serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(namespace, key, &json).await
}
