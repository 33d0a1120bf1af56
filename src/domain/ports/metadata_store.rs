//! Transient metadata store port.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::errors::OrchResult;

/// Namespaced KV surface for orchestrator metadata.
///
/// Values are opaque payloads the writing orchestrator interprets; there are
/// no ordering guarantees beyond what one orchestrator serializes into a
/// single value. Entries are written before child states are created and
/// deleted after the last child completes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn store(&self, key: &str, value: &Value) -> OrchResult<()>;

    async fn load(&self, key: &str) -> OrchResult<Option<Value>>;

    async fn delete(&self, key: &str) -> OrchResult<()>;

    async fn exists(&self, key: &str) -> OrchResult<bool>;
}

/// Typed helpers over the opaque payloads.
#[async_trait]
pub trait MetadataStoreExt: MetadataStore {
    async fn store_as<T: Serialize + Sync>(&self, key: &str, value: &T) -> OrchResult<()> {
        let value = serde_json::to_value(value)?;
        self.store(key, &value).await
    }

    async fn load_as<T: DeserializeOwned + Send>(&self, key: &str) -> OrchResult<Option<T>> {
        match self.load(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<M: MetadataStore + ?Sized> MetadataStoreExt for M {}
