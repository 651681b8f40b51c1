//! Derived subsystems fed by the change dispatcher.

pub mod auto_export;
pub mod cache;
pub mod keys;

use async_trait::async_trait;

use crate::error::ConsumerError;
use crate::store::{EntityId, Item};

pub use auto_export::{
    AutoExportJobs, ExportJob, ExportRequest, ExportScope, ExportTarget,
    JobId, JobStatus,
};
pub use cache::{CacheSelector, CachedReference, MemorySerializationCache};
pub use keys::{Citekey, DefaultKeyGenerator, KeyGenerator, KeyManager};

pub type ConsumerResult<T> = Result<T, ConsumerError>;

#[async_trait]
pub trait DerivedKeyStore: Send + Sync {
    /// Loads the persisted key index.
    async fn load(&self) -> ConsumerResult<usize> {
        Ok(0)
    }

    /// Brings the index in line with the item store.
    async fn init(&self) -> ConsumerResult<()> {
        Ok(())
    }

    /// Recomputes the key of one item. Returns true when the key changed;
    /// refreshing a current key is a no-op.
    async fn refresh(&self, id: EntityId) -> ConsumerResult<bool>;

    async fn remove(&self, ids: &[EntityId]) -> ConsumerResult<usize>;

    async fn get(&self, id: EntityId) -> Option<Citekey>;

    /// Looks a citekey up within one library, or across all of them when
    /// `library_id` is `None`. Ties go to the lowest item ID.
    async fn find(
        &self,
        library_id: Option<EntityId>,
        citekey: &str,
    ) -> Option<Citekey>;

    /// Citekeys of the items with the given item keys, in item ID order.
    async fn related(&self, item_keys: &[String]) -> Vec<String>;
}

#[async_trait]
pub trait SerializationCache: Send + Sync {
    async fn init(&self) -> ConsumerResult<()> {
        Ok(())
    }

    async fn ensure_collection(&self, name: &str) -> ConsumerResult<()>;

    /// Drops every entry of every collection keyed by one of `ids`.
    async fn evict(&self, ids: &[EntityId], reason: &str)
    -> ConsumerResult<usize>;

    async fn fetch(
        &self,
        collection: &str,
        selector: &CacheSelector,
    ) -> ConsumerResult<Option<CachedReference>>;

    async fn store(
        &self,
        collection: &str,
        selector: CacheSelector,
        reference: String,
        metadata: serde_json::Value,
    ) -> ConsumerResult<()>;
}

#[async_trait]
pub trait AutoExportScheduler: Send + Sync {
    async fn init(&self) -> ConsumerResult<()> {
        Ok(())
    }

    /// Schedules jobs whose target contains one of `items`. Returns the
    /// number of jobs scheduled.
    async fn notify_changed(&self, items: &[Item]) -> ConsumerResult<usize>;

    async fn collections_changed(
        &self,
        _ids: &[EntityId],
    ) -> ConsumerResult<usize> {
        Ok(0)
    }

    async fn collections_removed(
        &self,
        _ids: &[EntityId],
    ) -> ConsumerResult<usize> {
        Ok(0)
    }

    async fn libraries_removed(
        &self,
        _ids: &[EntityId],
    ) -> ConsumerResult<usize> {
        Ok(0)
    }
}
