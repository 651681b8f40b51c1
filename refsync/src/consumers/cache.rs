use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ConsumerResult, SerializationCache};
use crate::error::ConsumerError;
use crate::store::EntityId;

/// Identifies one cached serialization: the item plus every export option
/// that changes the output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheSelector {
    pub item_id: EntityId,
    pub export_notes: bool,
    pub use_journal_abbreviation: bool,
    /// Preference overrides that affect serialization.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl CacheSelector {
    pub fn new(item_id: EntityId) -> Self {
        Self {
            item_id,
            export_notes: false,
            use_journal_abbreviation: false,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(
        mut self,
        pref: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.overrides.insert(pref.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReference {
    pub selector: CacheSelector,
    pub reference: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub last_access_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

type Collection = HashMap<CacheSelector, CachedReference>;

/// Per-translator serialization cache held in memory.
#[derive(Default)]
pub struct MemorySerializationCache {
    collections: RwLock<HashMap<String, Collection>>,
    initial: Vec<String>,
}

impl MemorySerializationCache {
    /// `collections` are created by [`init`](SerializationCache::init).
    pub fn new(collections: Vec<String>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            initial: collections,
        }
    }

    pub async fn len(&self, collection: &str) -> Option<usize> {
        self.collections.read().await.get(collection).map(|c| c.len())
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SerializationCache for MemorySerializationCache {
    async fn init(&self) -> ConsumerResult<()> {
        let mut collections = self.collections.write().await;
        for name in &self.initial {
            collections.entry(name.clone()).or_default();
        }
        info!(collections = collections.len(), "serialization cache ready");
        Ok(())
    }

    async fn ensure_collection(&self, name: &str) -> ConsumerResult<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn evict(
        &self,
        ids: &[EntityId],
        reason: &str,
    ) -> ConsumerResult<usize> {
        let ids: HashSet<EntityId> = ids.iter().copied().collect();
        let mut evicted = 0usize;
        for collection in self.collections.write().await.values_mut() {
            let before = collection.len();
            collection.retain(|selector, _| !ids.contains(&selector.item_id));
            evicted += before - collection.len();
        }
        debug!(evicted, reason, "cache eviction");
        Ok(evicted)
    }

    async fn fetch(
        &self,
        collection: &str,
        selector: &CacheSelector,
    ) -> ConsumerResult<Option<CachedReference>> {
        let mut collections = self.collections.write().await;
        let entries = collections.get_mut(collection).ok_or_else(|| {
            ConsumerError::MissingCacheCollection(collection.to_string())
        })?;
        match entries.get_mut(selector) {
            Some(cached) => {
                debug!(collection, item = selector.item_id, "cache hit");
                // keeps the entry from being reaped early
                cached.last_access_ms = now_ms();
                Ok(Some(cached.clone()))
            }
            None => {
                debug!(collection, item = selector.item_id, "cache miss");
                Ok(None)
            }
        }
    }

    async fn store(
        &self,
        collection: &str,
        selector: CacheSelector,
        reference: String,
        metadata: serde_json::Value,
    ) -> ConsumerResult<()> {
        let mut collections = self.collections.write().await;
        let entries = collections.get_mut(collection).ok_or_else(|| {
            ConsumerError::MissingCacheCollection(collection.to_string())
        })?;
        let updated = entries
            .insert(selector.clone(), CachedReference {
                selector,
                reference,
                metadata,
                last_access_ms: now_ms(),
            })
            .is_some();
        debug!(collection, updated, "cache store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache() -> MemorySerializationCache {
        let cache = MemorySerializationCache::new(vec![
            "Better BibTeX".into(),
            "Better CSL JSON".into(),
        ]);
        cache.init().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn store_then_fetch_by_selector() {
        let cache = cache().await;
        let selector = CacheSelector::new(1);
        cache
            .store(
                "Better BibTeX",
                selector.clone(),
                "@article{doe2020}".into(),
                serde_json::json!({"dirty": false}),
            )
            .await
            .unwrap();

        let hit = cache.fetch("Better BibTeX", &selector).await.unwrap();
        assert_eq!(hit.unwrap().reference, "@article{doe2020}");

        let other = CacheSelector {
            export_notes: true,
            ..selector.clone()
        };
        assert!(cache.fetch("Better BibTeX", &other).await.unwrap().is_none());
        assert!(
            cache
                .fetch("Better CSL JSON", &selector)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn evict_spans_collections() {
        let cache = cache().await;
        for collection in ["Better BibTeX", "Better CSL JSON"] {
            for id in [1, 2] {
                cache
                    .store(
                        collection,
                        CacheSelector::new(id),
                        format!("ref {}", id),
                        serde_json::Value::Null,
                    )
                    .await
                    .unwrap();
            }
        }
        cache
            .store(
                "Better BibTeX",
                CacheSelector::new(1).with_override("asciiBibTeX", "true"),
                "ascii".into(),
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let evicted = cache.evict(&[1, 42], "item 1 changed").await.unwrap();
        assert_eq!(evicted, 3);
        assert_eq!(cache.len("Better BibTeX").await, Some(1));
        assert_eq!(cache.len("Better CSL JSON").await, Some(1));
    }

    #[tokio::test]
    async fn missing_collection_is_reported() {
        let cache = cache().await;
        let err = cache
            .fetch("Unknown Translator", &CacheSelector::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::MissingCacheCollection(_)));
        cache.ensure_collection("Unknown Translator").await.unwrap();
        assert!(
            cache
                .fetch("Unknown Translator", &CacheSelector::new(1))
                .await
                .unwrap()
                .is_none()
        );
    }
}
