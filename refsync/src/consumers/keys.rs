use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ConsumerResult, DerivedKeyStore};
use crate::error::ConsumerError;
use crate::store::{EntityId, Item, ItemStore};

/// Line prefix in an item's `extra` field that pins its citekey.
pub const PINNED_PREFIX: &str = "citation key:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citekey {
    pub item_id: EntityId,
    pub library_id: EntityId,
    pub item_key: String,
    pub citekey: String,
    #[serde(default)]
    pub pinned: bool,
    /// No key could be generated yet; try again on the next change.
    #[serde(default)]
    pub retry: bool,
}

impl Citekey {
    /// How the key shows up in the item list: unpinned keys get a ` *`.
    pub fn display(&self) -> String {
        if self.citekey.is_empty() || self.pinned {
            self.citekey.clone()
        } else {
            format!("{} *", self.citekey)
        }
    }
}

pub trait KeyGenerator: Send + Sync {
    fn generate(&self, item: &Item) -> Option<String>;
}

/// First creator's last name followed by the year, lowercased and stripped
/// to ASCII alphanumerics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyGenerator;

impl KeyGenerator for DefaultKeyGenerator {
    fn generate(&self, item: &Item) -> Option<String> {
        let creator = item
            .field("creator")
            .and_then(|c| c.split([',', ';']).next())
            .and_then(|c| c.split_whitespace().last())
            .map(|name| {
                name.chars()
                    .filter(char::is_ascii_alphanumeric)
                    .collect::<String>()
                    .to_ascii_lowercase()
            })
            .unwrap_or_default();
        let year = item.field("date").and_then(extract_year).unwrap_or("");
        let key = format!("{}{}", creator, year);
        if key.is_empty() { None } else { Some(key) }
    }
}

fn extract_year(date: &str) -> Option<&str> {
    date.as_bytes()
        .windows(4)
        .position(|w| w.iter().all(u8::is_ascii_digit))
        .map(|start| &date[start..start + 4])
}

fn pinned_key(item: &Item) -> Option<String> {
    item.field("extra")?.lines().find_map(|line| {
        let line = line.trim();
        let prefix = line.get(..PINNED_PREFIX.len())?;
        if !prefix.eq_ignore_ascii_case(PINNED_PREFIX) {
            return None;
        }
        let key = line[PINNED_PREFIX.len()..].trim();
        (!key.is_empty()).then(|| key.to_string())
    })
}

/// In-memory citekey index over an [`ItemStore`].
pub struct KeyManager {
    store: Arc<dyn ItemStore>,
    generator: Box<dyn KeyGenerator>,
    keys: RwLock<HashMap<EntityId, Citekey>>,
    persisted: RwLock<Vec<Citekey>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self::with_generator(store, Box::new(DefaultKeyGenerator))
    }

    pub fn with_generator(
        store: Arc<dyn ItemStore>,
        generator: Box<dyn KeyGenerator>,
    ) -> Self {
        Self {
            store,
            generator,
            keys: RwLock::new(HashMap::new()),
            persisted: RwLock::new(Vec::new()),
        }
    }

    /// Records picked up by the next [`load`](DerivedKeyStore::load).
    pub fn with_persisted(self, records: Vec<Citekey>) -> Self {
        Self {
            persisted: RwLock::new(records),
            ..self
        }
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }

    fn compute(&self, item: &Item) -> Citekey {
        let (citekey, pinned, retry) = match pinned_key(item) {
            Some(key) => (key, true, false),
            None => match self.generator.generate(item) {
                Some(key) => (key, false, false),
                None => (String::new(), false, true),
            },
        };
        Citekey {
            item_id: item.id,
            library_id: item.library_id,
            item_key: item.key.clone(),
            citekey,
            pinned,
            retry,
        }
    }

    /// Stores the computed key for `item` and writes it back when it changed.
    async fn assign(&self, item: &Item) -> ConsumerResult<bool> {
        let next = self.compute(item);
        {
            let mut keys = self.keys.write().await;
            if keys.get(&item.id) == Some(&next) {
                return Ok(false);
            }
            keys.insert(item.id, next.clone());
        }
        debug!(
            entity = item.id,
            citekey = %next.citekey,
            pinned = next.pinned,
            retry = next.retry,
            "citekey assigned"
        );
        if next.retry {
            return Ok(true);
        }
        self.store
            .save_citekey(item.id, &next.citekey)
            .await
            .map_err(|e| ConsumerError::Key {
                op: "write-back",
                entity: item.id,
                reason: e.to_string(),
            })?;
        Ok(true)
    }
}

#[async_trait]
impl DerivedKeyStore for KeyManager {
    async fn load(&self) -> ConsumerResult<usize> {
        let records = std::mem::take(&mut *self.persisted.write().await);
        let mut keys = self.keys.write().await;
        let loaded = records.len();
        for record in records {
            keys.insert(record.item_id, record);
        }
        Ok(loaded)
    }

    async fn init(&self) -> ConsumerResult<()> {
        let items = self.store.all_items().await?;
        let known: HashSet<EntityId> = items.iter().map(|i| i.id).collect();
        let stale: Vec<EntityId> = {
            let mut keys = self.keys.write().await;
            let stale = keys
                .keys()
                .filter(|id| !known.contains(*id))
                .copied()
                .collect::<Vec<_>>();
            for id in &stale {
                keys.remove(id);
            }
            stale
        };
        let mut assigned = 0usize;
        for item in items.iter().filter(|i| !i.is_auxiliary() && !i.deleted) {
            match self.assign(item).await {
                Ok(true) => assigned += 1,
                Ok(false) => {}
                Err(e) => warn!(entity = item.id, "key init: {}", e),
            }
        }
        info!(
            items = items.len(),
            assigned,
            stale = stale.len(),
            "key manager initialized"
        );
        Ok(())
    }

    async fn refresh(&self, id: EntityId) -> ConsumerResult<bool> {
        let item = self
            .store
            .items(&[id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ConsumerError::Key {
                op: "refresh",
                entity: id,
                reason: "item not found".into(),
            })?;
        if item.is_auxiliary() {
            return Ok(false);
        }
        self.assign(&item).await
    }

    async fn remove(&self, ids: &[EntityId]) -> ConsumerResult<usize> {
        let mut keys = self.keys.write().await;
        let removed =
            ids.iter().filter(|id| keys.remove(*id).is_some()).count();
        debug!(?ids, removed, "citekeys removed");
        Ok(removed)
    }

    async fn get(&self, id: EntityId) -> Option<Citekey> {
        self.keys.read().await.get(&id).cloned()
    }

    async fn find(
        &self,
        library_id: Option<EntityId>,
        citekey: &str,
    ) -> Option<Citekey> {
        self.keys
            .read()
            .await
            .values()
            .filter(|k| library_id.is_none_or(|lib| k.library_id == lib))
            .filter(|k| k.citekey == citekey)
            .min_by_key(|k| k.item_id)
            .cloned()
    }

    async fn related(&self, item_keys: &[String]) -> Vec<String> {
        let wanted: HashSet<&str> =
            item_keys.iter().map(String::as_str).collect();
        let keys = self.keys.read().await;
        let mut related: Vec<&Citekey> = keys
            .values()
            .filter(|k| wanted.contains(k.item_key.as_str()))
            .collect();
        related.sort_by_key(|k| k.item_id);
        related.into_iter().map(|k| k.citekey.clone()).collect()
    }
}
