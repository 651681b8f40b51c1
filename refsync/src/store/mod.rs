pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::MemoryItemStore;

/// Opaque identifier, unique within its entity kind and library only.
pub type EntityId = u64;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Regular,
    Note,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: EntityId,
    pub library_id: EntityId,
    pub key: String,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub collections: Vec<EntityId>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Item {
    pub fn new(id: EntityId, library_id: EntityId, key: impl Into<String>) -> Self {
        Self {
            id,
            library_id,
            key: key.into(),
            kind: ItemKind::Regular,
            parent_id: None,
            collections: Vec::new(),
            fields: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn note(id: EntityId, library_id: EntityId, parent: EntityId) -> Self {
        Self {
            kind: ItemKind::Note,
            parent_id: Some(parent),
            ..Self::new(id, library_id, format!("NOTE{}", id))
        }
    }

    pub fn attachment(
        id: EntityId,
        library_id: EntityId,
        parent: EntityId,
    ) -> Self {
        Self {
            kind: ItemKind::Attachment,
            parent_id: Some(parent),
            ..Self::new(id, library_id, format!("ATT{}", id))
        }
    }

    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn in_collection(mut self, collection: EntityId) -> Self {
        self.collections.push(collection);
        self
    }

    /// Notes and attachments carry no derived state of their own.
    pub fn is_auxiliary(&self) -> bool {
        matches!(self.kind, ItemKind::Note | ItemKind::Attachment)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: EntityId,
    pub library_id: EntityId,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub name: String,
}

/// Read side of the external reference library, plus the single write the
/// key manager performs.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Items that still exist among `ids`, in request order. Unknown IDs are
    /// skipped.
    async fn items(&self, ids: &[EntityId]) -> StoreResult<Vec<Item>>;

    async fn all_items(&self) -> StoreResult<Vec<Item>>;

    /// Parent relation for notes and attachments.
    async fn parent_item(&self, id: EntityId) -> StoreResult<Option<EntityId>>;

    /// Collection hierarchy link.
    async fn parent_collection(
        &self,
        id: EntityId,
    ) -> StoreResult<Option<EntityId>>;

    /// Writes a derived citekey back onto the item. The store must tag the
    /// resulting modify notification as a citekey update so it is not
    /// dispatched again.
    async fn save_citekey(
        &self,
        id: EntityId,
        citekey: &str,
    ) -> StoreResult<()>;
}

/// Library snapshot used to seed an in-memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub collections: Vec<Collection>,
}
