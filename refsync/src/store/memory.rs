use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    Collection, EntityId, Item, ItemStore, LibrarySnapshot, StoreResult,
};
use crate::error::StoreError;
use crate::events::{
    EventExtra, EventKind, MembershipLink, MutAction, MutationEvent, Notifier,
};

/// Field the key manager's write-back lands in.
pub const CITEKEY_FIELD: &str = "citekey";

/// In-memory reference library. Every mutation is reported through the
/// attached [`Notifier`], the way the host application reports its own.
#[derive(Clone, Default)]
pub struct MemoryItemStore {
    items: Arc<RwLock<HashMap<EntityId, Item>>>,
    collections: Arc<RwLock<HashMap<EntityId, Collection>>>,
    notifier: Arc<Mutex<Option<Notifier>>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LibrarySnapshot) -> Self {
        let items = snapshot
            .items
            .into_iter()
            .map(|item| (item.id, item))
            .collect();
        let collections = snapshot
            .collections
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        Self {
            items: Arc::new(RwLock::new(items)),
            collections: Arc::new(RwLock::new(collections)),
            notifier: Arc::new(Mutex::new(None)),
        }
    }

    pub fn attach_notifier(&self, notifier: Notifier) {
        if let Ok(mut slot) = self.notifier.lock() {
            slot.replace(notifier);
        }
    }

    /// Stops reporting mutations. Returns the detached notifier, if any.
    pub fn detach_notifier(&self) -> Option<Notifier> {
        self.notifier.lock().ok().and_then(|mut slot| slot.take())
    }

    fn emit(&self, event: MutationEvent) {
        let notifier = self.notifier.lock().ok().and_then(|n| n.clone());
        match notifier {
            Some(notifier) => {
                if !notifier.notify(event) {
                    warn!("notification queue closed; mutation not reported");
                }
            }
            None => debug!(
                kind = ?event.kind,
                action = ?event.action,
                "no notifier attached; mutation not reported"
            ),
        }
    }

    pub async fn item(&self, id: EntityId) -> Option<Item> {
        self.items.read().await.get(&id).cloned()
    }

    /// Adds or replaces an item; reported as `add` or `modify`.
    pub async fn put_item(&self, item: Item) {
        let id = item.id;
        let existed = self.items.write().await.insert(id, item).is_some();
        let action = if existed {
            MutAction::Modify
        } else {
            MutAction::Add
        };
        self.emit(MutationEvent::items(action, vec![id]));
    }

    pub async fn trash_item(&self, id: EntityId) -> StoreResult<()> {
        {
            let mut items = self.items.write().await;
            let item =
                items.get_mut(&id).ok_or(StoreError::ItemNotFound(id))?;
            item.deleted = true;
        }
        self.emit(MutationEvent::items(MutAction::Trash, vec![id]));
        Ok(())
    }

    /// Erases an item. The notification carries the former parent in its
    /// extra data since the item can no longer be looked up.
    pub async fn delete_item(&self, id: EntityId) -> StoreResult<()> {
        let removed = self
            .items
            .write()
            .await
            .remove(&id)
            .ok_or(StoreError::ItemNotFound(id))?;
        let mut event = MutationEvent::items(MutAction::Delete, vec![id]);
        if let Some(parent) = removed.parent_id {
            event.extra.insert(
                id,
                EventExtra {
                    parent_item_id: Some(parent),
                    ..Default::default()
                },
            );
        }
        self.emit(event);
        Ok(())
    }

    pub async fn put_collection(&self, collection: Collection) {
        let id = collection.id;
        let existed = self
            .collections
            .write()
            .await
            .insert(id, collection)
            .is_some();
        let action = if existed {
            MutAction::Modify
        } else {
            MutAction::Add
        };
        self.emit(MutationEvent::entities(EventKind::Collection, action, vec![
            id,
        ]));
    }

    pub async fn delete_collection(&self, id: EntityId) -> StoreResult<()> {
        self.collections
            .write()
            .await
            .remove(&id)
            .ok_or(StoreError::CollectionNotFound(id))?;
        for item in self.items.write().await.values_mut() {
            item.collections.retain(|c| *c != id);
        }
        self.emit(MutationEvent::entities(
            EventKind::Collection,
            MutAction::Delete,
            vec![id],
        ));
        Ok(())
    }

    pub async fn add_to_collection(
        &self,
        collection_id: EntityId,
        item_id: EntityId,
    ) -> StoreResult<()> {
        if !self.collections.read().await.contains_key(&collection_id) {
            return Err(StoreError::CollectionNotFound(collection_id));
        }
        {
            let mut items = self.items.write().await;
            let item = items
                .get_mut(&item_id)
                .ok_or(StoreError::ItemNotFound(item_id))?;
            if !item.collections.contains(&collection_id) {
                item.collections.push(collection_id);
            }
        }
        self.emit(MutationEvent::collection_items(MutAction::Add, vec![
            MembershipLink::new(collection_id, item_id),
        ]));
        Ok(())
    }

    pub async fn remove_from_collection(
        &self,
        collection_id: EntityId,
        item_id: EntityId,
    ) -> StoreResult<()> {
        {
            let mut items = self.items.write().await;
            let item = items
                .get_mut(&item_id)
                .ok_or(StoreError::ItemNotFound(item_id))?;
            item.collections.retain(|c| *c != collection_id);
        }
        self.emit(MutationEvent::collection_items(MutAction::Delete, vec![
            MembershipLink::new(collection_id, item_id),
        ]));
        Ok(())
    }

    /// Drops every item and collection of a library.
    pub async fn delete_library(&self, library_id: EntityId) {
        self.items
            .write()
            .await
            .retain(|_, item| item.library_id != library_id);
        self.collections
            .write()
            .await
            .retain(|_, c| c.library_id != library_id);
        self.emit(MutationEvent::entities(
            EventKind::Library,
            MutAction::Delete,
            vec![library_id],
        ));
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn items(&self, ids: &[EntityId]) -> StoreResult<Vec<Item>> {
        let items = self.items.read().await;
        Ok(ids.iter().filter_map(|id| items.get(id).cloned()).collect())
    }

    async fn all_items(&self) -> StoreResult<Vec<Item>> {
        let items = self.items.read().await;
        let mut all: Vec<Item> = items.values().cloned().collect();
        all.sort_by_key(|item| item.id);
        Ok(all)
    }

    async fn parent_item(&self, id: EntityId) -> StoreResult<Option<EntityId>> {
        Ok(self
            .items
            .read()
            .await
            .get(&id)
            .and_then(|item| item.parent_id))
    }

    async fn parent_collection(
        &self,
        id: EntityId,
    ) -> StoreResult<Option<EntityId>> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(&id)
            .ok_or(StoreError::CollectionNotFound(id))?;
        Ok(collection.parent_id)
    }

    async fn save_citekey(
        &self,
        id: EntityId,
        citekey: &str,
    ) -> StoreResult<()> {
        {
            let mut items = self.items.write().await;
            let item =
                items.get_mut(&id).ok_or(StoreError::ItemNotFound(id))?;
            item.fields
                .insert(CITEKEY_FIELD.to_string(), citekey.to_string());
        }
        let mut event = MutationEvent::items(MutAction::Modify, vec![id]);
        event.extra.insert(
            id,
            EventExtra {
                citekey_update: true,
                ..Default::default()
            },
        );
        self.emit(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notifier;

    #[tokio::test]
    async fn delete_reports_former_parent() {
        let (queue, mut rx) = Notifier::channel();
        let store = MemoryItemStore::new();
        store.attach_notifier(queue);
        store.put_item(Item::new(1, 1, "PARENT")).await;
        store.put_item(Item::note(2, 1, 1)).await;
        store.delete_item(2).await.unwrap();

        let mut events = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            events.push(evt);
        }
        assert_eq!(events.len(), 3);
        let delete = &events[2];
        assert_eq!(delete.action, MutAction::Delete);
        assert_eq!(delete.ids, vec![2]);
        assert_eq!(delete.extra[&2].parent_item_id, Some(1));
        assert!(store.parent_item(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn citekey_write_back_is_tagged() {
        let (queue, mut rx) = Notifier::channel();
        let store = MemoryItemStore::new();
        store.put_item(Item::new(5, 1, "ABCD")).await;
        store.attach_notifier(queue);
        store.save_citekey(5, "doe2020").await.unwrap();

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.action, MutAction::Modify);
        assert!(evt.is_citekey_update(5));
        assert_eq!(
            store.item(5).await.unwrap().field(CITEKEY_FIELD),
            Some("doe2020")
        );
    }

    #[tokio::test]
    async fn unknown_collection_is_an_error() {
        let store = MemoryItemStore::new();
        assert!(matches!(
            store.parent_collection(9).await,
            Err(StoreError::CollectionNotFound(9))
        ));
    }
}
