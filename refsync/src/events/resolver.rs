use std::collections::BTreeSet;

use tracing::debug;

use super::classifier::ItemChange;
use super::types::MembershipLink;
use crate::store::{EntityId, ItemStore};

/// Deduplicated set of entity IDs whose derived state must be invalidated
/// for one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeSet<EntityId>);

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `id` was already present.
    pub fn insert(&mut self, id: EntityId) -> bool {
        self.0.insert(id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<EntityId> {
        self.iter().collect()
    }
}

impl FromIterator<EntityId> for ChangeSet {
    fn from_iter<T: IntoIterator<Item = EntityId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<EntityId> for ChangeSet {
    fn extend<T: IntoIterator<Item = EntityId>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

/// Item caches depend on at most one parent hop: the changed items plus the
/// parents of changed notes and attachments. Orphans are left out.
pub fn item_change_set(change: &ItemChange) -> ChangeSet {
    let mut set: ChangeSet = change
        .direct
        .iter()
        .copied()
        .filter(|id| !change.orphans.contains(id))
        .collect();
    set.extend(change.related.iter().copied());
    set
}

/// Every collection on the path from each link's collection up to its root.
/// A node already in the set ends the walk, which also breaks cycles in a
/// corrupt hierarchy.
pub async fn ancestor_change_set(
    links: &[MembershipLink],
    store: &dyn ItemStore,
) -> ChangeSet {
    let mut changed = ChangeSet::new();
    for link in links {
        let mut current = Some(link.collection_id);
        while let Some(id) = current {
            if !changed.insert(id) {
                break;
            }
            current = match store.parent_collection(id).await {
                Ok(parent) => parent,
                Err(e) => {
                    debug!(collection = id, link = %link, "ancestor walk stopped: {}", e);
                    None
                }
            };
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::events::MutAction;
    use crate::store::{Collection, Item, MemoryItemStore, StoreResult};

    struct CountingStore {
        inner: MemoryItemStore,
        walks: AtomicUsize,
    }

    #[async_trait]
    impl ItemStore for CountingStore {
        async fn items(&self, ids: &[EntityId]) -> StoreResult<Vec<Item>> {
            self.inner.items(ids).await
        }

        async fn all_items(&self) -> StoreResult<Vec<Item>> {
            self.inner.all_items().await
        }

        async fn parent_item(
            &self,
            id: EntityId,
        ) -> StoreResult<Option<EntityId>> {
            self.inner.parent_item(id).await
        }

        async fn parent_collection(
            &self,
            id: EntityId,
        ) -> StoreResult<Option<EntityId>> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            self.inner.parent_collection(id).await
        }

        async fn save_citekey(
            &self,
            id: EntityId,
            citekey: &str,
        ) -> StoreResult<()> {
            self.inner.save_citekey(id, citekey).await
        }
    }

    fn collection(id: EntityId, parent: Option<EntityId>) -> Collection {
        Collection {
            id,
            library_id: 1,
            parent_id: parent,
            name: format!("c{}", id),
        }
    }

    async fn chain_store() -> CountingStore {
        let inner = MemoryItemStore::new();
        // 7 -> 3 -> 1, 8 -> 3
        inner.put_collection(collection(1, None)).await;
        inner.put_collection(collection(3, Some(1))).await;
        inner.put_collection(collection(7, Some(3))).await;
        inner.put_collection(collection(8, Some(3))).await;
        CountingStore {
            inner,
            walks: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn walks_to_root() {
        let store = chain_store().await;
        let set =
            ancestor_change_set(&[MembershipLink::new(7, 101)], &store).await;
        assert_eq!(set.to_vec(), vec![1, 3, 7]);
    }

    #[tokio::test]
    async fn shared_ancestors_are_walked_once() {
        let store = chain_store().await;
        let links = [
            MembershipLink::new(7, 101),
            MembershipLink::new(7, 102),
            MembershipLink::new(8, 103),
        ];
        let set = ancestor_change_set(&links, &store).await;
        assert_eq!(set.to_vec(), vec![1, 3, 7, 8]);
        // 7, 3, 1 for the first link; only 8 for the third
        assert_eq!(store.walks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cyclic_hierarchy_terminates() {
        let inner = MemoryItemStore::new();
        inner.put_collection(collection(1, Some(2))).await;
        inner.put_collection(collection(2, Some(1))).await;
        let set = ancestor_change_set(&[MembershipLink::new(1, 5)], &inner)
            .await;
        assert_eq!(set.to_vec(), vec![1, 2]);
    }

    #[tokio::test]
    async fn missing_collection_keeps_what_was_found() {
        let inner = MemoryItemStore::new();
        inner.put_collection(collection(4, Some(99))).await;
        let set = ancestor_change_set(&[MembershipLink::new(4, 5)], &inner)
            .await;
        assert_eq!(set.to_vec(), vec![4, 99]);
    }

    #[test]
    fn item_set_adds_parents_and_skips_orphans() {
        let change = ItemChange {
            action: MutAction::Modify,
            direct: vec![10, 11, 12, 10],
            primary: Vec::new(),
            related: vec![1, 1],
            orphans: vec![12],
        };
        let set = item_change_set(&change);
        assert_eq!(set.to_vec(), vec![1, 10, 11]);
    }
}
