use std::collections::HashSet;

use tracing::{debug, warn};

use super::types::{EventKind, MembershipLink, MutAction, MutationEvent};
use crate::store::{EntityId, Item, ItemStore};

#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    pub action: MutAction,
    /// Affected IDs left after dropping self-inflicted updates, in arrival
    /// order. This is what the domain event reports.
    pub direct: Vec<EntityId>,
    /// Enumerated items that own derived state. Always empty for deletions.
    pub primary: Vec<Item>,
    /// Parents standing in for changed notes and attachments.
    pub related: Vec<EntityId>,
    /// Notes and attachments whose parent could not be resolved.
    pub orphans: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Noop(&'static str),
    Items(ItemChange),
    CollectionMembership(Vec<MembershipLink>),
    CollectionsRemoved(Vec<EntityId>),
    LibrariesRemoved(Vec<EntityId>),
}

pub async fn classify(
    event: &MutationEvent,
    store: &dyn ItemStore,
) -> Classification {
    match event.kind {
        EventKind::Item => classify_items(event, store).await,
        EventKind::CollectionItem if event.links.is_empty() => {
            Classification::Noop("no membership links")
        }
        EventKind::CollectionItem => {
            Classification::CollectionMembership(event.links.clone())
        }
        EventKind::Collection => match removal_ids(event) {
            Some(ids) => Classification::CollectionsRemoved(ids),
            None => Classification::Noop("collection change without removal"),
        },
        EventKind::Library => match removal_ids(event) {
            Some(ids) => Classification::LibrariesRemoved(ids),
            None => Classification::Noop("library change without removal"),
        },
        EventKind::Unknown => Classification::Noop("unrecognized event kind"),
    }
}

fn removal_ids(event: &MutationEvent) -> Option<Vec<EntityId>> {
    if event.action == MutAction::Delete && !event.ids.is_empty() {
        Some(dedup(event.ids.iter().copied()))
    } else {
        None
    }
}

fn dedup(ids: impl Iterator<Item = EntityId>) -> Vec<EntityId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

async fn classify_items(
    event: &MutationEvent,
    store: &dyn ItemStore,
) -> Classification {
    if event.action == MutAction::Other {
        return Classification::Noop("unsupported item action");
    }

    // The key manager's own write-back must not trigger another refresh.
    let direct = dedup(event.ids.iter().copied().filter(|id| {
        event.action != MutAction::Modify || !event.is_citekey_update(*id)
    }));
    if direct.is_empty() {
        return Classification::Noop("no affected items left");
    }

    let mut change = ItemChange {
        action: event.action,
        direct,
        primary: Vec::new(),
        related: Vec::new(),
        orphans: Vec::new(),
    };

    if event.action == MutAction::Delete {
        resolve_deleted_parents(event, store, &mut change).await;
    } else {
        split_enumerated(store, &mut change).await;
    }
    Classification::Items(change)
}

/// Deleted items cannot be enumerated; their former parent travels in the
/// event's extra data, with the parent relation as a fallback.
async fn resolve_deleted_parents(
    event: &MutationEvent,
    store: &dyn ItemStore,
    change: &mut ItemChange,
) {
    for id in &change.direct {
        let hinted = event.extra.get(id).and_then(|e| e.parent_item_id);
        let parent = match hinted {
            Some(parent) => Some(parent),
            None => match store.parent_item(*id).await {
                Ok(parent) => parent,
                Err(e) => {
                    debug!(entity = id, "parent lookup for deleted item: {}", e);
                    None
                }
            },
        };
        if let Some(parent) = parent {
            change.related.push(parent);
        }
    }
}

async fn split_enumerated(store: &dyn ItemStore, change: &mut ItemChange) {
    let items = match store.items(&change.direct).await {
        Ok(items) => items,
        Err(e) => {
            warn!(ids = ?change.direct, "failed to enumerate changed items: {}", e);
            return;
        }
    };
    for item in items {
        if !item.is_auxiliary() {
            change.primary.push(item);
            continue;
        }
        match item.parent_id {
            Some(parent) => change.related.push(parent),
            None => {
                debug!(
                    entity = item.id,
                    kind = ?item.kind,
                    "orphaned note/attachment; excluded from invalidation"
                );
                change.orphans.push(item.id);
            }
        }
    }
}
