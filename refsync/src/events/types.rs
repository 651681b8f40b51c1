use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Item,
    Collection,
    Library,
    CollectionItem,
    /// Anything the store reports that this core does not track.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutAction {
    Add,
    Modify,
    Delete,
    Trash,
    #[serde(other)]
    Other,
}

impl MutAction {
    pub fn is_removal(&self) -> bool {
        matches!(self, MutAction::Delete | MutAction::Trash)
    }
}

/// Per-ID metadata attached by the producer of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventExtra {
    /// Set on modifications caused by the key manager writing a citekey back.
    #[serde(default, alias = "bbtCitekeyUpdate")]
    pub citekey_update: bool,
    /// Former parent of a deleted note or attachment.
    #[serde(default, alias = "parentItemID")]
    pub parent_item_id: Option<EntityId>,
}

/// Collection membership link, written `<collection>-<item>` by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MembershipLink {
    pub collection_id: EntityId,
    pub item_id: EntityId,
}

impl MembershipLink {
    pub fn new(collection_id: EntityId, item_id: EntityId) -> Self {
        Self {
            collection_id,
            item_id,
        }
    }
}

impl fmt::Display for MembershipLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.collection_id, self.item_id)
    }
}

impl FromStr for MembershipLink {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, item) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed membership link `{}`", s))?;
        let collection_id = collection
            .parse()
            .map_err(|_| format!("malformed collection id in `{}`", s))?;
        let item_id = item
            .parse()
            .map_err(|_| format!("malformed item id in `{}`", s))?;
        Ok(Self::new(collection_id, item_id))
    }
}

impl TryFrom<String> for MembershipLink {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MembershipLink> for String {
    fn from(value: MembershipLink) -> Self {
        value.to_string()
    }
}

/// Raw notification from the external store. `ids` is used by every kind
/// except `collection-item`, which reports membership `links` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub kind: EventKind,
    pub action: MutAction,
    #[serde(default)]
    pub ids: Vec<EntityId>,
    #[serde(default)]
    pub links: Vec<MembershipLink>,
    #[serde(default)]
    pub extra: HashMap<EntityId, EventExtra>,
}

impl MutationEvent {
    pub fn entities(
        kind: EventKind,
        action: MutAction,
        ids: Vec<EntityId>,
    ) -> Self {
        Self {
            kind,
            action,
            ids,
            links: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn items(action: MutAction, ids: Vec<EntityId>) -> Self {
        Self::entities(EventKind::Item, action, ids)
    }

    pub fn collection_items(
        action: MutAction,
        links: Vec<MembershipLink>,
    ) -> Self {
        Self {
            kind: EventKind::CollectionItem,
            action,
            ids: Vec::new(),
            links,
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, id: EntityId, extra: EventExtra) -> Self {
        self.extra.insert(id, extra);
        self
    }

    pub fn is_citekey_update(&self, id: EntityId) -> bool {
        self.extra
            .get(&id)
            .map(|extra| extra.citekey_update)
            .unwrap_or(false)
    }
}

/// Normalized event published to external subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "ids", rename_all = "kebab-case")]
pub enum DomainEvent {
    ItemsChanged(Vec<EntityId>),
    ItemsRemoved(Vec<EntityId>),
    CollectionsChanged(Vec<EntityId>),
    CollectionsRemoved(Vec<EntityId>),
    LibrariesRemoved(Vec<EntityId>),
    Loaded,
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ItemsChanged(_) => "items-changed",
            DomainEvent::ItemsRemoved(_) => "items-removed",
            DomainEvent::CollectionsChanged(_) => "collections-changed",
            DomainEvent::CollectionsRemoved(_) => "collections-removed",
            DomainEvent::LibrariesRemoved(_) => "libraries-removed",
            DomainEvent::Loaded => "loaded",
        }
    }

    pub fn ids(&self) -> &[EntityId] {
        match self {
            DomainEvent::ItemsChanged(ids)
            | DomainEvent::ItemsRemoved(ids)
            | DomainEvent::CollectionsChanged(ids)
            | DomainEvent::CollectionsRemoved(ids)
            | DomainEvent::LibrariesRemoved(ids) => ids,
            DomainEvent::Loaded => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_link_parses_store_format() {
        let link: MembershipLink = "7-101".parse().unwrap();
        assert_eq!(link, MembershipLink::new(7, 101));
        assert_eq!(link.to_string(), "7-101");
        assert!("7".parse::<MembershipLink>().is_err());
        assert!("x-1".parse::<MembershipLink>().is_err());
    }

    #[test]
    fn mutation_event_from_store_json() {
        let evt: MutationEvent = serde_json::from_str(
            r#"{"kind":"item","action":"modify","ids":[1,2],
                "extra":{"2":{"bbtCitekeyUpdate":true}}}"#,
        )
        .unwrap();
        assert_eq!(evt.kind, EventKind::Item);
        assert_eq!(evt.action, MutAction::Modify);
        assert!(!evt.is_citekey_update(1));
        assert!(evt.is_citekey_update(2));

        let evt: MutationEvent = serde_json::from_str(
            r#"{"kind":"collection-item","action":"add","links":["7-101"]}"#,
        )
        .unwrap();
        assert_eq!(evt.links, vec![MembershipLink::new(7, 101)]);
    }

    #[test]
    fn unrecognized_kind_and_action_still_parse() {
        let evt: MutationEvent = serde_json::from_str(
            r#"{"kind":"search","action":"refresh","ids":[3]}"#,
        )
        .unwrap();
        assert_eq!(evt.kind, EventKind::Unknown);
        assert_eq!(evt.action, MutAction::Other);
    }

    #[test]
    fn domain_event_wire_shape() {
        let json =
            serde_json::to_value(DomainEvent::ItemsRemoved(vec![42])).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "items-removed", "ids": [42]})
        );
        assert_eq!(DomainEvent::Loaded.name(), "loaded");
        assert!(DomainEvent::Loaded.ids().is_empty());
    }
}
