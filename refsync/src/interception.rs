//! Decorators over host operations that need citekey awareness.
//!
//! Each host capability is a trait; the decorators answer what they own and
//! delegate the rest to the wrapped host implementation.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::consumers::{CacheSelector, DerivedKeyStore, SerializationCache};
use crate::error::{RefSyncError, StoreError};
use crate::readiness::ReadinessGate;
use crate::store::{EntityId, Item, ItemStore, MemoryItemStore};

/// Shown in place of a citekey that is not available yet.
pub const PENDING_CITEKEY: &str = "\u{FFFD}";

const VIRTUAL_FIELDS: [&str; 2] = ["citekey", "itemID"];

#[async_trait]
pub trait FieldSource: Send + Sync {
    async fn field(&self, item_id: EntityId, field: &str) -> Option<String>;

    /// Returns false when the field cannot be written.
    async fn set_field(
        &self,
        item_id: EntityId,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError>;
}

/// Adds the read-only `citekey` and `itemID` fields to a host field source.
pub struct CitekeyFields<S> {
    inner: S,
    keys: Arc<dyn DerivedKeyStore>,
    gate: ReadinessGate,
}

impl<S: FieldSource> CitekeyFields<S> {
    pub fn new(
        inner: S,
        keys: Arc<dyn DerivedKeyStore>,
        gate: ReadinessGate,
    ) -> Self {
        Self { inner, keys, gate }
    }
}

#[async_trait]
impl<S: FieldSource> FieldSource for CitekeyFields<S> {
    async fn field(&self, item_id: EntityId, field: &str) -> Option<String> {
        match field {
            "citekey" => {
                if !self.gate.is_loaded() {
                    return Some(PENDING_CITEKEY.to_string());
                }
                match self.keys.get(item_id).await {
                    Some(key) if key.retry => Some(PENDING_CITEKEY.to_string()),
                    Some(key) => Some(key.display()),
                    None => self.inner.field(item_id, field).await,
                }
            }
            "itemID" => Some(item_id.to_string()),
            _ => self.inner.field(item_id, field).await,
        }
    }

    async fn set_field(
        &self,
        item_id: EntityId,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        if VIRTUAL_FIELDS.contains(&field) {
            debug!(item = item_id, field, "refusing write to virtual field");
            return Ok(false);
        }
        self.inner.set_field(item_id, field, value).await
    }
}

#[async_trait]
impl FieldSource for MemoryItemStore {
    async fn field(&self, item_id: EntityId, field: &str) -> Option<String> {
        self.item(item_id)
            .await
            .and_then(|item| item.field(field).map(str::to_string))
    }

    async fn set_field(
        &self,
        item_id: EntityId,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut item = self
            .item(item_id)
            .await
            .ok_or(StoreError::ItemNotFound(item_id))?;
        item.fields.insert(field.to_string(), value.to_string());
        self.put_item(item).await;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryKey {
    pub library_id: EntityId,
    pub key: String,
}

/// Turns an external reference into a `(library, item key)` pair.
#[async_trait]
pub trait LibraryKeyResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Option<LibraryKey>;
}

/// Host references are written `<library>_<item key>`.
#[async_trait]
impl LibraryKeyResolver for MemoryItemStore {
    async fn resolve(&self, reference: &str) -> Option<LibraryKey> {
        let (library, key) = reference.split_once('_')?;
        let library_id: EntityId = library.parse().ok()?;
        let items = self.all_items().await.ok()?;
        items
            .into_iter()
            .find(|item| item.library_id == library_id && item.key == key)
            .map(|item| LibraryKey {
                library_id,
                key: item.key,
            })
    }
}

/// Accepts `@citekey` (any library) and `bbt:citekey` / `bbt:{lib}citekey`
/// references on top of the host's own format.
pub struct CitekeyResolver<R> {
    inner: R,
    keys: Arc<dyn DerivedKeyStore>,
    user_library_id: EntityId,
}

impl<R: LibraryKeyResolver> CitekeyResolver<R> {
    pub fn new(
        inner: R,
        keys: Arc<dyn DerivedKeyStore>,
        user_library_id: EntityId,
    ) -> Self {
        Self {
            inner,
            keys,
            user_library_id,
        }
    }

    fn parse_bbt(&self, reference: &str) -> Option<(EntityId, String)> {
        let rest = reference.strip_prefix("bbt:")?;
        if let Some(braced) = rest.strip_prefix('{') {
            let (library, citekey) = braced.split_once('}')?;
            if !library.is_empty() {
                let library_id = library.parse().ok()?;
                return Some((library_id, citekey.to_string()));
            }
            return Some((self.user_library_id, citekey.to_string()));
        }
        Some((self.user_library_id, rest.to_string()))
    }
}

/// References arrive percent-encoded from links; undecodable ones are used
/// as given.
fn decode_reference(reference: &str) -> Cow<'_, str> {
    match urlencoding::decode(reference) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(reference, "reference does not decode to UTF-8: {}", e);
            Cow::Borrowed(reference)
        }
    }
}

#[async_trait]
impl<R: LibraryKeyResolver> LibraryKeyResolver for CitekeyResolver<R> {
    async fn resolve(&self, reference: &str) -> Option<LibraryKey> {
        let decoded = decode_reference(reference);
        let reference = decoded.as_ref();
        let found = if let Some(citekey) = reference.strip_prefix('@') {
            self.keys.find(None, citekey).await
        } else if let Some((library_id, citekey)) = self.parse_bbt(reference) {
            self.keys.find(Some(library_id), &citekey).await
        } else {
            None
        };
        match found {
            Some(key) => Some(LibraryKey {
                library_id: key.library_id,
                key: key.item_key,
            }),
            None => self.inner.resolve(reference).await,
        }
    }
}

/// A CSL-JSON item as handed to citation processors.
pub type CslItem = serde_json::Map<String, Value>;

#[async_trait]
pub trait CslSource: Send + Sync {
    async fn csl_item(&self, item: &Item) -> Result<CslItem, RefSyncError>;
}

/// Host CSL conversion: the item's fields under their own names, with
/// `extra` carried as `note`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldCsl;

#[async_trait]
impl CslSource for FieldCsl {
    async fn csl_item(&self, item: &Item) -> Result<CslItem, RefSyncError> {
        let mut csl = CslItem::new();
        csl.insert(
            "id".into(),
            Value::String(format!("{}_{}", item.library_id, item.key)),
        );
        for (name, value) in &item.fields {
            let name = if name == "extra" { "note" } else { name.as_str() };
            csl.insert(name.to_string(), Value::String(value.clone()));
        }
        Ok(csl)
    }
}

/// Replaces the CSL `note` with the item's citekey when enabled. Items
/// without a usable key lose their `note` instead.
pub struct CitekeyNote<C> {
    inner: C,
    keys: Arc<dyn DerivedKeyStore>,
    enabled: bool,
}

impl<C: CslSource> CitekeyNote<C> {
    pub fn new(
        inner: C,
        keys: Arc<dyn DerivedKeyStore>,
        enabled: bool,
    ) -> Self {
        Self {
            inner,
            keys,
            enabled,
        }
    }
}

#[async_trait]
impl<C: CslSource> CslSource for CitekeyNote<C> {
    async fn csl_item(&self, item: &Item) -> Result<CslItem, RefSyncError> {
        let mut csl = self.inner.csl_item(item).await?;
        if !self.enabled {
            return Ok(csl);
        }
        match self.keys.get(item.id).await {
            Some(key) if !key.citekey.is_empty() => {
                csl.insert("note".into(), Value::String(key.citekey));
            }
            _ => {
                csl.remove("note");
            }
        }
        Ok(csl)
    }
}

/// Produces the export representation of an item for one translator.
#[async_trait]
pub trait ItemSerializer: Send + Sync {
    async fn serialize(
        &self,
        translator: &str,
        item: &Item,
        selector: &CacheSelector,
    ) -> Result<String, RefSyncError>;
}

/// Host serializer: the item as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

#[async_trait]
impl ItemSerializer for JsonSerializer {
    async fn serialize(
        &self,
        _translator: &str,
        item: &Item,
        _selector: &CacheSelector,
    ) -> Result<String, RefSyncError> {
        Ok(serde_json::to_string(item)?)
    }
}

/// Serves serializations from the cache and fills it on a miss. Cache
/// failures never fail the export; the inner serializer answers instead.
pub struct CachedSerializer<S> {
    inner: S,
    cache: Arc<dyn SerializationCache>,
}

impl<S: ItemSerializer> CachedSerializer<S> {
    pub fn new(inner: S, cache: Arc<dyn SerializationCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<S: ItemSerializer> ItemSerializer for CachedSerializer<S> {
    async fn serialize(
        &self,
        translator: &str,
        item: &Item,
        selector: &CacheSelector,
    ) -> Result<String, RefSyncError> {
        match self.cache.fetch(translator, selector).await {
            Ok(Some(cached)) => return Ok(cached.reference),
            Ok(None) => {}
            Err(e) => {
                warn!(translator, item = item.id, "cache fetch failed: {}", e);
                return self.inner.serialize(translator, item, selector).await;
            }
        }
        let reference = self.inner.serialize(translator, item, selector).await?;
        if let Err(e) = self
            .cache
            .store(
                translator,
                selector.clone(),
                reference.clone(),
                serde_json::json!({ "item_key": item.key }),
            )
            .await
        {
            warn!(translator, item = item.id, "cache store failed: {}", e);
        }
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::consumers::{KeyManager, MemorySerializationCache};

    async fn library() -> (MemoryItemStore, Arc<KeyManager>) {
        let store = MemoryItemStore::new();
        store
            .put_item(
                Item::new(1, 1, "ABCD1234")
                    .with_field("creator", "Jane Doe")
                    .with_field("date", "2020")
                    .with_field("title", "On Things"),
            )
            .await;
        store
            .put_item(
                Item::new(2, 5, "GRP00001")
                    .with_field("creator", "Al Smith")
                    .with_field("date", "1999")
                    .with_field("extra", "Citation Key: smith99"),
            )
            .await;
        let keys = Arc::new(KeyManager::new(Arc::new(store.clone())));
        keys.init().await.unwrap();
        (store, keys)
    }

    #[tokio::test]
    async fn citekey_field_waits_for_loaded() {
        let (store, keys) = library().await;
        let gate = ReadinessGate::new();
        let fields = CitekeyFields::new(store, keys, gate.clone());

        assert_eq!(fields.field(1, "citekey").await.unwrap(), PENDING_CITEKEY);
        gate.mark_loaded();
        assert_eq!(fields.field(1, "citekey").await.unwrap(), "doe2020 *");
        assert_eq!(fields.field(2, "citekey").await.unwrap(), "smith99");
        assert_eq!(fields.field(2, "itemID").await.unwrap(), "2");
        assert_eq!(fields.field(1, "title").await.unwrap(), "On Things");
    }

    #[tokio::test]
    async fn virtual_fields_are_read_only() {
        let (store, keys) = library().await;
        let fields =
            CitekeyFields::new(store.clone(), keys, ReadinessGate::new());
        assert!(!fields.set_field(1, "citekey", "x").await.unwrap());
        assert!(fields.set_field(1, "title", "Other").await.unwrap());
        assert_eq!(store.field(1, "title").await.as_deref(), Some("Other"));
    }

    #[tokio::test]
    async fn resolves_citekey_references() {
        let (store, keys) = library().await;
        let resolver = CitekeyResolver::new(store, keys, 1);

        let doe = LibraryKey {
            library_id: 1,
            key: "ABCD1234".into(),
        };
        assert_eq!(resolver.resolve("@doe2020").await, Some(doe.clone()));
        assert_eq!(resolver.resolve("bbt:doe2020").await, Some(doe.clone()));
        assert_eq!(resolver.resolve("bbt:{}doe2020").await, Some(doe.clone()));
        assert_eq!(
            resolver.resolve("bbt:{5}smith99").await.map(|k| k.key),
            Some("GRP00001".into())
        );
        assert!(resolver.resolve("bbt:{1}smith99").await.is_none());
        // host format still works
        assert_eq!(resolver.resolve("1_ABCD1234").await, Some(doe));
        assert!(resolver.resolve("@nobody").await.is_none());
    }

    #[tokio::test]
    async fn resolves_percent_encoded_references() {
        let store = MemoryItemStore::new();
        store
            .put_item(
                Item::new(4, 1, "SPACE001")
                    .with_field("extra", "Citation Key: doe 2020"),
            )
            .await;
        let keys = Arc::new(KeyManager::new(Arc::new(store.clone())));
        keys.init().await.unwrap();
        let resolver = CitekeyResolver::new(store, keys, 1);

        let expected = Some(LibraryKey {
            library_id: 1,
            key: "SPACE001".into(),
        });
        assert_eq!(resolver.resolve("@doe%202020").await, expected);
        assert_eq!(resolver.resolve("bbt:%7B1%7Ddoe%202020").await, expected);
        assert_eq!(resolver.resolve("1%5FSPACE001").await, expected);
        // invalid UTF-8 once decoded: matched verbatim, which finds nothing
        assert!(resolver.resolve("@doe%FF2020").await.is_none());
    }

    #[tokio::test]
    async fn csl_note_carries_citekey_when_enabled() {
        let (_store, keys) = library().await;
        let item = Item::new(1, 1, "ABCD1234")
            .with_field("title", "On Things")
            .with_field("extra", "original note");

        let plain = CitekeyNote::new(FieldCsl, keys.clone(), false);
        let csl = plain.csl_item(&item).await.unwrap();
        assert_eq!(csl["note"], "original note");
        assert_eq!(csl["id"], "1_ABCD1234");

        let noted = CitekeyNote::new(FieldCsl, keys, true);
        let csl = noted.csl_item(&item).await.unwrap();
        assert_eq!(csl["note"], "doe2020");
        assert_eq!(csl["title"], "On Things");
    }

    #[tokio::test]
    async fn csl_note_dropped_without_citekey() {
        let (_store, keys) = library().await;
        let noted = CitekeyNote::new(FieldCsl, keys, true);

        let unknown = Item::new(9, 1, "NOKEY001").with_field("extra", "x");
        let csl = noted.csl_item(&unknown).await.unwrap();
        assert!(!csl.contains_key("note"));
        assert_eq!(csl["id"], "1_NOKEY001");
    }

    struct CountingSerializer(AtomicUsize);

    #[async_trait]
    impl ItemSerializer for CountingSerializer {
        async fn serialize(
            &self,
            _translator: &str,
            item: &Item,
            _selector: &CacheSelector,
        ) -> Result<String, RefSyncError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("@article{{{}}}", item.key))
        }
    }

    #[tokio::test]
    async fn serializer_fills_and_reuses_cache() {
        let cache = Arc::new(MemorySerializationCache::new(vec![
            "Better BibTeX".into(),
        ]));
        cache.init().await.unwrap();
        let inner = CountingSerializer(AtomicUsize::new(0));
        let serializer = CachedSerializer::new(inner, cache.clone());
        let item = Item::new(1, 1, "ABCD1234");
        let selector = CacheSelector::new(1);

        for _ in 0..2 {
            let out = serializer
                .serialize("Better BibTeX", &item, &selector)
                .await
                .unwrap();
            assert_eq!(out, "@article{ABCD1234}");
        }
        assert_eq!(serializer.inner.0.load(Ordering::SeqCst), 1);

        // no collection for this translator: served uncached every time
        serializer
            .serialize("Better CSL JSON", &item, &selector)
            .await
            .unwrap();
        serializer
            .serialize("Better CSL JSON", &item, &selector)
            .await
            .unwrap();
        assert_eq!(serializer.inner.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn json_serializer_emits_item() {
        let item = Item::new(3, 1, "K").with_field("title", "T");
        let out = JsonSerializer
            .serialize("any", &item, &CacheSelector::new(3))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["fields"]["title"], "T");
    }
}
