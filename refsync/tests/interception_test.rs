use refsync::RefSyncConfig;
use refsync::consumers::{CacheSelector, SerializationCache};
use refsync::events::DomainEvent;
use refsync::interception::{
    CslSource, FieldSource, ItemSerializer, LibraryKey, LibraryKeyResolver,
    PENDING_CITEKEY,
};

mod common;
use common::TestContext;

const BIBTEX: &str = "Better BibTeX";

#[test_log::test(tokio::test)]
async fn citekey_field_follows_startup()
-> Result<(), Box<dyn std::error::Error>> {
    let ctx = TestContext::new(common::config())?;
    let fields = ctx.refsync.fields();
    assert_eq!(
        fields.field(101, "citekey").await.as_deref(),
        Some(PENDING_CITEKEY)
    );

    ctx.refsync.startup().await?;
    assert_eq!(
        fields.field(101, "citekey").await.as_deref(),
        Some("doe2020 *")
    );
    assert_eq!(
        fields.field(102, "citekey").await.as_deref(),
        Some("roe-pinned")
    );
    assert!(!fields.set_field(101, "citekey", "mine").await?);

    ctx.settle().await?;
    ctx.shutdown().await
}

#[test_log::test(tokio::test)]
async fn resolver_finds_items_by_citekey()
-> Result<(), Box<dyn std::error::Error>> {
    let ctx = TestContext::started(common::config()).await?;
    let resolver = ctx.refsync.resolver();

    assert_eq!(
        resolver.resolve("@roe-pinned").await,
        Some(LibraryKey {
            library_id: 1,
            key: "ROE00002".into(),
        })
    );
    assert_eq!(
        resolver.resolve("bbt:%7B5%7Dsmith1999").await.map(|k| k.key),
        Some("GRP00001".into())
    );
    // the user library is library 1
    assert!(resolver.resolve("bbt:smith1999").await.is_none());

    ctx.shutdown().await
}

#[test_log::test(tokio::test)]
async fn serializer_cache_is_evicted_on_change()
-> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = TestContext::started(common::config()).await?;
    ctx.settle().await?;
    let serializer = ctx.refsync.serializer();
    let selector = CacheSelector::new(101);
    let item = ctx.refsync.store.item(101).await.ok_or("missing item")?;

    let first = serializer.serialize(BIBTEX, &item, &selector).await?;
    let cached = ctx.refsync.cache.fetch(BIBTEX, &selector).await?;
    assert_eq!(cached.map(|c| c.reference), Some(first));

    ctx.refsync
        .store
        .put_item(item.with_field("title", "Revised"))
        .await;
    assert_eq!(ctx.next_event().await?, DomainEvent::ItemsChanged(vec![101]));
    ctx.settle().await?;
    assert!(ctx.refsync.cache.fetch(BIBTEX, &selector).await?.is_none());

    ctx.shutdown().await
}

#[test_log::test(tokio::test)]
async fn csl_note_follows_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = RefSyncConfig {
        citeproc_note_citekey: true,
        ..common::config()
    };
    let ctx = TestContext::started(config).await?;
    let csl = ctx.refsync.csl();

    let item = ctx.refsync.store.item(102).await.ok_or("missing item")?;
    let converted = csl.csl_item(&item).await?;
    assert_eq!(converted["note"], "roe-pinned");

    // notes carry no citekey
    let note = ctx.refsync.store.item(103).await.ok_or("missing note")?;
    let converted = csl.csl_item(&note.with_field("extra", "x")).await?;
    assert!(!converted.contains_key("note"));

    ctx.shutdown().await
}
