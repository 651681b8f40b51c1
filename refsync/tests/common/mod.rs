use std::time::Duration;

use refsync::error::RefSyncError;
use refsync::events::DomainEvent;
use refsync::store::{Collection, Item, LibrarySnapshot, MemoryItemStore};
use refsync::{RefSync, RefSyncConfig};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_millis(2000);

/// Library 1 with two regular items, a note under item 1 and the collection
/// chain 7 -> 3 -> 1. Library 5 holds one item in collection 20.
pub fn snapshot() -> LibrarySnapshot {
    let collection = |id, library_id, parent_id| Collection {
        id,
        library_id,
        parent_id,
        name: format!("collection {}", id),
    };
    LibrarySnapshot {
        items: vec![
            Item::new(101, 1, "DOE00001")
                .with_field("creator", "Jane Doe")
                .with_field("date", "2020-01-01")
                .in_collection(7),
            Item::new(102, 1, "ROE00002")
                .with_field("creator", "Richard Roe")
                .with_field("date", "2018")
                .with_field("extra", "Citation Key: roe-pinned"),
            Item::note(103, 1, 101),
            Item::new(501, 5, "GRP00001")
                .with_field("creator", "Al Smith")
                .with_field("date", "1999")
                .in_collection(20),
        ],
        collections: vec![
            collection(1, 1, None),
            collection(3, 1, Some(1)),
            collection(7, 1, Some(3)),
            collection(20, 5, None),
        ],
    }
}

pub fn config() -> RefSyncConfig {
    RefSyncConfig {
        gate_timeout_ms: Some(WAIT.as_millis() as u64),
        ..Default::default()
    }
}

pub struct TestContext {
    pub refsync: RefSync,
    pub events: broadcast::Receiver<DomainEvent>,
}

impl TestContext {
    /// Wired but not started; the readiness gate is still pending.
    pub fn new(config: RefSyncConfig) -> Result<Self, RefSyncError> {
        let store = MemoryItemStore::from_snapshot(snapshot());
        let refsync = RefSync::new(config, store)?;
        let events = refsync.context.bus.subscribe();
        Ok(Self { refsync, events })
    }

    pub async fn started(
        config: RefSyncConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut ctx = Self::new(config)?;
        ctx.refsync.startup().await?;
        let first = ctx.next_event().await?;
        assert_eq!(first, DomainEvent::Loaded);
        Ok(ctx)
    }

    pub async fn next_event(
        &mut self,
    ) -> Result<DomainEvent, Box<dyn std::error::Error>> {
        Ok(tokio::time::timeout(WAIT, self.events.recv()).await??)
    }

    /// Waits for the queue to drain, bounded by [`WAIT`].
    pub async fn settle(&self) -> Result<(), Box<dyn std::error::Error>> {
        tokio::time::timeout(WAIT, self.refsync.drain()).await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub fn no_more_events(&mut self) -> bool {
        matches!(
            self.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }

    pub async fn shutdown(self) -> Result<(), Box<dyn std::error::Error>> {
        self.refsync.shutdown().await?;
        Ok(())
    }
}
