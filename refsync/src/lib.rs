pub mod consumers;
pub mod context;
pub mod error;
pub mod events;
pub mod interception;
pub mod readiness;
pub mod startup;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use consumers::{AutoExportJobs, KeyManager, MemorySerializationCache};
pub use context::RefSyncContext;
use error::{GateError, RefSyncError, StartupError};
use events::{
    ChangeDispatcher, Consumers, MutationEvent, Notifier, QueueStats,
    spawn_dispatch_loop,
};
use interception::{
    CachedSerializer, CitekeyFields, CitekeyNote, CitekeyResolver, FieldCsl,
    JsonSerializer,
};
use store::{EntityId, LibrarySnapshot, MemoryItemStore};

#[derive(Envconfig, Clone, Debug)]
pub struct RefSyncConfig {
    #[envconfig(from = "REFSYNC_DISPATCH_GATE", default = "ready")]
    pub dispatch_gate: String,
    #[envconfig(from = "REFSYNC_GATE_TIMEOUT_MS")]
    pub gate_timeout_ms: Option<u64>,
    #[envconfig(from = "REFSYNC_EVENT_BUS_CAPACITY", default = "1024")]
    pub event_bus_capacity: usize,
    #[envconfig(from = "REFSYNC_USER_LIBRARY_ID", default = "1")]
    pub user_library_id: EntityId,
    #[envconfig(
        from = "REFSYNC_CACHE_TRANSLATORS",
        default = "Better BibTeX,Better BibLaTeX,Better CSL JSON"
    )]
    pub cache_translators: String,
    /// `label=translator id` pairs; exports through these can be kept
    /// updated.
    #[envconfig(
        from = "REFSYNC_EXPORT_TRANSLATORS",
        default = "Better BibTeX=ca65189f-8815-4afe-8c8b-8c7c15f0edca,Better BibLaTeX=f895aa0d-f28e-47fe-b247-2ea77c6ed583,Better CSL JSON=f4b52ab0-f878-4556-85a0-c7aeedd09dfc"
    )]
    pub export_translators: String,
    /// Put the citekey in the CSL `note` field.
    #[envconfig(from = "REFSYNC_CITEPROC_NOTE_CITEKEY", default = "false")]
    pub citeproc_note_citekey: bool,
    #[envconfig(from = "REFSYNC_SEED_FILE")]
    pub seed_file: Option<String>,
}

const EXPORT_TRANSLATORS: &str = "Better BibTeX=ca65189f-8815-4afe-8c8b-8c7c15f0edca,\
    Better BibLaTeX=f895aa0d-f28e-47fe-b247-2ea77c6ed583,\
    Better CSL JSON=f4b52ab0-f878-4556-85a0-c7aeedd09dfc";

impl Default for RefSyncConfig {
    fn default() -> Self {
        Self {
            dispatch_gate: "ready".into(),
            gate_timeout_ms: None,
            event_bus_capacity: 1024,
            user_library_id: 1,
            cache_translators: "Better BibTeX,Better BibLaTeX,Better CSL JSON"
                .into(),
            export_translators: EXPORT_TRANSLATORS.into(),
            citeproc_note_citekey: false,
            seed_file: None,
        }
    }
}

impl RefSyncConfig {
    pub fn translators(&self) -> Vec<String> {
        self.cache_translators
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Translator IDs keyed by label, from `export_translators`.
    pub fn export_translator_ids(
        &self,
    ) -> Result<BTreeMap<String, String>, RefSyncError> {
        self.export_translators
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once('=') {
                Some((label, id))
                    if !label.trim().is_empty() && !id.trim().is_empty() =>
                {
                    Ok((label.trim().to_string(), id.trim().to_string()))
                }
                _ => Err(RefSyncError::InvalidArgument(format!(
                    "export translator `{}` is not `label=id`",
                    entry
                ))),
            })
            .collect()
    }

    /// Snapshot named by `seed_file`, or an empty library.
    pub async fn load_seed(&self) -> Result<LibrarySnapshot, RefSyncError> {
        match &self.seed_file {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(LibrarySnapshot::default()),
        }
    }
}

/// A wired-up instance over an in-memory library: the context, the concrete
/// consumers and the running dispatch task.
pub struct RefSync {
    pub context: Arc<RefSyncContext>,
    pub store: MemoryItemStore,
    pub keys: Arc<KeyManager>,
    pub cache: Arc<MemorySerializationCache>,
    pub auto_export: Arc<AutoExportJobs>,
    pub dispatcher: Arc<ChangeDispatcher>,
    notifier: Notifier,
    stats: Arc<QueueStats>,
    dispatch: JoinHandle<Result<(), GateError>>,
}

impl RefSync {
    /// Wires everything and starts the dispatch task, which holds incoming
    /// notifications until the configured gate stage resolves. Nothing is
    /// initialized yet; see [`startup`](Self::startup).
    pub fn new(
        config: RefSyncConfig,
        store: MemoryItemStore,
    ) -> Result<Self, RefSyncError> {
        let keys = Arc::new(KeyManager::new(Arc::new(store.clone())));
        let cache = Arc::new(MemorySerializationCache::default());
        let auto_export = Arc::new(AutoExportJobs::new(
            config.export_translator_ids()?.into_values(),
        ));
        let consumers = Consumers {
            cache: cache.clone(),
            keys: keys.clone(),
            auto_export: auto_export.clone(),
        };
        let context = Arc::new(RefSyncContext::new(
            config,
            Arc::new(store.clone()),
            consumers,
        ));
        let dispatch_config = context.dispatch_config()?;
        debug!(?dispatch_config, "use dispatch config");

        let (notifier, rx) = Notifier::channel();
        store.attach_notifier(notifier.clone());
        let stats = notifier.stats();
        let dispatcher = Arc::new(context.dispatcher());
        let dispatch = spawn_dispatch_loop(
            rx,
            dispatcher.clone(),
            context.gate.clone(),
            dispatch_config,
        );
        Ok(Self {
            context,
            store,
            keys,
            cache,
            auto_export,
            dispatcher,
            notifier,
            stats,
            dispatch,
        })
    }

    pub async fn startup(&self) -> Result<(), StartupError> {
        startup::run(&self.context).await
    }

    /// [`new`](Self::new) followed by [`startup`](Self::startup).
    pub async fn start(
        config: RefSyncConfig,
        store: MemoryItemStore,
    ) -> Result<Self, RefSyncError> {
        let refsync = Self::new(config, store)?;
        if let Err(e) = refsync.startup().await {
            refsync.dispatch.abort();
            return Err(e.into());
        }
        Ok(refsync)
    }

    /// Hands a notification to the queue, as the host store would.
    pub fn notify(&self, event: MutationEvent) -> bool {
        self.notifier.notify(event)
    }

    /// Item fields with `citekey` and `itemID` answered from the key index.
    pub fn fields(&self) -> CitekeyFields<MemoryItemStore> {
        CitekeyFields::new(
            self.store.clone(),
            self.keys.clone(),
            self.context.gate.clone(),
        )
    }

    /// Library-key lookup that also accepts citekey references.
    pub fn resolver(&self) -> CitekeyResolver<MemoryItemStore> {
        CitekeyResolver::new(
            self.store.clone(),
            self.keys.clone(),
            self.context.config.user_library_id,
        )
    }

    /// Export serialization backed by the serialization cache.
    pub fn serializer(&self) -> CachedSerializer<JsonSerializer> {
        CachedSerializer::new(JsonSerializer, self.cache.clone())
    }

    /// CSL conversion, with the citekey as `note` when
    /// `citeproc_note_citekey` is set.
    pub fn csl(&self) -> CitekeyNote<FieldCsl> {
        CitekeyNote::new(
            FieldCsl,
            self.keys.clone(),
            self.context.config.citeproc_note_citekey,
        )
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    /// Waits until every queued notification has been handled, or until the
    /// dispatch task has exited.
    pub async fn drain(&self) {
        self.stats.idle().await
    }

    /// Stops accepting notifications, lets the queue drain and waits for the
    /// dispatch task to finish.
    pub async fn shutdown(self) -> Result<(), RefSyncError> {
        self.store.detach_notifier();
        drop(self.notifier);
        self.dispatch.await??;
        info!(handled = self.stats.handled(), "refsync stopped");
        Ok(())
    }
}
