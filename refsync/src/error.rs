use std::time::Duration;

use crate::readiness::GateStage;
use crate::store::EntityId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Item `{0}` not found")]
    ItemNotFound(EntityId),
    #[error("Collection `{0}` not found")]
    CollectionNotFound(EntityId),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Failure of a single consumer operation. Always recoverable: the dispatcher
/// logs it and moves on to the next consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Cache collection `{0}` not found")]
    MissingCacheCollection(String),
    #[error("Key {op} failed for item {entity}: {reason}")]
    Key {
        op: &'static str,
        entity: EntityId,
        reason: String,
    },
    #[error("Auto-export not registered: {0}")]
    ExportNotRegistered(String),
    #[error("Auto-export job `{0}` not found")]
    ExportJobNotFound(u64),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    #[error("Timed out after {waited:?} waiting for `{stage}`")]
    Timeout { stage: GateStage, waited: Duration },
    #[error("Readiness gate dropped before `{0}` resolved")]
    Closed(GateStage),
}

#[derive(Debug, thiserror::Error)]
#[error("Startup failed during `{phase}`: {source}")]
pub struct StartupError {
    pub phase: &'static str,
    #[source]
    pub source: ConsumerError,
}

#[derive(Debug, thiserror::Error)]
pub enum RefSyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error("Config error: {0}")]
    Config(#[from] envconfig::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
