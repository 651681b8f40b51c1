use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{AutoExportScheduler, ConsumerResult};
use crate::error::ConsumerError;
use crate::store::{EntityId, Item};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ExportTarget {
    Library(EntityId),
    Collection(EntityId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Done,
    Scheduled,
    Running,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: JobId,
    pub target: ExportTarget,
    /// Library the target lives in.
    pub library_id: EntityId,
    pub path: String,
    pub translator_id: String,
    pub export_notes: bool,
    pub use_journal_abbreviation: bool,
    pub status: JobStatus,
}

/// What an export was run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExportScope {
    Library {
        library_id: EntityId,
    },
    Collection {
        library_id: EntityId,
        collection_id: EntityId,
    },
    Items {
        ids: Vec<EntityId>,
    },
}

/// A file export as handed to the export hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub scope: ExportScope,
    #[serde(default)]
    pub path: Option<String>,
    pub translator_id: String,
    #[serde(default)]
    pub export_notes: bool,
    #[serde(default)]
    pub use_journal_abbreviation: bool,
    #[serde(default)]
    pub export_file_data: bool,
    #[serde(default)]
    pub keep_updated: bool,
}

/// Registry of exports that are kept up to date when their contents change.
pub struct AutoExportJobs {
    translators: HashSet<String>,
    jobs: RwLock<BTreeMap<JobId, ExportJob>>,
    next_id: AtomicU64,
}

impl AutoExportJobs {
    /// Only exports through one of `translators` can be kept updated.
    pub fn new<I, S>(translators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            translators: translators.into_iter().map(Into::into).collect(),
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Captures an export as an auto-export job. Exports without
    /// `keep_updated` are not captured and yield `None`. Registering the same
    /// target and path again replaces the existing job's options.
    pub async fn register(
        &self,
        request: ExportRequest,
    ) -> ConsumerResult<Option<JobId>> {
        if !request.keep_updated {
            return Ok(None);
        }
        let path = match request.path.as_deref() {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => return Err(not_registered("only exports to file are supported")),
        };
        if !self.translators.contains(&request.translator_id) {
            return Err(not_registered(format!(
                "translator `{}` cannot be kept updated",
                request.translator_id
            )));
        }
        if request.export_file_data {
            return Err(not_registered("file data exports are not supported"));
        }
        let (target, library_id) = match request.scope {
            ExportScope::Library { library_id } => {
                (ExportTarget::Library(library_id), library_id)
            }
            ExportScope::Collection {
                library_id,
                collection_id,
            } => (ExportTarget::Collection(collection_id), library_id),
            ExportScope::Items { .. } => {
                return Err(not_registered(
                    "only libraries and collections can be kept updated",
                ));
            }
        };

        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .values()
            .find(|job| job.target == target && job.path == path)
            .map(|job| job.id);
        let id = existing
            .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        jobs.insert(id, ExportJob {
            id,
            target,
            library_id,
            path,
            translator_id: request.translator_id,
            export_notes: request.export_notes,
            use_journal_abbreviation: request.use_journal_abbreviation,
            status: JobStatus::Done,
        });
        info!(job = id, ?target, replaced = existing.is_some(), "auto-export registered");
        Ok(Some(id))
    }

    pub async fn jobs(&self) -> Vec<ExportJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn job(&self, id: JobId) -> Option<ExportJob> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn scheduled(&self) -> Vec<JobId> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Scheduled)
            .map(|job| job.id)
            .collect()
    }

    /// Records progress reported by whatever runs the export.
    pub async fn mark(&self, id: JobId, status: JobStatus) -> ConsumerResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or(ConsumerError::ExportJobNotFound(id))?;
        if let JobStatus::Error(reason) = &status {
            warn!(job = id, path = %job.path, "auto-export failed: {}", reason);
        }
        job.status = status;
        Ok(())
    }

    async fn schedule_where<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&ExportJob) -> bool + Send,
    {
        let mut scheduled = 0usize;
        for job in self.jobs.write().await.values_mut() {
            if matches(job) {
                job.status = JobStatus::Scheduled;
                scheduled += 1;
            }
        }
        scheduled
    }

    async fn drop_where<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&ExportJob) -> bool + Send,
    {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !matches(job));
        before - jobs.len()
    }
}

fn not_registered(reason: impl Into<String>) -> ConsumerError {
    let reason = reason.into();
    warn!("auto-export not registered: {}", reason);
    ConsumerError::ExportNotRegistered(reason)
}

#[async_trait]
impl AutoExportScheduler for AutoExportJobs {
    /// Jobs interrupted by a shutdown are picked up again.
    async fn init(&self) -> ConsumerResult<()> {
        let mut jobs = self.jobs.write().await;
        let mut resumed = 0usize;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Scheduled;
                resumed += 1;
            }
        }
        info!(jobs = jobs.len(), resumed, "auto-export initialized");
        Ok(())
    }

    async fn notify_changed(&self, items: &[Item]) -> ConsumerResult<usize> {
        let libraries: HashSet<EntityId> =
            items.iter().map(|i| i.library_id).collect();
        let collections: HashSet<EntityId> = items
            .iter()
            .flat_map(|i| i.collections.iter().copied())
            .collect();
        let scheduled = self
            .schedule_where(|job| match job.target {
                ExportTarget::Library(id) => libraries.contains(&id),
                ExportTarget::Collection(id) => collections.contains(&id),
            })
            .await;
        debug!(items = items.len(), scheduled, "auto-export notified");
        Ok(scheduled)
    }

    async fn collections_changed(
        &self,
        ids: &[EntityId],
    ) -> ConsumerResult<usize> {
        let scheduled = self
            .schedule_where(|job| {
                matches!(job.target, ExportTarget::Collection(id) if ids.contains(&id))
            })
            .await;
        debug!(?ids, scheduled, "auto-export collections changed");
        Ok(scheduled)
    }

    async fn collections_removed(
        &self,
        ids: &[EntityId],
    ) -> ConsumerResult<usize> {
        let dropped = self
            .drop_where(|job| {
                matches!(job.target, ExportTarget::Collection(id) if ids.contains(&id))
            })
            .await;
        if dropped > 0 {
            info!(?ids, dropped, "auto-export jobs for removed collections dropped");
        }
        Ok(dropped)
    }

    async fn libraries_removed(
        &self,
        ids: &[EntityId],
    ) -> ConsumerResult<usize> {
        let dropped = self
            .drop_where(|job| ids.contains(&job.library_id))
            .await;
        if dropped > 0 {
            info!(?ids, dropped, "auto-export jobs for removed libraries dropped");
        }
        Ok(dropped)
    }
}
