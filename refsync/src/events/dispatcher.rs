use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use super::bus::EventBus;
use super::classifier::{Classification, ItemChange, classify};
use super::resolver::{ChangeSet, ancestor_change_set, item_change_set};
use super::types::{DomainEvent, MutationEvent};
use crate::consumers::{
    AutoExportScheduler, ConsumerResult, DerivedKeyStore, SerializationCache,
};
use crate::store::{EntityId, ItemStore};

/// The derived subsystems a [`ChangeDispatcher`] fans out to.
#[derive(Clone)]
pub struct Consumers {
    pub cache: Arc<dyn SerializationCache>,
    pub keys: Arc<dyn DerivedKeyStore>,
    pub auto_export: Arc<dyn AutoExportScheduler>,
}

/// Outcome of dispatching one notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Why the notification was dropped without touching any consumer.
    pub skipped: Option<&'static str>,
    pub change_set: ChangeSet,
    pub emitted: Option<DomainEvent>,
    pub consumer_errors: usize,
}

/// Turns store notifications into consumer calls and domain events.
///
/// For item changes the order is fixed: cache eviction, then key refresh or
/// removal, then the domain event, then auto-export. A failing consumer is
/// logged and counted; the remaining steps still run.
pub struct ChangeDispatcher {
    store: Arc<dyn ItemStore>,
    consumers: Consumers,
    bus: EventBus,
    dispatched: AtomicU64,
    skipped: AtomicU64,
    consumer_errors: AtomicU64,
}

impl ChangeDispatcher {
    pub fn new(
        store: Arc<dyn ItemStore>,
        consumers: Consumers,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            consumers,
            bus,
            dispatched: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            consumer_errors: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn dispatch(&self, event: &MutationEvent) -> DispatchReport {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(kind = ?event.kind, action = ?event.action, ids = ?event.ids, "dispatching");
        let mut report = DispatchReport::default();
        match classify(event, self.store.as_ref()).await {
            Classification::Noop(reason) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = ?event.kind, action = ?event.action, reason, "notification skipped");
                report.skipped = Some(reason);
            }
            Classification::Items(change) => {
                self.items_changed(change, &mut report).await
            }
            Classification::CollectionMembership(links) => {
                report.change_set =
                    ancestor_change_set(&links, self.store.as_ref()).await;
                if report.change_set.is_empty() {
                    report.skipped = Some("no collections resolved");
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    return report;
                }
                let ids = report.change_set.to_vec();
                self.emit(DomainEvent::CollectionsChanged(ids.clone()), &mut report);
                let result =
                    self.consumers.auto_export.collections_changed(&ids).await;
                self.check("auto-export", &ids, result, &mut report);
            }
            Classification::CollectionsRemoved(ids) => {
                report.change_set = ids.iter().copied().collect();
                self.emit(DomainEvent::CollectionsRemoved(ids.clone()), &mut report);
                let result =
                    self.consumers.auto_export.collections_removed(&ids).await;
                self.check("auto-export", &ids, result, &mut report);
            }
            Classification::LibrariesRemoved(ids) => {
                report.change_set = ids.iter().copied().collect();
                self.emit(DomainEvent::LibrariesRemoved(ids.clone()), &mut report);
                let result =
                    self.consumers.auto_export.libraries_removed(&ids).await;
                self.check("auto-export", &ids, result, &mut report);
            }
        }
        report
    }

    async fn items_changed(
        &self,
        change: ItemChange,
        report: &mut DispatchReport,
    ) {
        report.change_set = item_change_set(&change);

        if !report.change_set.is_empty() {
            let ids = report.change_set.to_vec();
            let reason = format!("items {:?} changed", change.direct);
            let result = self.consumers.cache.evict(&ids, &reason).await;
            self.check("cache-evict", &ids, result, report);
        }

        let removal = change.action.is_removal();
        if removal {
            let result = self.consumers.keys.remove(&change.direct).await;
            self.check("key-remove", &change.direct, result, report);
        } else {
            for item in &change.primary {
                let result = self.consumers.keys.refresh(item.id).await;
                self.check("key-refresh", &[item.id], result, report);
            }
        }

        let event = if removal {
            DomainEvent::ItemsRemoved(change.direct.clone())
        } else {
            DomainEvent::ItemsChanged(change.direct.clone())
        };
        self.emit(event, report);

        if !change.primary.is_empty() {
            let result =
                self.consumers.auto_export.notify_changed(&change.primary).await;
            let ids: Vec<EntityId> = change.primary.iter().map(|i| i.id).collect();
            self.check("auto-export", &ids, result, report);
        }
    }

    fn emit(&self, event: DomainEvent, report: &mut DispatchReport) {
        self.bus.emit(event.clone());
        report.emitted = Some(event);
    }

    fn check<T>(
        &self,
        op: &'static str,
        ids: &[EntityId],
        result: ConsumerResult<T>,
        report: &mut DispatchReport,
    ) {
        if let Err(e) = result {
            self.consumer_errors.fetch_add(1, Ordering::Relaxed);
            report.consumer_errors += 1;
            warn!(op, ?ids, "consumer failed: {}", e);
        }
    }

    #[inline]
    pub fn metrics_dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn metrics_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn metrics_consumer_errors(&self) -> u64 {
        self.consumer_errors.load(Ordering::Relaxed)
    }
}
