use std::sync::Arc;
use std::time::Duration;

use crate::RefSyncConfig;
use crate::error::RefSyncError;
use crate::events::{ChangeDispatcher, Consumers, DispatchConfig, EventBus};
use crate::readiness::{GateStage, ReadinessGate};
use crate::store::ItemStore;

/// Process-wide state, built once at startup and handed to every component
/// that needs readiness, events or the derived subsystems.
pub struct RefSyncContext {
    pub config: RefSyncConfig,
    pub gate: ReadinessGate,
    pub bus: EventBus,
    pub store: Arc<dyn ItemStore>,
    pub consumers: Consumers,
}

impl RefSyncContext {
    pub fn new(
        config: RefSyncConfig,
        store: Arc<dyn ItemStore>,
        consumers: Consumers,
    ) -> Self {
        let bus = EventBus::new(config.event_bus_capacity);
        Self {
            config,
            gate: ReadinessGate::new(),
            bus,
            store,
            consumers,
        }
    }

    pub fn dispatcher(&self) -> ChangeDispatcher {
        ChangeDispatcher::new(
            self.store.clone(),
            self.consumers.clone(),
            self.bus.clone(),
        )
    }

    pub fn dispatch_config(&self) -> Result<DispatchConfig, RefSyncError> {
        let gate = self
            .config
            .dispatch_gate
            .parse::<GateStage>()
            .map_err(RefSyncError::InvalidArgument)?;
        Ok(DispatchConfig {
            gate,
            gate_timeout: self.config.gate_timeout_ms.map(Duration::from_millis),
        })
    }
}
