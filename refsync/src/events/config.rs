use std::time::Duration;

use crate::readiness::GateStage;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub gate: GateStage,           // Stage the dispatch loop waits for
    pub gate_timeout: Option<Duration>, // None waits forever
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            gate: GateStage::Ready,
            gate_timeout: None,
        }
    }
}
