//! Two-stage startup barrier.
//!
//! `loaded` means the citekey index is usable, `ready` means every derived
//! subsystem finished initializing. Both flags only ever go from false to
//! true; `ready` implies `loaded`. A failed startup leaves the gate pending
//! forever, so anything waiting on it stays parked.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GateStage {
    Loaded,
    Ready,
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStage::Loaded => f.write_str("loaded"),
            GateStage::Ready => f.write_str("ready"),
        }
    }
}

impl FromStr for GateStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loaded" => Ok(GateStage::Loaded),
            "ready" => Ok(GateStage::Ready),
            other => Err(format!("unknown gate stage `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessState {
    pub loaded: bool,
    pub ready: bool,
}

impl ReadinessState {
    pub fn reached(&self, stage: GateStage) -> bool {
        match stage {
            GateStage::Loaded => self.loaded,
            GateStage::Ready => self.ready,
        }
    }
}

#[derive(Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<ReadinessState>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadinessState::default());
        Self {
            tx: Arc::new(tx),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.tx.borrow()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().loaded
    }

    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    pub fn watch(&self) -> watch::Receiver<ReadinessState> {
        self.tx.subscribe()
    }

    /// Resolves `loaded`. Returns false if it was already resolved.
    pub fn mark_loaded(&self) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if state.loaded {
                return false;
            }
            state.loaded = true;
            true
        });
        if changed {
            info!("readiness gate: loaded");
        }
        changed
    }

    /// Resolves `ready` (and `loaded`, if it somehow was skipped).
    pub fn mark_ready(&self) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if state.ready {
                return false;
            }
            state.loaded = true;
            state.ready = true;
            true
        });
        if changed {
            info!("readiness gate: ready");
        }
        changed
    }

    /// Records a fatal startup failure. The gate is left untouched: whatever
    /// has not resolved yet stays pending.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(
            state = ?self.state(),
            "startup failed, readiness gate will not resolve: {}",
            reason
        );
        if let Ok(mut failure) = self.failure.lock() {
            failure.replace(reason);
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    pub async fn wait(&self, stage: GateStage) -> Result<(), GateError> {
        let mut rx = self.tx.subscribe();
        rx.wait_for(|state| state.reached(stage))
            .await
            .map(|_| ())
            .map_err(|_| GateError::Closed(stage))
    }

    /// Same as [`wait`](Self::wait) but gives up after `timeout`, if one is
    /// given. `None` waits forever.
    pub async fn wait_timeout(
        &self,
        stage: GateStage,
        timeout: Option<Duration>,
    ) -> Result<(), GateError> {
        match timeout {
            Some(waited) => tokio::time::timeout(waited, self.wait(stage))
                .await
                .map_err(|_| GateError::Timeout { stage, waited })?,
            None => self.wait(stage).await,
        }
    }

    /// Runs `continuation` once `stage` resolves. When it already has, the
    /// continuation runs right away on the calling task.
    pub fn on<F>(&self, stage: GateStage, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state().reached(stage) {
            continuation();
            return;
        }
        let gate = self.clone();
        tokio::spawn(async move {
            if gate.wait(stage).await.is_ok() {
                continuation();
            }
        });
    }
}
