use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::DispatchConfig;
use super::dispatcher::ChangeDispatcher;
use super::types::MutationEvent;
use crate::error::GateError;
use crate::readiness::ReadinessGate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Backlog {
    pending: u64,
    stopped: bool,
}

/// Counters shared by both ends of the notification queue. The backlog sits
/// on a watch channel so waiters are woken when it empties.
#[derive(Debug)]
pub struct QueueStats {
    queued: AtomicU64,
    handled: AtomicU64,
    skipped: AtomicU64,
    backlog: watch::Sender<Backlog>,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            queued: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            backlog: watch::channel(Backlog::default()).0,
        }
    }
}

impl QueueStats {
    #[inline]
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn pending(&self) -> u64 {
        self.backlog.borrow().pending
    }
    #[inline]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// True once the dispatch loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.backlog.borrow().stopped
    }

    /// Resolves when nothing is pending or the dispatch loop has exited.
    pub async fn idle(&self) {
        let mut rx = self.backlog.subscribe();
        // the sender lives in `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|b| b.pending == 0 || b.stopped).await;
    }

    fn stop(&self) {
        self.backlog.send_modify(|b| b.stopped = true);
    }
}

/// Producer side of the notification queue. Unbounded: notifications that
/// arrive before the gate resolves are held, never dropped.
#[derive(Clone)]
pub struct Notifier {
    tx: UnboundedSender<MutationEvent>,
    stats: Arc<QueueStats>,
}

impl Notifier {
    pub fn channel() -> (Notifier, NotificationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(QueueStats::default());
        (
            Notifier {
                tx,
                stats: stats.clone(),
            },
            NotificationReceiver { rx, stats },
        )
    }

    /// Enqueues `event`. Returns false once the receiving side is gone.
    pub fn notify(&self, event: MutationEvent) -> bool {
        self.stats.backlog.send_modify(|b| b.pending += 1);
        match self.tx.send(event) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.backlog.send_modify(|b| b.pending -= 1);
                warn!("notification queue closed; dropping event");
                false
            }
        }
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

pub struct NotificationReceiver {
    rx: UnboundedReceiver<MutationEvent>,
    stats: Arc<QueueStats>,
}

impl NotificationReceiver {
    pub async fn recv(&mut self) -> Option<MutationEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<MutationEvent, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    fn settle(&self, skipped: bool) {
        self.stats.handled.fetch_add(1, Ordering::Relaxed);
        if skipped {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.backlog.send_modify(|b| b.pending -= 1);
    }
}

/// Drains the queue into `dispatcher`, one notification at a time and in
/// arrival order, once the configured gate stage resolves. The loop ends
/// when every [`Notifier`] is dropped, or with an error when the gate times
/// out.
pub fn spawn_dispatch_loop(
    mut rx: NotificationReceiver,
    dispatcher: Arc<ChangeDispatcher>,
    gate: ReadinessGate,
    config: DispatchConfig,
) -> JoinHandle<Result<(), GateError>> {
    tokio::spawn(async move {
        let result = run_dispatch_loop(&mut rx, &dispatcher, &gate, &config).await;
        rx.stats.stop();
        result
    })
}

async fn run_dispatch_loop(
    rx: &mut NotificationReceiver,
    dispatcher: &ChangeDispatcher,
    gate: &ReadinessGate,
    config: &DispatchConfig,
) -> Result<(), GateError> {
    debug!(stage = %config.gate, "dispatch loop waiting on readiness gate");
    gate.wait_timeout(config.gate, config.gate_timeout).await?;
    info!(
        stage = %config.gate,
        backlog = rx.stats.pending(),
        "dispatch loop started"
    );
    while let Some(event) = rx.recv().await {
        let report = dispatcher.dispatch(&event).await;
        rx.settle(report.skipped.is_some());
    }
    info!(handled = rx.stats.handled(), "dispatch loop stopped");
    Ok(())
}
