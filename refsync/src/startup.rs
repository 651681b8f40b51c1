//! Startup sequence.
//!
//! Phases run in a fixed order; `loaded` resolves once the key index is
//! usable and `ready` once every subsystem finished. The first failing phase
//! marks the gate failed and stops the sequence, leaving whatever has not
//! resolved pending.

use std::future::Future;
use std::time::Instant;

use tracing::info;

use crate::consumers::ConsumerResult;
use crate::context::RefSyncContext;
use crate::error::{ConsumerError, StartupError};
use crate::events::DomainEvent;
use crate::readiness::ReadinessGate;

async fn phase<T, F>(
    gate: &ReadinessGate,
    name: &'static str,
    work: F,
) -> Result<T, StartupError>
where
    F: Future<Output = ConsumerResult<T>>,
{
    let started = Instant::now();
    info!(phase = name, "startup phase begin");
    match work.await {
        Ok(value) => {
            info!(
                phase = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "startup phase done"
            );
            Ok(value)
        }
        Err(source) => {
            gate.fail(format!("{}: {}", name, source));
            Err(StartupError {
                phase: name,
                source,
            })
        }
    }
}

pub async fn run(ctx: &RefSyncContext) -> Result<(), StartupError> {
    let started = Instant::now();
    let gate = &ctx.gate;
    let consumers = &ctx.consumers;

    let ((), loaded) = tokio::try_join!(
        phase(gate, "cache-init", consumers.cache.init()),
        phase(gate, "key-load", consumers.keys.load()),
    )?;
    info!(records = loaded, "key index loaded");

    phase(gate, "auto-export-init", consumers.auto_export.init()).await?;
    phase(gate, "key-manager-init", consumers.keys.init()).await?;
    gate.mark_loaded();

    phase(gate, "serializer-init", async {
        for translator in ctx.config.translators() {
            consumers.cache.ensure_collection(&translator).await?;
        }
        Ok::<_, ConsumerError>(())
    })
    .await?;

    gate.mark_ready();
    ctx.bus.emit(DomainEvent::Loaded);
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "startup complete"
    );
    Ok(())
}
