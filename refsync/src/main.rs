use std::error::Error;

use envconfig::Envconfig;
use refsync::events::MutationEvent;
use refsync::store::MemoryItemStore;
use refsync::{RefSync, RefSyncConfig};
use refsync_observability::{TracingConfig, setup_tracing};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

fn main() {
    let cpus = num_cpus::get();
    let worker_threads = std::cmp::max(1, cpus);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    let result = runtime.block_on(async {
        if let Err(e) = setup_tracing(TracingConfig::from_env("refsync")) {
            eprintln!("Failed to setup tracing: {}", e);
        }
        info!(
            "Tokio runtime started with {} worker threads",
            worker_threads
        );
        start().await
    });
    if let Err(e) = result {
        error!("refsync failed: {}", e);
        eprintln!("refsync failed: {}", e);
        std::process::exit(1);
    }
}

async fn start() -> Result<(), Box<dyn Error>> {
    let conf = RefSyncConfig::init_from_env()?;
    debug!("use refsync config: {:?}", conf);
    let snapshot = conf.load_seed().await?;
    info!(
        items = snapshot.items.len(),
        collections = snapshot.collections.len(),
        "library seeded"
    );
    let store = MemoryItemStore::from_snapshot(snapshot);

    let refsync = RefSync::new(conf, store)?;
    let printer = tokio::spawn(print_domain_events(
        refsync.context.bus.subscribe(),
    ));
    refsync.startup().await?;

    tokio::select! {
        res = read_notifications(&refsync) => res?,
        res = signal::ctrl_c() => {
            if let Err(err) = res {
                eprintln!("Unable to listen for shutdown signal: {}", err);
            }
        }
    }

    info!("starting a clean up for shutdown");
    refsync.drain().await;
    refsync.shutdown().await?;
    if let Err(e) = printer.await {
        warn!("event printer ended abnormally: {}", e);
    }
    info!("done clean up");
    Ok(())
}

/// One JSON `MutationEvent` per line; malformed lines are logged and skipped.
async fn read_notifications(refsync: &RefSync) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MutationEvent>(line) {
            Ok(event) => {
                refsync.notify(event);
            }
            Err(e) => warn!("skipping malformed notification: {}", e),
        }
    }
    debug!("stdin closed");
    Ok(())
}

async fn print_domain_events(
    mut rx: tokio::sync::broadcast::Receiver<refsync::events::DomainEvent>,
) {
    let mut stdout = tokio::io::stdout();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let mut line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("failed to encode domain event: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "domain event printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
