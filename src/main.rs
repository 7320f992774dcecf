use routegate::admin_listener::AdminListener;
use routegate::auth;
use routegate::config::ProxyConfig;
use routegate::glob::GlobCache;
use routegate::listener;
use routegate::registry::{self, Backend};
use routegate::table::TableHandle;
use routegate::watcher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("routegate {} starting", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => info!("down"),
        Err(e) => {
            error!("fatal error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Arc::new(ProxyConfig::from_env()?);
    info!(
        listeners = cfg.listen.len(),
        strategy = ?cfg.strategy,
        matcher = ?cfg.matcher,
        registry = %cfg.registry.backend,
        "runtime config loaded"
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let table = Arc::new(TableHandle::new());
    let glob = Arc::new(GlobCache::new(cfg.glob_cache_size));
    let auth_schemes = Arc::new(auth::load_auth_schemes(&cfg.auth_schemes)?);

    let backend = init_backend(&cfg).await?;

    // Watch streams start before the listeners so the first table is
    // ready when traffic arrives.
    tokio::spawn(watcher::watch_noroute_html(backend.watch_noroute_html()));

    let (first_tx, first_rx) = oneshot::channel();
    tokio::spawn(watcher::watch_backend(
        Arc::clone(&cfg),
        Arc::clone(&backend),
        Arc::clone(&table),
        backend.watch_services(),
        backend.watch_manual(),
        first_tx,
    ));

    info!("waiting for first routing table");
    first_rx.await?;

    let listeners = listener::spawn_listeners(
        Arc::clone(&cfg),
        Arc::clone(&table),
        Arc::clone(&glob),
        Arc::clone(&auth_schemes),
        shutdown_tx.clone(),
    )
    .await?;

    let admin = AdminListener::bind(&cfg.admin_addr, Arc::clone(&table)).await?;
    info!(
        "admin endpoints on {} (/health, /metrics, /routes, /api/routes, /version)",
        admin.local_addr()
    );
    tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, draining");
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(());

    let drained = listeners.drain(cfg.shutdown_wait).await;
    listeners.abort_all();
    backend.deregister_all();

    if !drained {
        return Err(Box::new(routegate::error::ProxyError::ShutdownTimeout {
            wait_ms: cfg.shutdown_wait.as_millis() as u64,
        }));
    }
    Ok(())
}

/// Creates the registry backend, retrying transient failures within the
/// configured registry timeout. Checks the shutdown flag between retries
/// so a signal during startup exits promptly.
async fn init_backend(cfg: &ProxyConfig) -> Result<Arc<dyn Backend>, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + cfg.registry.timeout;
    loop {
        match registry::new_backend(&cfg.registry) {
            Ok(backend) => {
                backend.register(&[])?;
                return Ok(backend);
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Box::new(e));
                }
                warn!(error = %e, "error initializing registry backend, retrying");
                tokio::time::sleep(cfg.registry.retry).await;
                if SHUTTING_DOWN.load(Ordering::SeqCst) {
                    std::process::exit(1);
                }
            }
        }
    }
}
