//! Areaplane world manager.
//!
//! Keeps the servers of every region in step with its areas, runs one
//! hosting task per enabled server, publishes DNS names for tasks with a
//! public address and broadcasts the resulting state changes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use areaplane_manager::{
    allocation::ServerAllocator,
    api, bootstrap,
    config::{self, DnsConfig, HostingConfig, PublisherConfig, StoreKind},
    db::{Database, MemoryStore, WorldStore},
    dns::{CloudflareDns, DnsProvider, LogDns},
    hosting::{DockerHosting, HostingProvider, LocalHosting, RoleImages},
    publisher::{BroadcastPublisher, EventPublisher, LogPublisher},
    scheduler::{JobTable, SchedulerWorker},
    state::AppState,
    tasks::{ServerTaskAllocator, TaskDomainReconciler, TaskRefreshService},
};
use areaplane_reconcile::RetryPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to AREAPLANE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(instance = %config.instance_name, "Starting areaplane manager");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let store = open_store(&config).await?;
    if config.dev_mode && bootstrap::seed_dev_world(store.as_ref()).await? {
        info!("Development world created");
    }

    let hosting = hosting_provider(&config)?;
    let dns = dns_provider(&config.dns)?;
    let publisher = event_publisher(&config.publisher).await?;
    info!(
        hosting = hosting.name(),
        dns = dns.name(),
        "Providers configured"
    );

    let retry = RetryPolicy::default();
    let allocator = Arc::new(ServerAllocator::new(
        store.clone(),
        config.manager.ssl_enabled,
        retry.clone(),
    ));
    let table = JobTable::reconciliation(
        &config.scheduler,
        allocator.clone(),
        Arc::new(ServerTaskAllocator::new(
            store.clone(),
            hosting.clone(),
            config.manager.clone(),
            retry.clone(),
        )),
        Arc::new(TaskRefreshService::new(store.clone(), hosting, retry.clone())),
        Arc::new(TaskDomainReconciler::new(
            store.clone(),
            dns,
            config.manager.clone(),
            retry,
        )),
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_worker = SchedulerWorker::new(table, publisher.clone(), &config.instance_name);
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(store, allocator, publisher, config.instance_name.clone());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    info!("Manager shutdown complete");
    Ok(())
}

async fn open_store(config: &config::Config) -> Result<Arc<dyn WorldStore>> {
    match config.store {
        StoreKind::Memory => {
            warn!("Using in-memory store; state is lost on exit");
            let store: Arc<dyn WorldStore> = Arc::new(MemoryStore::new());
            Ok(store)
        }
        StoreKind::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            // Run migrations in dev mode
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            let store: Arc<dyn WorldStore> = Arc::new(db.world_store());
            Ok(store)
        }
    }
}

fn hosting_provider(config: &config::Config) -> Result<Arc<dyn HostingProvider>> {
    let provider: Arc<dyn HostingProvider> = match &config.hosting {
        HostingConfig::Local => Arc::new(LocalHosting::new()),
        HostingConfig::Docker {
            engine_url,
            network,
        } => Arc::new(DockerHosting::new(
            engine_url.as_str(),
            network.clone(),
            RoleImages::from_settings(&config.manager),
        )?),
    };
    Ok(provider)
}

fn dns_provider(config: &DnsConfig) -> Result<Arc<dyn DnsProvider>> {
    let provider: Arc<dyn DnsProvider> = match config {
        DnsConfig::Log => Arc::new(LogDns::new()),
        DnsConfig::Cloudflare {
            api_base,
            api_token,
            zone_id,
            ttl,
        } => Arc::new(CloudflareDns::new(
            api_base.as_str(),
            api_token.as_str(),
            zone_id.as_str(),
            *ttl,
        )?),
    };
    Ok(provider)
}

async fn event_publisher(config: &PublisherConfig) -> Result<Arc<dyn EventPublisher>> {
    let publisher: Arc<dyn EventPublisher> = match config {
        PublisherConfig::Log => Arc::new(LogPublisher),
        PublisherConfig::Broadcast { capacity } => Arc::new(BroadcastPublisher::new(*capacity)),
        #[cfg(feature = "nats")]
        PublisherConfig::Nats {
            url,
            subject_prefix,
        } => Arc::new(
            areaplane_manager::publisher::NatsPublisher::connect(url, subject_prefix.as_str())
                .await?,
        ),
        #[cfg(not(feature = "nats"))]
        PublisherConfig::Nats { .. } => {
            anyhow::bail!("the nats publisher requires building with the `nats` feature")
        }
    };
    Ok(publisher)
}
