//! Full reconciliation passes over the in-memory store and local providers.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use areaplane_events::DomainEvent;
use areaplane_id::{AreaId, RegionId};
use areaplane_manager::{
    allocation::{ServerAllocator, ServerStarted},
    config::{ManagerSettings, SchedulerConfig},
    db::{MemoryStore, WorldStore},
    dns::LogDns,
    hosting::{HostedTask, HostingError, HostingProvider, LaunchParameters, LocalHosting},
    model::{Position, Server},
    publisher::BroadcastPublisher,
    scheduler::{JobTable, SchedulerWorker},
    tasks::{canonical_domain, ServerTaskAllocator, TaskDomainReconciler, TaskRefreshService},
};
use areaplane_reconcile::RetryPolicy;
use async_trait::async_trait;
use tokio::sync::watch;

/// Local hosting that also records the start and stop requests it gets.
struct RecordingHosting {
    inner: LocalHosting,
    starts: AtomicUsize,
    stops: Mutex<Vec<String>>,
}

impl RecordingHosting {
    fn new() -> Self {
        Self {
            inner: LocalHosting::new().with_infrastructure_tasks(),
            starts: AtomicUsize::new(0),
            stops: Mutex::new(Vec::new()),
        }
    }

    fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stop_calls(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostingProvider for RecordingHosting {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn poll(&self) -> Result<Vec<HostedTask>, HostingError> {
        self.inner.poll().await
    }

    async fn start_server_task(
        &self,
        server: &Server,
        params: &LaunchParameters,
    ) -> Result<HostedTask, HostingError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start_server_task(server, params).await
    }

    async fn stop_server_task(&self, identifier: &str) -> Result<(), HostingError> {
        self.stops.lock().unwrap().push(identifier.to_string());
        self.inner.stop_server_task(identifier).await
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    hosting: Arc<RecordingHosting>,
    dns: Arc<LogDns>,
    settings: ManagerSettings,
    allocator: Arc<ServerAllocator>,
    server_tasks: Arc<ServerTaskAllocator>,
    refresh: Arc<TaskRefreshService>,
    domains: Arc<TaskDomainReconciler>,
    region_id: RegionId,
    area_a: AreaId,
    area_b: AreaId,
}

fn settings() -> ManagerSettings {
    ManagerSettings {
        manager_domain: "manager.example.com".to_string(),
        kiosk_domain: "example.com".to_string(),
        server_domain: "server.example.com".to_string(),
        stale_task_grace: Duration::ZERO,
        ..ManagerSettings::default()
    }
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,areaplane_manager=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new());
    let region = store.insert_region("1", "Region0001").await.unwrap();
    let area_a = store
        .insert_area(region.id, 0, "A", Position::new(1250.0, 1800.0, 0.0))
        .await
        .unwrap();
    let area_b = store
        .insert_area(region.id, 1, "B", Position::new(1500.0, 750.0, 0.0))
        .await
        .unwrap();

    let hosting = Arc::new(RecordingHosting::new());
    let dns = Arc::new(LogDns::new());
    let settings = settings();
    let retry = RetryPolicy::immediate(3);

    Harness {
        allocator: Arc::new(ServerAllocator::new(store.clone(), false, retry.clone())),
        server_tasks: Arc::new(ServerTaskAllocator::new(
            store.clone(),
            hosting.clone(),
            settings.clone(),
            retry.clone(),
        )),
        refresh: Arc::new(TaskRefreshService::new(
            store.clone(),
            hosting.clone(),
            retry.clone(),
        )),
        domains: Arc::new(TaskDomainReconciler::new(
            store.clone(),
            dns.clone(),
            settings.clone(),
            retry,
        )),
        store,
        hosting,
        dns,
        settings,
        region_id: region.id,
        area_a: area_a.id,
        area_b: area_b.id,
    }
}

impl Harness {
    async fn servers(&self) -> Vec<Server> {
        self.store.list_servers().await.unwrap()
    }

    async fn holder_of(&self, area_id: AreaId) -> Server {
        self.servers()
            .await
            .into_iter()
            .find(|s| s.state.holds(area_id))
            .expect("area has a server")
    }

    /// Every area of the region is held by exactly one server, and its back
    /// reference names that server.
    async fn assert_coverage(&self) {
        let snapshot = self.store.region_snapshot(self.region_id).await.unwrap();
        for area in &snapshot.areas {
            let holders: Vec<_> = snapshot
                .servers
                .iter()
                .filter(|s| s.state.holds(area.id))
                .map(|s| s.id)
                .collect();
            assert_eq!(holders.len(), 1, "area {} held by {holders:?}", area.id);
            assert_eq!(area.server_id, Some(holders[0]));
        }
    }

    async fn full_pass(&self) -> Vec<DomainEvent> {
        let mut events = self.allocator.allocate_servers().await.unwrap();
        events.extend(self.server_tasks.allocate_server_tasks().await.unwrap());
        events.extend(self.refresh.refresh_tasks().await.unwrap());
        events.extend(self.domains.manage_task_domains().await.unwrap());
        events
    }
}

fn server_events(events: &[DomainEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DomainEvent::ServerUpdated(_)))
        .count()
}

#[tokio::test]
async fn test_two_areas_get_two_enabled_inactive_servers() {
    let h = harness().await;

    let events = h.allocator.allocate_servers().await.unwrap();

    assert_eq!(server_events(&events), 2);
    let servers = h.servers().await;
    assert_eq!(servers.len(), 2);
    for server in &servers {
        assert!(server.state.enabled);
        assert!(!server.state.active);
        assert_eq!(server.state.areas.len(), 1);
    }
    assert_ne!(h.holder_of(h.area_a).await.id, h.holder_of(h.area_b).await.id);
    h.assert_coverage().await;
}

#[tokio::test]
async fn test_allocation_is_idempotent() {
    let h = harness().await;
    h.allocator.allocate_servers().await.unwrap();
    let before = h.servers().await;

    let events = h.allocator.allocate_servers().await.unwrap();

    assert!(events.is_empty());
    assert_eq!(h.servers().await, before);
}

#[tokio::test]
async fn test_full_loop_converges_and_goes_quiet() {
    let h = harness().await;

    let first = h.full_pass().await;
    assert_eq!(server_events(&first), 2);
    assert!(first.iter().any(|e| matches!(e, DomainEvent::WorldUpdated(_))));
    assert_eq!(h.hosting.inner.running_servers().await.len(), 2);

    // The next allocation picks up the task addresses and domains.
    let second = h.full_pass().await;
    assert_eq!(server_events(&second), 2);
    for server in h.servers().await {
        let task = h.store.server_task(server.id).await.unwrap().unwrap();
        assert_eq!(
            server.state.domain.as_deref(),
            Some(canonical_domain(&task.role, &h.settings).as_str())
        );
        assert_eq!(server.state.public_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(server.state.web_socket_url, None);
    }

    for server in h.servers().await {
        let event = h
            .allocator
            .handle_server_started(server.id, ServerStarted { server_id: server.id })
            .await
            .unwrap();
        assert!(event.is_some());
    }
    for server in h.servers().await {
        assert!(server.state.active);
        assert_eq!(
            server.state.web_socket_url.as_deref(),
            Some("ws://127.0.0.1:8889")
        );
    }

    let quiet = h.full_pass().await;
    assert!(quiet.is_empty(), "unexpected events: {quiet:?}");
    assert_eq!(h.hosting.start_calls(), 2);
    h.assert_coverage().await;
}

#[tokio::test]
async fn test_public_server_task_gets_one_dns_upsert() {
    let h = harness().await;
    h.full_pass().await;

    let records = h.dns.records().await;
    let server_domains: Vec<&String> = records
        .iter()
        .map(|(domain, _)| domain)
        .filter(|domain| domain.ends_with("-server.example.com"))
        .collect();
    assert_eq!(server_domains.len(), 2);
    let unique: BTreeSet<_> = server_domains.iter().collect();
    assert_eq!(unique.len(), 2);
    let localhost: BTreeSet<IpAddr> = ["127.0.0.1".parse().unwrap()].into_iter().collect();
    for (domain, ips) in &records {
        if domain.ends_with("-server.example.com") {
            assert_eq!(ips, &localhost);
        }
    }

    // assigned domains are not upserted again
    h.domains.manage_task_domains().await.unwrap();
    assert_eq!(h.dns.records().await.len(), records.len());
}

#[tokio::test]
async fn test_removed_area_disables_server_and_stops_its_task() {
    let h = harness().await;
    h.full_pass().await;
    h.full_pass().await;
    let orphaned = h.holder_of(h.area_b).await;
    h.allocator
        .handle_server_started(orphaned.id, ServerStarted { server_id: orphaned.id })
        .await
        .unwrap();
    let task = h.store.server_task(orphaned.id).await.unwrap().unwrap();

    h.store.delete_area(h.area_b).await.unwrap();
    let events = h.allocator.allocate_servers().await.unwrap();

    assert_eq!(server_events(&events), 1);
    let disabled = h.store.get_server(orphaned.id).await.unwrap().unwrap();
    assert!(!disabled.state.enabled);
    assert!(disabled.state.areas.is_empty());
    // still backed by its task
    assert!(disabled.state.active);
    assert_eq!(disabled.state.web_socket_url, None);

    h.server_tasks.allocate_server_tasks().await.unwrap();
    assert_eq!(h.hosting.stop_calls(), vec![task.identifier.clone()]);
    assert!(h.store.server_task(orphaned.id).await.unwrap().is_none());

    h.allocator.allocate_servers().await.unwrap();
    let inactive = h.store.get_server(orphaned.id).await.unwrap().unwrap();
    assert!(!inactive.state.active);
    assert_eq!(inactive.state.public_ip, None);

    // the remaining server is untouched
    let kept = h.holder_of(h.area_a).await;
    assert!(kept.state.enabled);
    h.assert_coverage().await;
}

#[tokio::test]
async fn test_concurrent_allocators_converge() {
    let h = harness().await;
    let other = ServerAllocator::new(h.store.clone(), false, RetryPolicy::immediate(5));

    let (left, right) = tokio::join!(h.allocator.allocate_servers(), other.allocate_servers());

    let total = server_events(&left.unwrap()) + server_events(&right.unwrap());
    assert_eq!(total, 2);
    assert_eq!(h.servers().await.len(), 2);
    h.assert_coverage().await;
    assert!(h.allocator.allocate_servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduler_drives_world_to_steady_state() {
    let h = harness().await;
    let interval = Duration::from_millis(10);
    let config = SchedulerConfig {
        allocate_servers_interval: interval,
        allocate_server_tasks_interval: interval,
        refresh_tasks_interval: interval,
        manage_task_domains_interval: interval,
    };
    let publisher = Arc::new(BroadcastPublisher::new(256));
    let mut events = publisher.subscribe();
    let table = JobTable::reconciliation(
        &config,
        h.allocator.clone(),
        h.server_tasks.clone(),
        h.refresh.clone(),
        h.domains.clone(),
    );
    let worker = SchedulerWorker::new(table, publisher.clone(), "manager-it");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let converged = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let servers = h.servers().await;
            if servers.len() == 2 && servers.iter().all(|s| s.state.domain.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(converged.is_ok(), "world did not converge");
    let (topic, envelope) = events.recv().await.unwrap();
    assert_eq!(topic, "events");
    assert_eq!(envelope.source, "manager-it");
    h.assert_coverage().await;
}
