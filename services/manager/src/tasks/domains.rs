use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use areaplane_events::DomainEvent;
use areaplane_id::TaskId;
use areaplane_reconcile::{retry_transient, RetryPolicy};
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerSettings;
use crate::db::{DbError, WorldStore};
use crate::dns::DnsProvider;
use crate::error::ManagerResult;
use crate::model::TaskRole;

/// DNS name a task of `role` is published under.
pub fn canonical_domain(role: &TaskRole, settings: &ManagerSettings) -> String {
    match role {
        TaskRole::Manager => settings.manager_domain.clone(),
        TaskRole::Kiosk => settings.kiosk_domain.clone(),
        TaskRole::Server { server_id, .. } => format!("{server_id}-{}", settings.server_domain),
    }
}

/// Assigns DNS names to tasks with a public address.
pub struct TaskDomainReconciler {
    store: Arc<dyn WorldStore>,
    dns: Arc<dyn DnsProvider>,
    settings: ManagerSettings,
    retry: RetryPolicy,
}

impl TaskDomainReconciler {
    pub fn new(
        store: Arc<dyn WorldStore>,
        dns: Arc<dyn DnsProvider>,
        settings: ManagerSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            dns,
            settings,
            retry,
        }
    }

    /// One pass. The record of a domain covers every task resolving to it,
    /// including tasks assigned in earlier passes.
    #[instrument(skip(self), fields(provider = self.dns.name()))]
    pub async fn manage_task_domains(&self) -> ManagerResult<Vec<DomainEvent>> {
        let tasks = retry_transient(&self.retry, "list_tasks", || self.store.list_tasks()).await?;

        let mut pending: BTreeMap<String, Vec<TaskId>> = BTreeMap::new();
        let mut addresses: BTreeMap<String, BTreeSet<IpAddr>> = BTreeMap::new();
        for task in &tasks {
            let Some(ip) = task.public_ip else {
                continue;
            };
            let domain = canonical_domain(&task.role, &self.settings);
            match task.domain.as_deref() {
                None => pending.entry(domain.clone()).or_default().push(task.id),
                Some(assigned) if assigned == domain => {}
                Some(_) => continue,
            }
            addresses.entry(domain).or_default().insert(ip);
        }

        for (domain, ids) in pending {
            let ips = addresses.get(&domain).cloned().unwrap_or_default();
            if let Err(e) = self.dns.create_or_update_record(&domain, &ips).await {
                warn!(domain = %domain, error = %e, "Failed to update DNS record");
                continue;
            }
            info!(domain = %domain, ip_count = ips.len(), "DNS record updated");

            for id in ids {
                let result = retry_transient(&self.retry, "set_task_domain", || {
                    self.store.set_task_domain(id, &domain)
                })
                .await;
                match result {
                    Ok(()) => {}
                    // Deleted by a refresh in the meantime.
                    Err(DbError::NotFound { .. }) => {
                        debug!(task_id = %id, "Task vanished before domain assignment");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::dns::{DnsError, LogDns};
    use crate::hosting::HostedTask;
    use areaplane_id::ServerId;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Rejects upserts for the given domains and records the rest.
    struct RejectingDns {
        rejected: BTreeSet<String>,
        inner: LogDns,
    }

    #[async_trait]
    impl DnsProvider for RejectingDns {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn create_or_update_record(
            &self,
            domain: &str,
            ips: &BTreeSet<IpAddr>,
        ) -> Result<(), DnsError> {
            if self.rejected.contains(domain) {
                return Err(DnsError::Api {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.inner.create_or_update_record(domain, ips).await
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            manager_domain: "manager.example.com".to_string(),
            kiosk_domain: "example.com".to_string(),
            server_domain: "server.example.com".to_string(),
            ..ManagerSettings::default()
        }
    }

    fn hosted(identifier: &str, role: TaskRole, public: Option<&str>) -> HostedTask {
        HostedTask {
            identifier: identifier.to_string(),
            role,
            private_ip: None,
            public_ip: public.map(|ip| ip.parse().unwrap()),
        }
    }

    fn server_role(id: i64) -> TaskRole {
        TaskRole::Server {
            server_id: ServerId::new(id),
            public_web_socket_port: Some(8889),
        }
    }

    #[test]
    fn test_canonical_domains() {
        let settings = settings();
        assert_eq!(canonical_domain(&TaskRole::Manager, &settings), "manager.example.com");
        assert_eq!(canonical_domain(&TaskRole::Kiosk, &settings), "example.com");
        assert_eq!(canonical_domain(&server_role(7), &settings), "7-server.example.com");
    }

    #[tokio::test]
    async fn test_assigns_domains_to_public_tasks() {
        let store = Arc::new(MemoryStore::new());
        let dns = Arc::new(LogDns::new());
        let now = Utc::now();
        store
            .upsert_polled_task(&hosted("s3", server_role(3), Some("54.0.0.3")), now)
            .await
            .unwrap();
        store
            .upsert_polled_task(&hosted("private", server_role(4), None), now)
            .await
            .unwrap();
        let reconciler =
            TaskDomainReconciler::new(store.clone(), dns.clone(), settings(), RetryPolicy::immediate(3));

        reconciler.manage_task_domains().await.unwrap();

        let tasks = store.list_tasks().await.unwrap();
        let s3 = tasks.iter().find(|t| t.identifier == "s3").unwrap();
        assert_eq!(s3.domain.as_deref(), Some("3-server.example.com"));
        let private = tasks.iter().find(|t| t.identifier == "private").unwrap();
        assert_eq!(private.domain, None);
        let expected: BTreeSet<IpAddr> = ["54.0.0.3".parse().unwrap()].into_iter().collect();
        assert_eq!(
            dns.records().await,
            vec![("3-server.example.com".to_string(), expected)]
        );
    }

    #[tokio::test]
    async fn test_dns_failure_leaves_domain_unassigned() {
        let store = Arc::new(MemoryStore::new());
        let dns = Arc::new(RejectingDns {
            rejected: ["3-server.example.com".to_string()].into_iter().collect(),
            inner: LogDns::new(),
        });
        let now = Utc::now();
        store
            .upsert_polled_task(&hosted("s3", server_role(3), Some("54.0.0.3")), now)
            .await
            .unwrap();
        store
            .upsert_polled_task(&hosted("s4", server_role(4), Some("54.0.0.4")), now)
            .await
            .unwrap();
        let reconciler =
            TaskDomainReconciler::new(store.clone(), dns.clone(), settings(), RetryPolicy::immediate(3));

        let events = reconciler.manage_task_domains().await.unwrap();

        assert!(events.is_empty());
        let tasks = store.list_tasks().await.unwrap();
        let s3 = tasks.iter().find(|t| t.identifier == "s3").unwrap();
        assert_eq!(s3.domain, None);
        let s4 = tasks.iter().find(|t| t.identifier == "s4").unwrap();
        assert_eq!(s4.domain.as_deref(), Some("4-server.example.com"));
        let domains: Vec<String> = dns.inner.records().await.into_iter().map(|(d, _)| d).collect();
        assert_eq!(domains, vec!["4-server.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_new_kiosk_keeps_existing_addresses() {
        let store = Arc::new(MemoryStore::new());
        let dns = Arc::new(LogDns::new());
        let now = Utc::now();
        let first = store
            .upsert_polled_task(&hosted("k1", TaskRole::Kiosk, Some("54.0.0.1")), now)
            .await
            .unwrap();
        store.set_task_domain(first.id, "example.com").await.unwrap();
        store
            .upsert_polled_task(&hosted("k2", TaskRole::Kiosk, Some("54.0.0.2")), now)
            .await
            .unwrap();
        let reconciler =
            TaskDomainReconciler::new(store.clone(), dns.clone(), settings(), RetryPolicy::immediate(3));

        reconciler.manage_task_domains().await.unwrap();

        let records = dns.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "example.com");
        assert_eq!(records[0].1.len(), 2);
        assert!(store
            .list_tasks()
            .await
            .unwrap()
            .iter()
            .all(|t| t.domain.as_deref() == Some("example.com")));
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let dns = Arc::new(LogDns::new());
        store
            .upsert_polled_task(&hosted("m1", TaskRole::Manager, Some("54.0.0.9")), Utc::now())
            .await
            .unwrap();
        let reconciler =
            TaskDomainReconciler::new(store.clone(), dns.clone(), settings(), RetryPolicy::immediate(3));

        reconciler.manage_task_domains().await.unwrap();
        let version = store.list_tasks().await.unwrap()[0].version;
        reconciler.manage_task_domains().await.unwrap();

        assert_eq!(store.list_tasks().await.unwrap()[0].version, version);
    }
}
