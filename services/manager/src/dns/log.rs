//! DNS provider for local runs: records upserts instead of making them.

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{DnsError, DnsProvider};

#[derive(Debug, Default)]
pub struct LogDns {
    records: Mutex<Vec<(String, BTreeSet<IpAddr>)>>,
}

impl LogDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert accepted so far, in call order.
    pub async fn records(&self) -> Vec<(String, BTreeSet<IpAddr>)> {
        self.records.lock().await.clone()
    }

    fn is_local(domain: &str) -> bool {
        domain == "localhost" || domain.ends_with(".localhost")
    }
}

#[async_trait]
impl DnsProvider for LogDns {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn create_or_update_record(
        &self,
        domain: &str,
        ips: &BTreeSet<IpAddr>,
    ) -> Result<(), DnsError> {
        if ips.is_empty() || Self::is_local(domain) {
            debug!(domain, "Skipping DNS record");
            return Ok(());
        }

        let addresses: Vec<String> = ips.iter().map(IpAddr::to_string).collect();
        info!(domain, addresses = ?addresses, "Upserting DNS record");
        self.records
            .lock()
            .await
            .push((domain.to_string(), ips.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(values: &[&str]) -> BTreeSet<IpAddr> {
        values.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_records_upserts() {
        let dns = LogDns::new();
        dns.create_or_update_record("3-server.example.com", &ips(&["54.1.2.3"]))
            .await
            .unwrap();

        assert_eq!(
            dns.records().await,
            vec![("3-server.example.com".to_string(), ips(&["54.1.2.3"]))]
        );
    }

    #[tokio::test]
    async fn test_ignores_localhost_and_empty_sets() {
        let dns = LogDns::new();
        dns.create_or_update_record("localhost", &ips(&["127.0.0.1"]))
            .await
            .unwrap();
        dns.create_or_update_record("1-server.localhost", &ips(&["127.0.0.1"]))
            .await
            .unwrap();
        dns.create_or_update_record("kiosk.example.com", &BTreeSet::new())
            .await
            .unwrap();

        assert!(dns.records().await.is_empty());
    }
}
