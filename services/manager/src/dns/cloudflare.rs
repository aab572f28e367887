//! Cloudflare v4 API DNS provider.
//!
//! An upsert lists the A/AAAA records of the name, deletes those whose
//! address is not wanted and creates the missing ones. Re-upserting an
//! identical set lists and writes nothing.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument};

use super::{DnsError, DnsProvider};

pub struct CloudflareDns {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
    zone_id: String,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
}

fn record_type(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "A",
        IpAddr::V6(_) => "AAAA",
    }
}

impl CloudflareDns {
    pub fn new(
        api_base: impl Into<String>,
        api_token: impl Into<String>,
        zone_id: impl Into<String>,
        ttl: u32,
    ) -> Result<Self, DnsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            zone_id: zone_id.into(),
            ttl,
        })
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.api_base, self.zone_id)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>, DnsError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Cloudflare API request failed");
            return Err(DnsError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ApiResponse<T> = response.json().await?;
        if !parsed.success {
            let errors = parsed
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DnsError::Provider(errors));
        }
        Ok(parsed.result)
    }

    async fn list(&self, domain: &str) -> Result<Vec<DnsRecord>, DnsError> {
        let response = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.api_token)
            .query(&[("name", domain), ("per_page", "100")])
            .send()
            .await?;
        let records: Vec<DnsRecord> = Self::read(response).await?.unwrap_or_default();
        Ok(records
            .into_iter()
            .filter(|r| r.record_type == "A" || r.record_type == "AAAA")
            .collect())
    }

    async fn delete(&self, record_id: &str) -> Result<(), DnsError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(), record_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::read::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn create(&self, domain: &str, ip: &IpAddr) -> Result<(), DnsError> {
        let response = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&json!({
                "type": record_type(ip),
                "name": domain,
                "content": ip.to_string(),
                "ttl": self.ttl,
                "proxied": false
            }))
            .send()
            .await?;
        Self::read::<serde_json::Value>(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    #[instrument(skip(self, ips), fields(ip_count = ips.len()))]
    async fn create_or_update_record(
        &self,
        domain: &str,
        ips: &BTreeSet<IpAddr>,
    ) -> Result<(), DnsError> {
        let existing = self.list(domain).await?;

        let mut present = BTreeSet::new();
        for record in &existing {
            match record.content.parse::<IpAddr>() {
                Ok(ip) if ips.contains(&ip) && record_type(&ip) == record.record_type => {
                    // Duplicates of a wanted address are removed too.
                    if !present.insert(ip) {
                        self.delete(&record.id).await?;
                    }
                }
                _ => {
                    info!(record_id = %record.id, content = %record.content, "Deleting DNS record");
                    self.delete(&record.id).await?;
                }
            }
        }

        for ip in ips.difference(&present) {
            info!(ip = %ip, "Creating DNS record");
            self.create(domain, ip).await?;
        }

        debug!("DNS record up to date");
        Ok(())
    }
}
