//! DNS provider boundary.
//!
//! The only operation is an idempotent upsert of the full address set of a
//! domain: after `create_or_update_record(domain, ips)` the provider
//! resolves `domain` to exactly `ips`.

mod cloudflare;
mod log;

pub use cloudflare::CloudflareDns;
pub use log::LogDns;

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    /// The provider API answered with a non-success status.
    #[error("dns api returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The provider reported failure in an otherwise successful response.
    #[error("dns provider error: {0}")]
    Provider(String),

    #[error("dns http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_or_update_record(
        &self,
        domain: &str,
        ips: &BTreeSet<IpAddr>,
    ) -> Result<(), DnsError>;
}
