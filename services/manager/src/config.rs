use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// Identifies this manager instance in published events.
    pub instance_name: String,
    pub store: StoreKind,
    pub database: DbConfig,
    pub scheduler: SchedulerConfig,
    pub manager: ManagerSettings,
    pub hosting: HostingConfig,
    pub dns: DnsConfig,
    pub publisher: PublisherConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("AREAPLANE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = env_or("AREAPLANE_LOG_LEVEL", "info");

        let dev_mode = env_flag("AREAPLANE_DEV", false);

        let instance_name = std::env::var("AREAPLANE_INSTANCE_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "manager".to_string());

        let database = DbConfig::from_env();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            instance_name,
            store: StoreKind::from_env(dev_mode)?,
            database,
            scheduler: SchedulerConfig::from_env(),
            manager: ManagerSettings::from_env()?,
            hosting: HostingConfig::from_env()?,
            dns: DnsConfig::from_env()?,
            publisher: PublisherConfig::from_env()?,
        })
    }
}

/// Backing store of the world model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// In-process store; state is lost on restart. Dev mode only.
    Memory,
}

impl StoreKind {
    pub fn from_env(dev_mode: bool) -> Result<Self> {
        match env_or("AREAPLANE_STORE", "postgres").as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" if dev_mode => Ok(Self::Memory),
            "memory" => bail!("the memory store requires AREAPLANE_DEV=true"),
            other => bail!("unknown store '{other}' (expected postgres or memory)"),
        }
    }
}

/// Intervals of the reconciliation jobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub allocate_servers_interval: Duration,
    pub allocate_server_tasks_interval: Duration,
    pub refresh_tasks_interval: Duration,
    pub manage_task_domains_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allocate_servers_interval: Duration::from_secs(10),
            allocate_server_tasks_interval: Duration::from_secs(10),
            refresh_tasks_interval: Duration::from_secs(10),
            manage_task_domains_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allocate_servers_interval: env_secs(
                "AREAPLANE_ALLOCATE_SERVERS_INTERVAL_SECS",
                defaults.allocate_servers_interval,
            ),
            allocate_server_tasks_interval: env_secs(
                "AREAPLANE_ALLOCATE_SERVER_TASKS_INTERVAL_SECS",
                defaults.allocate_server_tasks_interval,
            ),
            refresh_tasks_interval: env_secs(
                "AREAPLANE_REFRESH_TASKS_INTERVAL_SECS",
                defaults.refresh_tasks_interval,
            ),
            manage_task_domains_interval: env_secs(
                "AREAPLANE_MANAGE_TASK_DOMAINS_INTERVAL_SECS",
                defaults.manage_task_domains_interval,
            ),
        }
    }
}

/// Settings shared by the reconcilers.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub manager_domain: String,
    pub kiosk_domain: String,
    /// Suffix of server hostnames: `<server_id>-<server_domain>`.
    pub server_domain: String,
    pub manager_image: String,
    pub kiosk_image: String,
    pub server_image: String,
    pub max_pawns: u32,
    pub max_players: u32,
    pub max_bots: u32,
    pub feature_flags: String,
    /// Transport security for server websockets (`wss://<domain>`).
    pub ssl_enabled: bool,
    /// Server tasks initiated more recently than this are never stopped.
    pub stale_task_grace: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            manager_domain: "manager.localhost".to_string(),
            kiosk_domain: "localhost".to_string(),
            server_domain: "server.localhost".to_string(),
            manager_image: "adhoc_manager".to_string(),
            kiosk_image: "adhoc_kiosk".to_string(),
            server_image: "adhoc_server".to_string(),
            max_pawns: 32,
            max_players: 16,
            max_bots: 16,
            feature_flags: String::new(),
            ssl_enabled: false,
            stale_task_grace: Duration::from_secs(60),
        }
    }
}

impl ManagerSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            manager_domain: env_or("AREAPLANE_MANAGER_DOMAIN", &defaults.manager_domain),
            kiosk_domain: env_or("AREAPLANE_KIOSK_DOMAIN", &defaults.kiosk_domain),
            server_domain: env_or("AREAPLANE_SERVER_DOMAIN", &defaults.server_domain),
            manager_image: env_or("AREAPLANE_MANAGER_IMAGE", &defaults.manager_image),
            kiosk_image: env_or("AREAPLANE_KIOSK_IMAGE", &defaults.kiosk_image),
            server_image: env_or("AREAPLANE_SERVER_IMAGE", &defaults.server_image),
            max_pawns: env_parse("AREAPLANE_MAX_PAWNS", defaults.max_pawns),
            max_players: env_parse("AREAPLANE_MAX_PLAYERS", defaults.max_players),
            max_bots: env_parse("AREAPLANE_MAX_BOTS", defaults.max_bots),
            feature_flags: env_or("AREAPLANE_FEATURE_FLAGS", &defaults.feature_flags),
            ssl_enabled: env_flag("AREAPLANE_SSL_ENABLED", defaults.ssl_enabled),
            stale_task_grace: env_secs("AREAPLANE_STALE_TASK_GRACE_SECS", defaults.stale_task_grace),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Image names classify polled tasks by substring, so an empty one
    /// would match every task.
    pub fn validate(&self) -> Result<()> {
        for (key, image) in [
            ("AREAPLANE_MANAGER_IMAGE", &self.manager_image),
            ("AREAPLANE_KIOSK_IMAGE", &self.kiosk_image),
            ("AREAPLANE_SERVER_IMAGE", &self.server_image),
        ] {
            if image.trim().is_empty() {
                bail!("{key} must not be empty");
            }
        }
        Ok(())
    }
}

/// Which compute provider backs server tasks.
///
/// The ECS adapter needs an injected [`crate::hosting::EcsApi`] client and is
/// only available when embedding the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostingConfig {
    Local,
    Docker {
        engine_url: String,
        network: Option<String>,
    },
}

impl HostingConfig {
    pub fn from_env() -> Result<Self> {
        match env_or("AREAPLANE_HOSTING", "local").as_str() {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker {
                engine_url: env_or("AREAPLANE_DOCKER_URL", "http://127.0.0.1:2375"),
                network: std::env::var("AREAPLANE_DOCKER_NETWORK").ok(),
            }),
            other => bail!("unknown hosting provider '{other}' (expected local or docker)"),
        }
    }
}

/// Which DNS provider receives record upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsConfig {
    Log,
    Cloudflare {
        api_base: String,
        api_token: String,
        zone_id: String,
        ttl: u32,
    },
}

impl DnsConfig {
    pub fn from_env() -> Result<Self> {
        match env_or("AREAPLANE_DNS", "log").as_str() {
            "log" => Ok(Self::Log),
            "cloudflare" => {
                let Ok(api_token) = std::env::var("AREAPLANE_CLOUDFLARE_API_TOKEN") else {
                    bail!("AREAPLANE_CLOUDFLARE_API_TOKEN is required for cloudflare DNS");
                };
                let Ok(zone_id) = std::env::var("AREAPLANE_CLOUDFLARE_ZONE_ID") else {
                    bail!("AREAPLANE_CLOUDFLARE_ZONE_ID is required for cloudflare DNS");
                };
                Ok(Self::Cloudflare {
                    api_base: env_or(
                        "AREAPLANE_CLOUDFLARE_API_BASE",
                        "https://api.cloudflare.com/client/v4",
                    ),
                    api_token,
                    zone_id,
                    ttl: env_parse("AREAPLANE_DNS_TTL", 60),
                })
            }
            other => bail!("unknown DNS provider '{other}' (expected log or cloudflare)"),
        }
    }
}

/// Where domain events go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherConfig {
    Log,
    Broadcast { capacity: usize },
    Nats { url: String, subject_prefix: String },
}

impl PublisherConfig {
    pub fn from_env() -> Result<Self> {
        match env_or("AREAPLANE_PUBLISHER", "log").as_str() {
            "log" => Ok(Self::Log),
            "broadcast" => Ok(Self::Broadcast {
                capacity: env_parse("AREAPLANE_BROADCAST_CAPACITY", 1024),
            }),
            "nats" => Ok(Self::Nats {
                url: env_or("AREAPLANE_NATS_URL", "nats://127.0.0.1:4222"),
                subject_prefix: env_or("AREAPLANE_NATS_SUBJECT_PREFIX", "areaplane"),
            }),
            other => bail!("unknown publisher '{other}' (expected log, broadcast or nats)"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.allocate_servers_interval, Duration::from_secs(10));
        assert_eq!(config.refresh_tasks_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_manager_settings_defaults() {
        let settings = ManagerSettings::default();
        assert!(!settings.ssl_enabled);
        assert_eq!(settings.stale_task_grace, Duration::from_secs(60));
        assert_eq!(settings.server_image, "adhoc_server");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let settings = ManagerSettings {
            kiosk_image: " ".to_string(),
            ..ManagerSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("AREAPLANE_KIOSK_IMAGE"));
    }
}
