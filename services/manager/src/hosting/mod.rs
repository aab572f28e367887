//! Compute provider boundary.
//!
//! [`HostingProvider`] is the complete contract with whatever runs server
//! processes: `poll`, `start_server_task`, `stop_server_task`. Provider
//! object shapes are translated into [`HostedTask`] here and nowhere else.

mod docker;
mod ecs;
mod local;

pub use docker::DockerHosting;
pub use ecs::{
    EcsApi, EcsAttachment, EcsConfig, EcsContainer, EcsHosting, EcsNetworkInterface,
    EcsRunTaskRequest, EcsRunTaskResponse, EcsSecurityGroup, EcsSubnet, EcsTask, EcsTaskFailure,
};
pub use local::LocalHosting;

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ManagerSettings;
use crate::model::{Server, TaskRole};

/// Container port every server process listens on for websockets.
pub const SERVER_WEB_SOCKET_PORT: u16 = 8889;

/// Hosting provider errors.
#[derive(Debug, Error)]
pub enum HostingError {
    /// The provider rejected or failed a request.
    #[error("provider request failed: {0}")]
    Provider(String),

    /// The provider reported that a task could not be launched.
    #[error("failed to launch server task: {0}")]
    LaunchFailed(String),

    /// A provider response was missing a required field.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// Transport failure talking to the provider.
    #[error("provider http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A task as observed at (or returned by) the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedTask {
    pub identifier: String,
    pub role: TaskRole,
    pub private_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
}

/// Compute provider port.
#[async_trait]
pub trait HostingProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Enumerates every running manager, kiosk and server task.
    async fn poll(&self) -> Result<Vec<HostedTask>, HostingError>;

    /// Launches a server task for `server`.
    ///
    /// Launch failures are returned, never retried here.
    async fn start_server_task(
        &self,
        server: &Server,
        params: &LaunchParameters,
    ) -> Result<HostedTask, HostingError>;

    /// Requests termination; stopping an already stopped task succeeds.
    async fn stop_server_task(&self, identifier: &str) -> Result<(), HostingError>;
}

/// Launch-time parameters of a server task, as a flat string map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParameters(BTreeMap<String, String>);

impl LaunchParameters {
    pub const MAP_NAME: &'static str = "MAP_NAME";
    pub const SERVER_ID: &'static str = "SERVER_ID";
    pub const REGION_ID: &'static str = "REGION_ID";
    pub const INITIAL_AREA_INDEXES: &'static str = "INITIAL_AREA_INDEXES";
    pub const MAX_PAWNS: &'static str = "MAX_PAWNS";
    pub const MAX_PLAYERS: &'static str = "MAX_PLAYERS";
    pub const MAX_BOTS: &'static str = "MAX_BOTS";
    pub const FEATURE_FLAGS: &'static str = "FEATURE_FLAGS";

    pub fn for_server(server: &Server, settings: &ManagerSettings) -> Self {
        let area_indexes = server
            .state
            .areas
            .iter()
            .map(|a| a.index.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut params = BTreeMap::new();
        params.insert(Self::MAP_NAME.to_string(), server.state.map_name.clone());
        params.insert(Self::SERVER_ID.to_string(), server.id.to_string());
        params.insert(Self::REGION_ID.to_string(), server.state.region_id.to_string());
        params.insert(Self::INITIAL_AREA_INDEXES.to_string(), area_indexes);
        params.insert(Self::MAX_PAWNS.to_string(), settings.max_pawns.to_string());
        params.insert(Self::MAX_PLAYERS.to_string(), settings.max_players.to_string());
        params.insert(Self::MAX_BOTS.to_string(), settings.max_bots.to_string());
        params.insert(Self::FEATURE_FLAGS.to_string(), settings.feature_flags.clone());
        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `KEY=value` pairs, the form container environments take.
    pub fn to_env(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Which image runs which role.
#[derive(Debug, Clone)]
pub struct RoleImages {
    pub manager: String,
    pub kiosk: String,
    pub server: String,
}

/// Role of a task, before role-specific payload is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Manager,
    Kiosk,
    Server,
}

impl RoleImages {
    pub fn from_settings(settings: &ManagerSettings) -> Self {
        Self {
            manager: settings.manager_image.clone(),
            kiosk: settings.kiosk_image.clone(),
            server: settings.server_image.clone(),
        }
    }

    /// Classifies by image reference; registry prefixes and tags are allowed
    /// around the configured name. An empty configured name matches nothing.
    pub fn classify(&self, image: &str) -> Option<RoleKind> {
        let matches = |name: &str| !name.is_empty() && image.contains(name);
        if matches(&self.server) {
            Some(RoleKind::Server)
        } else if matches(&self.manager) {
            Some(RoleKind::Manager)
        } else if matches(&self.kiosk) {
            Some(RoleKind::Kiosk)
        } else {
            None
        }
    }
}

/// Parses an optional address string from a provider response; empty
/// strings mean "not assigned".
pub(crate) fn parse_ip(value: Option<&str>) -> Result<Option<IpAddr>, HostingError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| HostingError::MalformedResponse(format!("invalid IP address '{s}'"))),
    }
}
