//! Docker Engine hosting.
//!
//! Talks to the Docker Engine HTTP API: list + inspect containers for
//! polling, create + start for launches, forced removal for stops. Each
//! server container publishes its websocket port on `8889 + server_id`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use areaplane_id::ServerId;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument};

use super::{
    parse_ip, HostedTask, HostingError, HostingProvider, LaunchParameters, RoleImages, RoleKind,
    SERVER_WEB_SOCKET_PORT,
};
use crate::model::{Server, TaskRole};

const DEFAULT_NETWORK: &str = "bridge";

/// Docker Engine API client.
pub struct DockerHosting {
    client: reqwest::Client,
    base_url: String,
    network: String,
    images: RoleImages,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    config: ContainerConfig,
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    networks: HashMap<String, ContainerNetwork>,
}

#[derive(Debug, Deserialize)]
struct ContainerNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: Option<String>,
}

impl DockerHosting {
    /// Create a new Docker client.
    pub fn new(
        engine_url: impl Into<String>,
        network: Option<String>,
        images: RoleImages,
    ) -> Result<Self, HostingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: engine_url.into().trim_end_matches('/').to_string(),
            network: network.unwrap_or_else(|| DEFAULT_NETWORK.to_string()),
            images,
        })
    }

    /// Host port a server's websocket is published on.
    pub fn public_web_socket_port(server_id: ServerId) -> Result<u16, HostingError> {
        u16::try_from(server_id.get())
            .ok()
            .and_then(|id| SERVER_WEB_SOCKET_PORT.checked_add(id))
            .ok_or_else(|| {
                HostingError::Provider(format!("no websocket port available for server {server_id}"))
            })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, HostingError> {
        let url = format!("{}/containers/json", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list containers");
            return Err(HostingError::Provider(format!(
                "list containers: {status} - {body}"
            )));
        }

        Ok(response.json().await?)
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>, HostingError> {
        let url = format!("{}/containers/{}/json", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        // removed between list and inspect
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostingError::Provider(format!(
                "inspect container {id}: {status} - {body}"
            )));
        }

        Ok(Some(response.json().await?))
    }

    fn server_id_from_env(env: &[String]) -> Result<Option<ServerId>, HostingError> {
        let prefix = format!("{}=", LaunchParameters::SERVER_ID);
        env.iter()
            .find_map(|entry| entry.strip_prefix(&prefix))
            .map(|value| {
                value.parse::<ServerId>().map_err(|e| {
                    HostingError::MalformedResponse(format!("container SERVER_ID: {e}"))
                })
            })
            .transpose()
    }
}

#[async_trait]
impl HostingProvider for DockerHosting {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self))]
    async fn poll(&self) -> Result<Vec<HostedTask>, HostingError> {
        let containers = self.list_containers().await?;
        let mut tasks = Vec::new();

        for container in containers {
            let Some(kind) = self.images.classify(&container.image) else {
                continue;
            };
            let Some(inspected) = self.inspect_container(&container.id).await? else {
                continue;
            };
            let Some(network) = inspected.network_settings.networks.get(&self.network) else {
                debug!(container_id = %container.id, network = %self.network, "Container not on network");
                continue;
            };
            let private_ip = parse_ip(network.ip_address.as_deref())?;

            let task = match kind {
                RoleKind::Manager => HostedTask {
                    identifier: inspected.id,
                    role: TaskRole::Manager,
                    private_ip,
                    public_ip: None,
                },
                RoleKind::Kiosk => HostedTask {
                    identifier: inspected.id,
                    role: TaskRole::Kiosk,
                    private_ip,
                    public_ip: None,
                },
                RoleKind::Server => {
                    let env = inspected.config.env.unwrap_or_default();
                    let Some(server_id) = Self::server_id_from_env(&env)? else {
                        continue;
                    };
                    HostedTask {
                        identifier: inspected.id,
                        role: TaskRole::Server {
                            server_id,
                            public_web_socket_port: Some(Self::public_web_socket_port(server_id)?),
                        },
                        private_ip,
                        public_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                    }
                }
            };
            tasks.push(task);
        }

        debug!(count = tasks.len(), "Polled Docker containers");
        Ok(tasks)
    }

    #[instrument(skip(self, server, params), fields(server_id = %server.id))]
    async fn start_server_task(
        &self,
        server: &Server,
        params: &LaunchParameters,
    ) -> Result<HostedTask, HostingError> {
        let port = Self::public_web_socket_port(server.id)?;
        let container_port = format!("{SERVER_WEB_SOCKET_PORT}/tcp");

        info!(port, "Starting Docker container for server");

        let body = json!({
            "Image": format!("{}:latest", self.images.server),
            "Env": params.to_env(),
            "ExposedPorts": { container_port.clone(): {} },
            "HostConfig": {
                "PortBindings": {
                    container_port: [{ "HostIp": "0.0.0.0", "HostPort": port.to_string() }]
                },
                "AutoRemove": true
            }
        });

        let url = format!("{}/containers/create", self.base_url);
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostingError::LaunchFailed(format!(
                "create container: {status} - {body}"
            )));
        }
        let created: CreateContainerResponse = response.json().await?;
        let id = created
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HostingError::MalformedResponse("create container returned no Id".into()))?;

        let url = format!("{}/containers/{}/start", self.base_url, id);
        let response = self.client.post(&url).send().await?;
        // 304: already started
        if !response.status().is_success() && response.status() != StatusCode::NOT_MODIFIED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostingError::LaunchFailed(format!(
                "start container {id}: {status} - {body}"
            )));
        }

        Ok(HostedTask {
            identifier: id,
            role: TaskRole::Server {
                server_id: server.id,
                public_web_socket_port: Some(port),
            },
            private_ip: None,
            public_ip: None,
        })
    }

    #[instrument(skip(self))]
    async fn stop_server_task(&self, identifier: &str) -> Result<(), HostingError> {
        let url = format!("{}/containers/{}?force=true", self.base_url, identifier);
        let response = self.client.delete(&url).send().await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(HostingError::Provider(format!(
            "remove container {identifier}: {status} - {body}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerSettings;
    use crate::model::ServerState;
    use areaplane_id::{RegionId, Version};
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hosting(server: &MockServer) -> DockerHosting {
        DockerHosting::new(
            server.uri(),
            None,
            RoleImages::from_settings(&ManagerSettings::default()),
        )
        .unwrap()
    }

    fn inspect(id: &str, env: &[&str], ip: &str) -> serde_json::Value {
        json!({
            "Id": id,
            "Config": { "Env": env },
            "NetworkSettings": { "Networks": { "bridge": { "IPAddress": ip } } }
        })
    }

    #[tokio::test]
    async fn test_poll_classifies_containers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "Id": "aaa", "Image": "adhoc_server:latest" },
                { "Id": "bbb", "Image": "adhoc_manager:latest" },
                { "Id": "ccc", "Image": "postgres:16" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/containers/aaa/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(inspect(
                "aaa",
                &["MAP_NAME=Region0001", "SERVER_ID=7"],
                "172.17.0.3",
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/containers/bbb/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(inspect("bbb", &[], "172.17.0.2")))
            .mount(&server)
            .await;

        let tasks = hosting(&server).poll().await.unwrap();

        assert_eq!(tasks.len(), 2);
        let server_task = &tasks[0];
        assert_eq!(server_task.identifier, "aaa");
        assert_eq!(
            server_task.role,
            TaskRole::Server {
                server_id: ServerId::new(7),
                public_web_socket_port: Some(8896),
            }
        );
        assert_eq!(server_task.private_ip, Some("172.17.0.3".parse().unwrap()));
        assert_eq!(server_task.public_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(tasks[1].role, TaskRole::Manager);
    }

    #[tokio::test]
    async fn test_poll_rejects_bad_server_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "Id": "aaa", "Image": "adhoc_server" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/containers/aaa/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(inspect(
                "aaa",
                &["SERVER_ID=abc"],
                "172.17.0.3",
            )))
            .mount(&server)
            .await;

        let result = hosting(&server).poll().await;
        assert!(matches!(result, Err(HostingError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_start_creates_and_starts_container() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .and(body_partial_json(json!({
                "Image": "adhoc_server:latest",
                "HostConfig": { "PortBindings": { "8889/tcp": [{ "HostPort": "8891" }] } }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "Id": "new-id", "Warnings": [] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/containers/new-id/start"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let target = Server {
            id: ServerId::new(2),
            version: Version::INITIAL,
            state: ServerState::new(RegionId::new(1), "Region0001"),
        };
        let params = LaunchParameters::for_server(&target, &ManagerSettings::default());
        let task = hosting(&server)
            .start_server_task(&target, &params)
            .await
            .unwrap();

        assert_eq!(task.identifier, "new-id");
        assert_eq!(task.role.public_web_socket_port(), Some(8891));
    }

    #[tokio::test]
    async fn test_start_failure_is_launch_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such image"))
            .mount(&server)
            .await;

        let target = Server {
            id: ServerId::new(2),
            version: Version::INITIAL,
            state: ServerState::new(RegionId::new(1), "Region0001"),
        };
        let params = LaunchParameters::for_server(&target, &ManagerSettings::default());
        let result = hosting(&server).start_server_task(&target, &params).await;

        assert!(matches!(result, Err(HostingError::LaunchFailed(_))));
    }

    #[tokio::test]
    async fn test_stop_missing_container_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/containers/gone"))
            .and(query_param("force", "true"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        hosting(&server).stop_server_task("gone").await.unwrap();
    }
}
