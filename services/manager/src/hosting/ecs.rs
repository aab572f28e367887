//! Container-service (ECS style) hosting.
//!
//! The wire client is kept behind [`EcsApi`] so the translation from
//! service objects to [`HostedTask`] can be exercised without a cloud
//! account. Polling is two-stage: list and describe tasks, then resolve
//! every attached network interface's public address in one bulk call.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use areaplane_id::ServerId;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{
    parse_ip, HostedTask, HostingError, HostingProvider, LaunchParameters, RoleImages, RoleKind,
    SERVER_WEB_SOCKET_PORT,
};
use crate::model::{Server, TaskRole};

const ENI_ATTACHMENT: &str = "ElasticNetworkInterface";
const DETAIL_ENI_ID: &str = "networkInterfaceId";
const DETAIL_PRIVATE_IP: &str = "privateIPv4Address";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcsContainer {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcsAttachment {
    pub kind: String,
    pub details: BTreeMap<String, String>,
}

/// A running task as described by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcsTask {
    pub task_arn: Option<String>,
    pub containers: Vec<EcsContainer>,
    /// Environment overrides the task was launched with.
    pub environment: BTreeMap<String, String>,
    pub attachments: Vec<EcsAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsNetworkInterface {
    pub id: String,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsSecurityGroup {
    pub id: String,
    pub name: String,
    pub vpc_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsSubnet {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsRunTaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub container_name: String,
    pub security_group_id: String,
    pub subnet_id: String,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsTaskFailure {
    pub arn: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcsRunTaskResponse {
    pub tasks: Vec<EcsTask>,
    pub failures: Vec<EcsTaskFailure>,
}

/// The service calls the adapter needs.
#[async_trait]
pub trait EcsApi: Send + Sync {
    /// Lists and describes every running task of the cluster.
    async fn describe_running_tasks(&self, cluster: &str) -> Result<Vec<EcsTask>, HostingError>;

    async fn describe_network_interfaces(
        &self,
        ids: &[String],
    ) -> Result<Vec<EcsNetworkInterface>, HostingError>;

    async fn describe_security_groups(
        &self,
        name: &str,
    ) -> Result<Vec<EcsSecurityGroup>, HostingError>;

    async fn describe_subnets(
        &self,
        vpc_id: &str,
        availability_zone: &str,
    ) -> Result<Vec<EcsSubnet>, HostingError>;

    async fn run_task(&self, request: EcsRunTaskRequest)
        -> Result<EcsRunTaskResponse, HostingError>;

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> Result<(), HostingError>;
}

#[derive(Debug, Clone)]
pub struct EcsConfig {
    pub cluster: String,
    pub availability_zone: String,
    pub security_group_name: String,
    /// Task definition (and container name) of server tasks.
    pub server_image: String,
}

pub struct EcsHosting<A> {
    api: A,
    config: EcsConfig,
    images: RoleImages,
}

impl<A: EcsApi> EcsHosting<A> {
    pub fn new(api: A, config: EcsConfig, images: RoleImages) -> Self {
        Self {
            api,
            config,
            images,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn eni_id(task: &EcsTask) -> Option<&str> {
        task.attachments
            .iter()
            .filter(|a| a.kind == ENI_ATTACHMENT)
            .find_map(|a| a.details.get(DETAIL_ENI_ID).map(String::as_str))
    }

    fn private_ip(task: &EcsTask) -> Result<Option<IpAddr>, HostingError> {
        let value = task
            .attachments
            .iter()
            .filter(|a| a.kind == ENI_ATTACHMENT)
            .find_map(|a| a.details.get(DETAIL_PRIVATE_IP).map(String::as_str));
        parse_ip(value)
    }

    fn role_of(&self, task: &EcsTask) -> Option<RoleKind> {
        task.containers
            .iter()
            .find_map(|c| self.images.classify(&c.image).or_else(|| self.images.classify(&c.name)))
    }

    async fn security_group(&self) -> Result<EcsSecurityGroup, HostingError> {
        let mut groups = self
            .api
            .describe_security_groups(&self.config.security_group_name)
            .await?;
        groups.retain(|g| g.name == self.config.security_group_name);
        match groups.len() {
            1 => Ok(groups.remove(0)),
            n => Err(HostingError::LaunchFailed(format!(
                "expected one security group named '{}', found {n}",
                self.config.security_group_name
            ))),
        }
    }

    async fn subnet(&self, vpc_id: &str) -> Result<EcsSubnet, HostingError> {
        let mut subnets = self
            .api
            .describe_subnets(vpc_id, &self.config.availability_zone)
            .await?;
        match subnets.len() {
            1 => Ok(subnets.remove(0)),
            n => Err(HostingError::LaunchFailed(format!(
                "expected one subnet in {} of {vpc_id}, found {n}",
                self.config.availability_zone
            ))),
        }
    }
}

#[async_trait]
impl<A: EcsApi> HostingProvider for EcsHosting<A> {
    fn name(&self) -> &'static str {
        "ecs"
    }

    #[instrument(skip(self), fields(cluster = %self.config.cluster))]
    async fn poll(&self) -> Result<Vec<HostedTask>, HostingError> {
        let described = self.api.describe_running_tasks(&self.config.cluster).await?;

        let mut pending = Vec::new();
        for task in described {
            let Some(kind) = self.role_of(&task) else {
                continue;
            };
            let Some(arn) = task.task_arn.clone() else {
                warn!("Skipping described task without an ARN");
                continue;
            };
            pending.push((arn, kind, task));
        }

        let eni_ids: Vec<String> = pending
            .iter()
            .filter_map(|(_, _, task)| Self::eni_id(task).map(str::to_string))
            .collect();
        let public_ips: HashMap<String, Option<String>> = if eni_ids.is_empty() {
            HashMap::new()
        } else {
            self.api
                .describe_network_interfaces(&eni_ids)
                .await?
                .into_iter()
                .map(|eni| (eni.id, eni.public_ip))
                .collect()
        };

        let mut tasks = Vec::with_capacity(pending.len());
        for (identifier, kind, task) in pending {
            let private_ip = Self::private_ip(&task)?;
            let public_ip = match Self::eni_id(&task).and_then(|id| public_ips.get(id)) {
                Some(ip) => parse_ip(ip.as_deref())?,
                None => None,
            };
            let role = match kind {
                RoleKind::Manager => TaskRole::Manager,
                RoleKind::Kiosk => TaskRole::Kiosk,
                RoleKind::Server => {
                    let Some(raw) = task.environment.get(LaunchParameters::SERVER_ID) else {
                        debug!(task_arn = %identifier, "Server task without SERVER_ID override");
                        continue;
                    };
                    let server_id = raw.parse::<ServerId>().map_err(|e| {
                        HostingError::MalformedResponse(format!("task {identifier} SERVER_ID: {e}"))
                    })?;
                    TaskRole::Server {
                        server_id,
                        public_web_socket_port: Some(SERVER_WEB_SOCKET_PORT),
                    }
                }
            };
            tasks.push(HostedTask {
                identifier,
                role,
                private_ip,
                public_ip,
            });
        }

        debug!(count = tasks.len(), "Polled ECS tasks");
        Ok(tasks)
    }

    #[instrument(skip(self, server, params), fields(server_id = %server.id))]
    async fn start_server_task(
        &self,
        server: &Server,
        params: &LaunchParameters,
    ) -> Result<HostedTask, HostingError> {
        let group = self.security_group().await?;
        let subnet = self.subnet(&group.vpc_id).await?;

        let request = EcsRunTaskRequest {
            cluster: self.config.cluster.clone(),
            task_definition: self.config.server_image.clone(),
            container_name: self.config.server_image.clone(),
            security_group_id: group.id,
            subnet_id: subnet.id,
            environment: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let response = self.api.run_task(request).await?;

        if !response.failures.is_empty() {
            let reasons = response
                .failures
                .iter()
                .map(|f| f.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HostingError::LaunchFailed(reasons));
        }

        let arn = response
            .tasks
            .into_iter()
            .next()
            .and_then(|t| t.task_arn)
            .ok_or_else(|| HostingError::MalformedResponse("run task returned no task ARN".into()))?;

        info!(task_arn = %arn, "Started ECS server task");

        Ok(HostedTask {
            identifier: arn,
            role: TaskRole::Server {
                server_id: server.id,
                public_web_socket_port: Some(SERVER_WEB_SOCKET_PORT),
            },
            private_ip: None,
            public_ip: None,
        })
    }

    async fn stop_server_task(&self, identifier: &str) -> Result<(), HostingError> {
        self.api.stop_task(&self.config.cluster, identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerSettings;
    use crate::model::ServerState;
    use areaplane_id::{RegionId, Version};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockApi {
        tasks: Vec<EcsTask>,
        interfaces: Vec<EcsNetworkInterface>,
        groups: Vec<EcsSecurityGroup>,
        subnets: Vec<EcsSubnet>,
        run_response: EcsRunTaskResponse,
        eni_calls: Mutex<Vec<Vec<String>>>,
        run_requests: Mutex<Vec<EcsRunTaskRequest>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EcsApi for MockApi {
        async fn describe_running_tasks(&self, _: &str) -> Result<Vec<EcsTask>, HostingError> {
            Ok(self.tasks.clone())
        }

        async fn describe_network_interfaces(
            &self,
            ids: &[String],
        ) -> Result<Vec<EcsNetworkInterface>, HostingError> {
            self.eni_calls.lock().unwrap().push(ids.to_vec());
            Ok(self.interfaces.clone())
        }

        async fn describe_security_groups(
            &self,
            _: &str,
        ) -> Result<Vec<EcsSecurityGroup>, HostingError> {
            Ok(self.groups.clone())
        }

        async fn describe_subnets(&self, _: &str, _: &str) -> Result<Vec<EcsSubnet>, HostingError> {
            Ok(self.subnets.clone())
        }

        async fn run_task(
            &self,
            request: EcsRunTaskRequest,
        ) -> Result<EcsRunTaskResponse, HostingError> {
            self.run_requests.lock().unwrap().push(request);
            Ok(self.run_response.clone())
        }

        async fn stop_task(&self, _: &str, task_arn: &str) -> Result<(), HostingError> {
            self.stopped.lock().unwrap().push(task_arn.to_string());
            Ok(())
        }
    }

    fn config() -> EcsConfig {
        EcsConfig {
            cluster: "adhoc".to_string(),
            availability_zone: "us-east-1a".to_string(),
            security_group_name: "adhoc_server".to_string(),
            server_image: "adhoc_server".to_string(),
        }
    }

    fn described(arn: &str, image: &str, eni: &str, private_ip: &str, env: &[(&str, &str)]) -> EcsTask {
        EcsTask {
            task_arn: Some(arn.to_string()),
            containers: vec![EcsContainer {
                name: image.to_string(),
                image: format!("{image}:latest"),
            }],
            environment: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            attachments: vec![EcsAttachment {
                kind: ENI_ATTACHMENT.to_string(),
                details: BTreeMap::from([
                    (DETAIL_ENI_ID.to_string(), eni.to_string()),
                    (DETAIL_PRIVATE_IP.to_string(), private_ip.to_string()),
                ]),
            }],
        }
    }

    fn hosting(api: MockApi) -> EcsHosting<MockApi> {
        EcsHosting::new(api, config(), RoleImages::from_settings(&ManagerSettings::default()))
    }

    fn server() -> Server {
        Server {
            id: ServerId::new(5),
            version: Version::INITIAL,
            state: ServerState::new(RegionId::new(1), "Region0001"),
        }
    }

    #[tokio::test]
    async fn test_poll_resolves_public_ips_in_one_call() {
        let api = MockApi {
            tasks: vec![
                described("arn:server", "adhoc_server", "eni-1", "10.0.0.5", &[("SERVER_ID", "5")]),
                described("arn:kiosk", "adhoc_kiosk", "eni-2", "10.0.0.6", &[]),
            ],
            interfaces: vec![
                EcsNetworkInterface {
                    id: "eni-1".to_string(),
                    public_ip: Some("54.1.2.3".to_string()),
                },
                EcsNetworkInterface {
                    id: "eni-2".to_string(),
                    public_ip: None,
                },
            ],
            ..Default::default()
        };
        let hosting = hosting(api);

        let tasks = hosting.poll().await.unwrap();

        assert_eq!(hosting.api().eni_calls.lock().unwrap().len(), 1);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].identifier, "arn:server");
        assert_eq!(tasks[0].role.server_id(), Some(ServerId::new(5)));
        assert_eq!(tasks[0].public_ip, Some("54.1.2.3".parse().unwrap()));
        assert_eq!(tasks[0].private_ip, Some("10.0.0.5".parse().unwrap()));
        assert_eq!(tasks[1].role, TaskRole::Kiosk);
        assert_eq!(tasks[1].public_ip, None);
    }

    #[tokio::test]
    async fn test_poll_without_tasks_skips_interface_lookup() {
        let hosting = hosting(MockApi::default());
        assert!(hosting.poll().await.unwrap().is_empty());
        assert!(hosting.api().eni_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_uses_single_group_and_subnet() {
        let api = MockApi {
            groups: vec![EcsSecurityGroup {
                id: "sg-1".to_string(),
                name: "adhoc_server".to_string(),
                vpc_id: "vpc-1".to_string(),
            }],
            subnets: vec![EcsSubnet {
                id: "subnet-1".to_string(),
            }],
            run_response: EcsRunTaskResponse {
                tasks: vec![EcsTask {
                    task_arn: Some("arn:new".to_string()),
                    ..Default::default()
                }],
                failures: vec![],
            },
            ..Default::default()
        };
        let hosting = hosting(api);
        let server = server();
        let params = LaunchParameters::for_server(&server, &ManagerSettings::default());

        let task = hosting.start_server_task(&server, &params).await.unwrap();

        assert_eq!(task.identifier, "arn:new");
        let requests = hosting.api().run_requests.lock().unwrap();
        assert_eq!(requests[0].security_group_id, "sg-1");
        assert_eq!(requests[0].subnet_id, "subnet-1");
        assert_eq!(requests[0].environment.get("SERVER_ID").map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn test_start_requires_exactly_one_subnet() {
        let api = MockApi {
            groups: vec![EcsSecurityGroup {
                id: "sg-1".to_string(),
                name: "adhoc_server".to_string(),
                vpc_id: "vpc-1".to_string(),
            }],
            subnets: vec![
                EcsSubnet { id: "a".to_string() },
                EcsSubnet { id: "b".to_string() },
            ],
            ..Default::default()
        };
        let hosting = hosting(api);
        let server = server();
        let params = LaunchParameters::for_server(&server, &ManagerSettings::default());

        let result = hosting.start_server_task(&server, &params).await;

        assert!(matches!(result, Err(HostingError::LaunchFailed(_))));
        assert!(hosting.api().run_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_reports_failures() {
        let api = MockApi {
            groups: vec![EcsSecurityGroup {
                id: "sg-1".to_string(),
                name: "adhoc_server".to_string(),
                vpc_id: "vpc-1".to_string(),
            }],
            subnets: vec![EcsSubnet { id: "a".to_string() }],
            run_response: EcsRunTaskResponse {
                tasks: vec![],
                failures: vec![EcsTaskFailure {
                    arn: None,
                    reason: "RESOURCE:MEMORY".to_string(),
                }],
            },
            ..Default::default()
        };
        let hosting = hosting(api);
        let server = server();
        let params = LaunchParameters::for_server(&server, &ManagerSettings::default());

        match hosting.start_server_task(&server, &params).await {
            Err(HostingError::LaunchFailed(reason)) => assert!(reason.contains("MEMORY")),
            other => panic!("expected launch failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_delegates_to_api() {
        let hosting = hosting(MockApi::default());
        hosting.stop_server_task("arn:old").await.unwrap();
        assert_eq!(*hosting.api().stopped.lock().unwrap(), vec!["arn:old".to_string()]);
    }
}
