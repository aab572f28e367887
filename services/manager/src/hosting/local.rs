//! Local hosting: server processes run by hand on this machine.
//!
//! Starting a server task only records that the server is expected to be
//! running locally; polling reports one task per recorded server on
//! 127.0.0.1.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use areaplane_id::ServerId;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{HostedTask, HostingError, HostingProvider, LaunchParameters, SERVER_WEB_SOCKET_PORT};
use crate::model::{Server, TaskRole};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Default)]
struct LocalState {
    servers: BTreeSet<ServerId>,
    #[cfg(test)]
    faults: Faults,
}

/// Call log and injected failures for unit tests.
#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    start_calls: usize,
    stop_calls: Vec<String>,
    fail_starts: bool,
    fail_stops: bool,
}

#[derive(Debug, Default)]
pub struct LocalHosting {
    infrastructure: bool,
    state: Mutex<LocalState>,
}

impl LocalHosting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also report a manager and a kiosk task on 127.0.0.1.
    pub fn with_infrastructure_tasks(mut self) -> Self {
        self.infrastructure = true;
        self
    }

    /// Makes every start request fail until reset.
    #[cfg(test)]
    pub(crate) async fn set_fail_starts(&self, fail: bool) {
        self.state.lock().await.faults.fail_starts = fail;
    }

    /// Makes every stop request fail until reset.
    #[cfg(test)]
    pub(crate) async fn set_fail_stops(&self, fail: bool) {
        self.state.lock().await.faults.fail_stops = fail;
    }

    #[cfg(test)]
    pub(crate) async fn start_calls(&self) -> usize {
        self.state.lock().await.faults.start_calls
    }

    #[cfg(test)]
    pub(crate) async fn stop_calls(&self) -> Vec<String> {
        self.state.lock().await.faults.stop_calls.clone()
    }

    pub async fn running_servers(&self) -> BTreeSet<ServerId> {
        self.state.lock().await.servers.clone()
    }

    fn identifier(server_id: ServerId) -> String {
        format!("local-task-{server_id}")
    }

    fn server_task(server_id: ServerId) -> HostedTask {
        HostedTask {
            identifier: Self::identifier(server_id),
            role: TaskRole::Server {
                server_id,
                public_web_socket_port: Some(SERVER_WEB_SOCKET_PORT),
            },
            private_ip: Some(LOCALHOST),
            public_ip: Some(LOCALHOST),
        }
    }
}

#[async_trait]
impl HostingProvider for LocalHosting {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn poll(&self) -> Result<Vec<HostedTask>, HostingError> {
        let state = self.state.lock().await;
        let mut tasks = Vec::with_capacity(state.servers.len() + 2);

        if self.infrastructure {
            for (identifier, role) in [
                ("local-manager", TaskRole::Manager),
                ("local-kiosk", TaskRole::Kiosk),
            ] {
                tasks.push(HostedTask {
                    identifier: identifier.to_string(),
                    role,
                    private_ip: Some(LOCALHOST),
                    public_ip: Some(LOCALHOST),
                });
            }
        }

        tasks.extend(state.servers.iter().copied().map(Self::server_task));
        Ok(tasks)
    }

    async fn start_server_task(
        &self,
        server: &Server,
        _params: &LaunchParameters,
    ) -> Result<HostedTask, HostingError> {
        let mut state = self.state.lock().await;
        #[cfg(test)]
        {
            state.faults.start_calls += 1;
            if state.faults.fail_starts {
                return Err(HostingError::LaunchFailed(format!(
                    "local start disabled for server {}",
                    server.id
                )));
            }
        }

        info!(server_id = %server.id, "Assuming locally running server process");
        state.servers.insert(server.id);

        let mut task = Self::server_task(server.id);
        task.private_ip = None;
        task.public_ip = None;
        Ok(task)
    }

    async fn stop_server_task(&self, identifier: &str) -> Result<(), HostingError> {
        let mut state = self.state.lock().await;
        #[cfg(test)]
        {
            state.faults.stop_calls.push(identifier.to_string());
            if state.faults.fail_stops {
                return Err(HostingError::Provider(format!("local stop disabled for {identifier}")));
            }
        }
        state
            .servers
            .retain(|id| Self::identifier(*id) != identifier);
        Ok(())
    }
}
