//! Collaborator interfaces: registry, runtime, router, IaaS, queue.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::{App, HealthcheckSpec};
use crate::node::{Machine, Node};

/// What to run when creating a container on a host.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Human container name; doubles as the repository key.
    pub name: String,
    pub image: String,
    pub app_name: String,
    pub process_name: String,
    /// Memory limit in bytes; 0 means unlimited.
    pub memory: u64,
    /// Port the image exposes, e.g. `8888/tcp`.
    pub exposed_port: String,
}

/// Network facts learned by inspecting a runtime container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InspectedContainer {
    pub running: bool,
    pub restarting: bool,
    pub ip: String,
    pub host_port: String,
}

/// Node list with metadata and creation status.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn register(&self, node: Node) -> anyhow::Result<()>;

    async fn unregister(&self, address: &str) -> anyhow::Result<()>;

    /// Replace the stored record for `node.address`.
    async fn update(&self, node: Node) -> anyhow::Result<()>;

    async fn node(&self, address: &str) -> anyhow::Result<Option<Node>>;

    async fn list(&self) -> anyhow::Result<Vec<Node>>;
}

/// Per-node container runtime, addressed by the container's host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container; returns the runtime-assigned id.
    async fn create_container(&self, host: &str, spec: &ContainerSpec) -> anyhow::Result<String>;

    async fn start_container(&self, host: &str, id: &str) -> anyhow::Result<()>;

    /// SIGTERM, then a bounded wait for exit.
    async fn stop_container(&self, host: &str, id: &str) -> anyhow::Result<()>;

    async fn remove_container(&self, host: &str, id: &str) -> anyhow::Result<()>;

    async fn inspect_container(&self, host: &str, id: &str)
        -> anyhow::Result<InspectedContainer>;

    /// Block until the container exits; returns the exit code.
    async fn wait_container(&self, host: &str, id: &str) -> anyhow::Result<i64>;

    /// Full log stream for a finished or running container.
    async fn container_logs(&self, host: &str, id: &str) -> anyhow::Result<String>;

    /// Commit the container's filesystem as `image` and push it.
    async fn commit_container(&self, host: &str, id: &str, image: &str) -> anyhow::Result<()>;

    async fn remove_image(&self, image: &str) -> anyhow::Result<()>;

    /// Run a shell command inside a running container; fails on a
    /// non-zero exit.
    async fn exec_container(&self, host: &str, id: &str, cmd: &str) -> anyhow::Result<()>;

    /// Hit the app's HTTP healthcheck through the container's address.
    async fn run_healthcheck(
        &self,
        host: &str,
        port: &str,
        spec: &HealthcheckSpec,
    ) -> anyhow::Result<()>;
}

/// Per-app route table.
#[async_trait]
pub trait Router: Send + Sync {
    async fn add_routes(&self, app_name: &str, addresses: &[String]) -> anyhow::Result<()>;

    async fn remove_routes(&self, app_name: &str, addresses: &[String]) -> anyhow::Result<()>;

    fn supports_custom_healthcheck(&self) -> bool {
        false
    }

    async fn set_healthcheck(
        &self,
        _app_name: &str,
        _spec: Option<HealthcheckSpec>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Reconcile the app's full route table against its current units.
    async fn rebuild_routes(&self, app: &App) -> anyhow::Result<()>;
}

/// Infrastructure provider backing nodes with machines.
#[async_trait]
pub trait Iaas: Send + Sync {
    async fn create_machine(
        &self,
        metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<Machine>;

    async fn delete_machine(&self, id: &str) -> anyhow::Result<()>;

    async fn find_machine_by_address(&self, address: &str) -> anyhow::Result<Option<Machine>>;
}

/// Asynchronous node-bootstrap jobs with wait-for-result semantics.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a bootstrap job for the node and wait up to `timeout`
    /// for it to finish.
    async fn bootstrap_node(&self, address: &str, timeout: Duration) -> anyhow::Result<()>;
}
