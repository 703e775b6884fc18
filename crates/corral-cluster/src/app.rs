//! Application descriptor and service interface.
//!
//! Apps live outside this system; the orchestrator consumes them
//! through [`AppService`], which also holds the cluster-wide app lock
//! used to serialize mutating operations across orchestrators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use corral_state::Container;

/// HTTP healthcheck declared by an app's image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    pub path: String,
    /// Expected status code; 0 means any 2xx.
    #[serde(default)]
    pub status: u16,
    /// Expected response-body substring, if any.
    #[serde(default)]
    pub match_body: String,
}

/// Snapshot of the app attributes the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub platform: String,
    pub pool: String,
    /// Memory plan in bytes; 0 means unlimited.
    #[serde(default)]
    pub plan_memory: u64,
    #[serde(default)]
    pub deploys: u64,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckSpec>,
    /// Commands the image asks to run inside every unit after it
    /// starts (the `restart:after` hook list).
    #[serde(default)]
    pub restart_after_hooks: Vec<String>,
}

/// Gateway to the application service owning app records, unit
/// bindings, and the cluster-wide app lock.
#[async_trait]
pub trait AppService: Send + Sync {
    async fn app(&self, name: &str) -> anyhow::Result<App>;

    /// Bind a container as a unit to the app's services.
    async fn bind_unit(&self, app: &App, container: &Container) -> anyhow::Result<()>;

    async fn unbind_unit(&self, app: &App, container: &Container) -> anyhow::Result<()>;

    /// Try to take the cluster-wide lock. Returns false when another
    /// holder owns it; callers fail fast rather than wait.
    async fn acquire_lock(&self, app_name: &str, owner: &str, reason: &str)
        -> anyhow::Result<bool>;

    async fn release_lock(&self, app_name: &str) -> anyhow::Result<()>;
}
