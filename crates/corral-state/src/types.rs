//! Domain types persisted by the corral state store.
//!
//! These are the durable shapes of the fleet: containers, per-app image
//! history, healing events, and autoscale rules/events. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Container ──────────────────────────────────────────────────────

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Building,
    Starting,
    Started,
    Stopped,
    Error,
    Asleep,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Building => "building",
            ContainerStatus::Starting => "starting",
            ContainerStatus::Started => "started",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
            ContainerStatus::Asleep => "asleep",
        }
    }
}

/// A deployed unit. The name is unique fleet-wide; the id is assigned by
/// the container runtime once the container exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Runtime-assigned identifier. Empty until `create` succeeds.
    pub id: String,
    /// Human name: `{app}-{random suffix}`.
    pub name: String,
    pub app_name: String,
    /// Role within the app ("web", "worker", ...). May be empty for
    /// containers predating process declarations.
    #[serde(default)]
    pub process_name: String,
    /// Platform tag of the owning app.
    #[serde(default)]
    pub platform: String,
    /// Image the container runs.
    pub image: String,
    /// Image being produced by an in-flight deploy, if any.
    #[serde(default)]
    pub building_image: String,
    /// Host the container is placed on.
    #[serde(default)]
    pub host_addr: String,
    /// Host-facing port, as reported by the runtime.
    #[serde(default)]
    pub host_port: String,
    /// Port the image exposes inside the container.
    #[serde(default)]
    pub exposed_port: String,
    /// Internal IP.
    #[serde(default)]
    pub ip: String,
    pub status: ContainerStatus,
    /// Last status transition, Unix seconds.
    pub status_updated_at: u64,
    /// Last *successful* status report, Unix seconds. `None` until the
    /// container first reports in.
    #[serde(default)]
    pub last_success_status_update: Option<u64>,
    /// Transient per-operation flag: set while routes for this container
    /// are being manipulated in a pipeline.
    #[serde(default)]
    pub routable: bool,
}

impl Container {
    /// First 10 characters of the runtime id, for human-facing output.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(10);
        &self.id[..end]
    }

    /// Routable address (`http://host:port`), if the container has one.
    pub fn address(&self) -> Option<String> {
        if self.valid_addr() {
            Some(format!("http://{}:{}", self.host_addr, self.host_port))
        } else {
            None
        }
    }

    /// True when both host address and host port are populated.
    pub fn valid_addr(&self) -> bool {
        !self.host_addr.is_empty() && !self.host_port.is_empty() && self.host_port != "0"
    }

    /// The status this container should be in when healthy. A stopped
    /// container is expected to stay stopped.
    pub fn expected_status(&self) -> ContainerStatus {
        if self.status == ContainerStatus::Stopped {
            ContainerStatus::Stopped
        } else {
            ContainerStatus::Started
        }
    }

    /// Runnable means visible to placement scoring: past creation and not
    /// parked in building/stopped.
    pub fn is_runnable(&self) -> bool {
        !matches!(
            self.status,
            ContainerStatus::Created | ContainerStatus::Building | ContainerStatus::Stopped
        )
    }
}

// ── Image history ──────────────────────────────────────────────────

/// Per-app image record: a monotonically incremented version counter and
/// the ordered list of image names that have ever been current. The last
/// entry is the current image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub app_name: String,
    pub count: u64,
    pub images: Vec<String>,
}

// ── Healing events ─────────────────────────────────────────────────

/// What kind of entity a healing event replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealingKind {
    NodeHealing,
    ContainerHealing,
}

/// Snapshot of the failing or created entity of a healing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Node {
        address: String,
        metadata: BTreeMap<String, String>,
    },
    Container {
        id: String,
        name: String,
        app_name: String,
        process_name: String,
        host_addr: String,
    },
}

impl EntitySnapshot {
    /// The identifier used to link healing chains: node address or
    /// container id.
    pub fn lineage_id(&self) -> &str {
        match self {
            EntitySnapshot::Node { address, .. } => address,
            EntitySnapshot::Container { id, .. } => id,
        }
    }
}

/// Durable record of one healing attempt. The `created` entity of one
/// event is the `failing` entity of a potential successor, forming a
/// chain per lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingEvent {
    pub id: String,
    pub kind: HealingKind,
    pub started_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
    pub failing: EntitySnapshot,
    #[serde(default)]
    pub created: Option<EntitySnapshot>,
    #[serde(default)]
    pub successful: bool,
    #[serde(default)]
    pub error: String,
}

impl HealingEvent {
    pub fn open(kind: HealingKind, failing: EntitySnapshot) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            started_at: epoch_secs(),
            finished_at: None,
            failing,
            created: None,
            successful: false,
            error: String::new(),
        }
    }
}

// ── Autoscale ──────────────────────────────────────────────────────

/// Per-pool scaling configuration. The rule stored under the empty pool
/// name is the default for pools without a specific rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScaleRule {
    /// Pool this rule applies to; empty string is the default rule.
    pub pool: String,
    pub enabled: bool,
    /// When > 0 the pool scales by container count; otherwise by memory.
    pub max_container_count: u32,
    /// Memory admission ratio (0 disables the memory scaler).
    pub max_memory_ratio: f32,
    /// Headroom factor required before removing a node. Must be > 1.
    pub scale_down_ratio: f32,
    pub prevent_rebalance: bool,
}

impl Default for AutoScaleRule {
    fn default() -> Self {
        Self {
            pool: String::new(),
            enabled: false,
            max_container_count: 0,
            max_memory_ratio: 0.0,
            scale_down_ratio: 1.333,
            prevent_rebalance: false,
        }
    }
}

impl AutoScaleRule {
    /// Rules with a scale-down ratio at or below 1 would remove nodes the
    /// pool still needs.
    pub fn validate(&self) -> Result<(), String> {
        if self.scale_down_ratio <= 1.0 {
            return Err(format!(
                "invalid scale-down ratio {:.3}: must be greater than 1.0",
                self.scale_down_ratio
            ));
        }
        Ok(())
    }
}

/// What an autoscale run decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoScaleAction {
    Add,
    Remove,
    Rebalance,
    NoOp,
}

/// Summary of the latest autoscale run for a pool. While `running` is
/// true the record acts as an exclusive guard against concurrent runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScaleEvent {
    pub pool: String,
    pub running: bool,
    pub started_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
    #[serde(default = "default_noop")]
    pub action: AutoScaleAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub successful: bool,
    #[serde(default)]
    pub error: String,
    /// Addresses of nodes added or removed by the run.
    #[serde(default)]
    pub nodes: Vec<String>,
}

fn default_noop() -> AutoScaleAction {
    AutoScaleAction::NoOp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cont(status: ContainerStatus) -> Container {
        Container {
            id: "abcdef0123456789".to_string(),
            name: "myapp-x1".to_string(),
            app_name: "myapp".to_string(),
            process_name: "web".to_string(),
            platform: "python".to_string(),
            image: "reg/corral/app-myapp:v1".to_string(),
            building_image: String::new(),
            host_addr: "10.0.0.1".to_string(),
            host_port: "49153".to_string(),
            exposed_port: "8888/tcp".to_string(),
            ip: "172.17.0.2".to_string(),
            status,
            status_updated_at: 1000,
            last_success_status_update: Some(1000),
            routable: false,
        }
    }

    #[test]
    fn short_id_truncates() {
        let c = cont(ContainerStatus::Started);
        assert_eq!(c.short_id(), "abcdef0123");
        let mut small = c.clone();
        small.id = "ab".to_string();
        assert_eq!(small.short_id(), "ab");
    }

    #[test]
    fn address_requires_host_and_port() {
        let c = cont(ContainerStatus::Started);
        assert_eq!(c.address().as_deref(), Some("http://10.0.0.1:49153"));
        let mut no_port = c.clone();
        no_port.host_port = String::new();
        assert_eq!(no_port.address(), None);
        let mut zero_port = c;
        zero_port.host_port = "0".to_string();
        assert!(!zero_port.valid_addr());
    }

    #[test]
    fn expected_status_keeps_stopped_stopped() {
        assert_eq!(
            cont(ContainerStatus::Stopped).expected_status(),
            ContainerStatus::Stopped
        );
        assert_eq!(
            cont(ContainerStatus::Error).expected_status(),
            ContainerStatus::Started
        );
    }

    #[test]
    fn runnable_excludes_parked_statuses() {
        assert!(cont(ContainerStatus::Started).is_runnable());
        assert!(cont(ContainerStatus::Error).is_runnable());
        assert!(!cont(ContainerStatus::Created).is_runnable());
        assert!(!cont(ContainerStatus::Building).is_runnable());
        assert!(!cont(ContainerStatus::Stopped).is_runnable());
    }

    #[test]
    fn scale_down_ratio_validation() {
        let mut rule = AutoScaleRule::default();
        assert!(rule.validate().is_ok());
        rule.scale_down_ratio = 1.0;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn healing_event_roundtrip() {
        let evt = HealingEvent::open(
            HealingKind::ContainerHealing,
            EntitySnapshot::Container {
                id: "c1".to_string(),
                name: "myapp-x1".to_string(),
                app_name: "myapp".to_string(),
                process_name: "web".to_string(),
                host_addr: "10.0.0.1".to_string(),
            },
        );
        let raw = serde_json::to_vec(&evt).unwrap();
        let back: HealingEvent = serde_json::from_slice(&raw).unwrap();
        assert_eq!(evt, back);
        assert_eq!(back.failing.lineage_id(), "c1");
    }
}
