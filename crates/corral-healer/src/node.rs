//! Node healing: replace a repeatedly-failing host with a fresh
//! IaaS machine and drain its containers onto the rest of the pool.

use std::sync::Arc;
use std::time::Duration;

use corral_cluster::{
    Iaas, Machine, Node, NodeCreationStatus, ProgressLog, WorkQueue, IAAS_ID_METADATA,
};
use corral_provision::mover::move_containers;
use corral_provision::{AppLocker, Provisioner};
use corral_state::{epoch_secs, EntitySnapshot, HealingEvent, HealingKind};
use tracing::{debug, error, info, warn};

use crate::error::{HealerError, HealerResult};
use crate::{STORM_LIMIT, STORM_WINDOW_SECS};

#[derive(Debug, Clone)]
pub struct NodeHealerConfig {
    /// Consecutive failures a node must accumulate before healing.
    pub failures_before_healing: u32,
    /// How long a node stays out of rotation when healing is skipped
    /// or fails.
    pub disabled_time: Duration,
    /// How long to wait for a replacement machine to bootstrap.
    pub wait_time_new_machine: Duration,
}

impl Default for NodeHealerConfig {
    fn default() -> Self {
        Self {
            failures_before_healing: 5,
            disabled_time: Duration::from_secs(30),
            wait_time_new_machine: Duration::from_secs(5 * 60),
        }
    }
}

/// Reacts to the cluster's error hook. When a node has failed enough
/// and a replacement can be provisioned, swaps it for a new machine;
/// otherwise asks the cluster to disable it for a while.
pub struct NodeHealer {
    prov: Provisioner,
    iaas: Arc<dyn Iaas>,
    queue: Arc<dyn WorkQueue>,
    locker: Arc<AppLocker>,
    config: NodeHealerConfig,
}

impl NodeHealer {
    pub fn new(
        prov: Provisioner,
        iaas: Arc<dyn Iaas>,
        queue: Arc<dyn WorkQueue>,
        locker: Arc<AppLocker>,
        config: NodeHealerConfig,
    ) -> Self {
        Self {
            prov,
            iaas,
            queue,
            locker,
            config,
        }
    }

    /// Decide what to do about a failing node. Returns how long the
    /// cluster should keep it disabled; zero means the node was healed
    /// and the entry no longer matters.
    pub async fn handle_error(&self, node: &Node) -> Duration {
        if node.failure_count < self.config.failures_before_healing {
            debug!(
                address = %node.address,
                failures = node.failure_count,
                "node not healed, not enough failures"
            );
            return self.config.disabled_time;
        }
        if node.last_success.is_none() {
            debug!(
                address = %node.address,
                "node not healed, it never succeeded"
            );
            return self.config.disabled_time;
        }
        if node.iaas().is_none() {
            debug!(
                address = %node.address,
                "node not healed, no IaaS metadata to recreate it from"
            );
            return self.config.disabled_time;
        }
        let count = match self.prov.store().healing_count_for(
            HealingKind::NodeHealing,
            &node.address,
            STORM_WINDOW_SECS,
            epoch_secs(),
        ) {
            Ok(count) => count,
            Err(err) => {
                error!(address = %node.address, error = %err, "node healing count lookup failed");
                return self.config.disabled_time;
            }
        };
        if count > STORM_LIMIT {
            let err = HealerError::StormLimit {
                lineage: node.address.clone(),
                limit: STORM_LIMIT,
                count,
            };
            error!(address = %node.address, "node not healed: {err}");
            return self.config.disabled_time;
        }
        match self.heal(node).await {
            Ok(created) => {
                info!(
                    from = %node.address,
                    to = %created.address,
                    "node healed"
                );
                Duration::ZERO
            }
            Err(err) => {
                error!(address = %node.address, error = %err, "node healing failed");
                self.config.disabled_time
            }
        }
    }

    /// Replace the node with a fresh machine, recording the attempt in
    /// the healing-event log.
    pub async fn heal(&self, node: &Node) -> HealerResult<Node> {
        let mut event = HealingEvent::open(HealingKind::NodeHealing, node_snapshot(node));
        self.prov.store().put_healing_event(&event)?;
        let result = self.replace_node(node).await;
        event.finished_at = Some(epoch_secs());
        match &result {
            Ok(created) => {
                event.created = Some(node_snapshot(created));
                event.successful = true;
            }
            Err(err) => event.error = err.to_string(),
        }
        self.prov.store().put_healing_event(&event)?;
        result
    }

    async fn replace_node(&self, node: &Node) -> HealerResult<Node> {
        info!(address = %node.address, "healing node, creating replacement machine");
        let machine =
            self.iaas
                .create_machine(&node.metadata)
                .await
                .map_err(|source| HealerError::MachineCreation {
                    address: node.address.clone(),
                    source,
                })?;

        let mut created = node.clone();
        created.address = machine.address.clone();
        created
            .metadata
            .insert(IAAS_ID_METADATA.to_string(), machine.id.clone());
        created.status = NodeCreationStatus::Pending;
        created.failure_count = 0;
        created.last_success = None;

        let registry = self.prov.registry();
        if let Err(err) = registry.unregister(&node.address).await {
            self.destroy_machine(&machine).await;
            return Err(err.into());
        }
        if let Err(err) = registry.register(created.clone()).await {
            self.restore_node(node).await;
            self.destroy_machine(&machine).await;
            return Err(err.into());
        }
        if let Err(err) = self
            .queue
            .bootstrap_node(&created.address, self.config.wait_time_new_machine)
            .await
        {
            if let Err(err) = registry.unregister(&created.address).await {
                error!(address = %created.address, error = %err, "failed to drop half-healed node");
            }
            self.restore_node(node).await;
            self.destroy_machine(&machine).await;
            return Err(err.into());
        }
        created.status = NodeCreationStatus::Created;
        registry.update(created.clone()).await?;

        // The old host is likely dead, but its containers' records still
        // point at it; moving them re-creates the units elsewhere.
        let log = ProgressLog::discard();
        if let Err(err) = move_containers(&self.prov, &self.locker, node.host(), None, &log).await {
            warn!(
                host = node.host(),
                error = %err,
                "not all units were moved off the healed node"
            );
        }
        match self.iaas.find_machine_by_address(&node.address).await {
            Ok(Some(old)) => {
                if let Err(err) = self.iaas.delete_machine(&old.id).await {
                    warn!(machine = %old.id, error = %err, "failed to destroy old machine");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(address = %node.address, error = %err, "old machine lookup failed");
            }
        }
        Ok(created)
    }

    async fn restore_node(&self, node: &Node) {
        if let Err(err) = self.prov.registry().register(node.clone()).await {
            error!(
                address = %node.address,
                error = %err,
                "failed to restore node after aborted healing"
            );
        }
    }

    async fn destroy_machine(&self, machine: &Machine) {
        if let Err(err) = self.iaas.delete_machine(&machine.id).await {
            error!(
                machine = %machine.id,
                error = %err,
                "failed to destroy machine after aborted healing"
            );
        }
    }
}

fn node_snapshot(node: &Node) -> EntitySnapshot {
    EntitySnapshot::Node {
        address: node.address.clone(),
        metadata: node.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use corral_cluster::testing::{FakeApps, FakeIaas, FakeQueue, FakeRouter, FakeRuntime, InMemoryRegistry};
    use corral_cluster::{App, LocalLimiter, NodeRegistry, IAAS_METADATA};
    use corral_scheduler::{Scheduler, SchedulerOpts};
    use corral_state::StateStore;

    struct Fixture {
        healer: NodeHealer,
        store: StateStore,
        registry: Arc<InMemoryRegistry>,
        iaas: Arc<FakeIaas>,
        queue: Arc<FakeQueue>,
    }

    fn failing_node() -> Node {
        let mut node = Node::new("http://127.0.0.1:2375", "pool1");
        node.metadata
            .insert(IAAS_METADATA.to_string(), "fake".to_string());
        node.failure_count = 5;
        node.last_success = Some(epoch_secs());
        node
    }

    fn fixture(node: Node, iaas: FakeIaas) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(InMemoryRegistry::with_nodes([node]));
        let runtime = Arc::new(FakeRuntime::default());
        let router = Arc::new(FakeRouter::default());
        let apps = Arc::new(FakeApps::with_apps([App {
            name: "myapp".to_string(),
            platform: "python".to_string(),
            pool: "pool1".to_string(),
            plan_memory: 0,
            deploys: 1,
            healthcheck: None,
            restart_after_hooks: Vec::new(),
        }]));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            apps.clone(),
            SchedulerOpts::default(),
        ));
        let prov = Provisioner::new(
            store.clone(),
            registry.clone(),
            runtime,
            router.clone(),
            apps.clone(),
            scheduler,
            Arc::new(LocalLimiter::new(0)),
            Default::default(),
        );
        let iaas = Arc::new(iaas);
        let queue = Arc::new(FakeQueue::default());
        let locker = Arc::new(AppLocker::new(apps, router));
        let healer = NodeHealer::new(
            prov,
            iaas.clone(),
            queue.clone(),
            locker,
            NodeHealerConfig::default(),
        );
        Fixture {
            healer,
            store,
            registry,
            iaas,
            queue,
        }
    }

    #[tokio::test]
    async fn handle_error_replaces_failing_node() {
        let node = failing_node();
        let fx = fixture(node.clone(), FakeIaas::with_fixed_address("http://localhost:2375"));

        let disabled = fx.healer.handle_error(&node).await;
        assert_eq!(disabled, Duration::ZERO);

        let addresses = fx.registry.addresses();
        assert_eq!(addresses, vec!["http://localhost:2375".to_string()]);
        let created = fx
            .registry
            .node("http://localhost:2375")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.status, NodeCreationStatus::Created);
        assert_eq!(created.pool(), Some("pool1"));
        assert_eq!(created.iaas_id(), Some("machine-1"));
        assert_eq!(
            fx.queue.bootstrapped.lock().unwrap().as_slice(),
            ["http://localhost:2375".to_string()]
        );

        let events = fx
            .store
            .list_healing_events(Some(HealingKind::NodeHealing))
            .unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.successful);
        assert!(event.finished_at.is_some());
        assert_eq!(event.failing.lineage_id(), "http://127.0.0.1:2375");
        assert_eq!(
            event.created.as_ref().unwrap().lineage_id(),
            "http://localhost:2375"
        );
    }

    #[tokio::test]
    async fn handle_error_skips_nodes_below_failure_threshold() {
        let mut node = failing_node();
        node.failure_count = 2;
        let fx = fixture(node.clone(), FakeIaas::default());

        let disabled = fx.healer.handle_error(&node).await;
        assert_eq!(disabled, Duration::from_secs(30));
        assert!(fx.iaas.machines.lock().unwrap().is_empty());
        assert!(fx
            .store
            .list_healing_events(Some(HealingKind::NodeHealing))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn handle_error_skips_nodes_without_iaas_metadata() {
        let mut node = failing_node();
        node.metadata.remove(IAAS_METADATA);
        let fx = fixture(node.clone(), FakeIaas::default());

        let disabled = fx.healer.handle_error(&node).await;
        assert_eq!(disabled, Duration::from_secs(30));
        assert!(fx.iaas.machines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_bootstrap_restores_the_old_node() {
        let node = failing_node();
        let fx = fixture(node.clone(), FakeIaas::with_fixed_address("http://localhost:2375"));
        fx.queue.fail_bootstraps();

        let err = fx.healer.heal(&node).await.unwrap_err();
        assert!(err.to_string().contains("bootstrap"));

        // Old node back in place, replacement machine destroyed.
        assert_eq!(fx.registry.addresses(), vec![node.address.clone()]);
        assert!(fx.iaas.machines.lock().unwrap().is_empty());
        assert_eq!(
            fx.iaas.deleted.lock().unwrap().as_slice(),
            ["machine-1".to_string()]
        );

        let events = fx
            .store
            .list_healing_events(Some(HealingKind::NodeHealing))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].successful);
        assert!(events[0].error.contains("bootstrap"));
        assert!(events[0].created.is_none());
    }

    #[tokio::test]
    async fn machine_creation_failure_leaves_node_untouched() {
        let node = failing_node();
        let iaas = FakeIaas::default();
        iaas.fail_creations();
        let fx = fixture(node.clone(), iaas);

        let err = fx.healer.heal(&node).await.unwrap_err();
        assert!(matches!(err, HealerError::MachineCreation { .. }));
        assert_eq!(fx.registry.addresses(), vec![node.address.clone()]);
    }

    #[tokio::test]
    async fn storm_of_healings_disables_instead() {
        let node = failing_node();
        let fx = fixture(node.clone(), FakeIaas::with_fixed_address("http://localhost:2375"));

        // Chain of prior healings ending at this node's address.
        let mut previous = "http://10.0.0.9:2375".to_string();
        for i in 0..4 {
            let current = if i == 3 {
                node.address.clone()
            } else {
                format!("http://10.0.0.{i}:2375")
            };
            let mut event = HealingEvent::open(
                HealingKind::NodeHealing,
                EntitySnapshot::Node {
                    address: previous.clone(),
                    metadata: BTreeMap::new(),
                },
            );
            event.created = Some(EntitySnapshot::Node {
                address: current.clone(),
                metadata: BTreeMap::new(),
            });
            event.successful = true;
            event.finished_at = Some(epoch_secs());
            fx.store.put_healing_event(&event).unwrap();
            previous = current;
        }

        let disabled = fx.healer.handle_error(&node).await;
        assert_eq!(disabled, Duration::from_secs(30));
        assert!(fx.iaas.machines.lock().unwrap().is_empty());
        assert_eq!(
            fx.store
                .list_healing_events(Some(HealingKind::NodeHealing))
                .unwrap()
                .len(),
            4
        );
    }
}
