//! The autoscale loop: exclusive per-pool events, scaler dispatch,
//! parallel node add/remove, and the rebalance decision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use corral_cluster::{
    Iaas, Node, NodeCreationStatus, NodeRegistry, ProgressLog, WorkQueue, IAAS_ID_METADATA,
    IAAS_METADATA,
};
use corral_provision::mover::{host_gap, move_containers, rebalance};
use corral_provision::{AppLocker, Provisioner, RebalanceFilter};
use corral_state::{AutoScaleAction, AutoScaleEvent, AutoScaleRule, StateError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::metadata::choose_metadata_from_nodes;
use crate::scalers::{count_scale, memory_scale, ScalerResult};
use crate::REBALANCE_GAP_THRESHOLD;

#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    pub run_interval: Duration,
    /// How long to wait for a new machine to bootstrap.
    pub wait_time_new_machine: Duration,
    /// Node metadata key holding total memory in bytes; required by the
    /// memory scaler.
    pub total_memory_metadata: String,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            run_interval: Duration::from_secs(60 * 60),
            wait_time_new_machine: Duration::from_secs(5 * 60),
            total_memory_metadata: String::new(),
        }
    }
}

/// Periodic per-pool scaling driver.
pub struct Autoscaler {
    prov: Provisioner,
    iaas: Arc<dyn Iaas>,
    queue: Arc<dyn WorkQueue>,
    config: AutoscaleConfig,
}

impl Autoscaler {
    pub fn new(
        prov: Provisioner,
        iaas: Arc<dyn Iaas>,
        queue: Arc<dyn WorkQueue>,
        config: AutoscaleConfig,
    ) -> Self {
        Self {
            prov,
            iaas,
            queue,
            config,
        }
    }

    /// Scaling loop. Each pass runs in its own task so a panicking pool
    /// never kills the loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.run_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = self.clone();
                    let pass = tokio::spawn(async move { this.run_once().await });
                    match pass.await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(error = %err, "autoscale pass failed"),
                        Err(join_err) => {
                            error!(error = %join_err, "recovered panic in autoscale pass")
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One full pass over every pool. Per-pool outcomes land in that
    /// pool's autoscale event; only fleet-level failures surface here.
    pub async fn run_once(&self) -> AutoscaleResult<()> {
        let nodes = self.prov.registry().list().await?;
        let mut pools: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            match node.pool() {
                Some(pool) if !pool.is_empty() => {
                    pools.entry(pool.to_string()).or_default().push(node);
                }
                _ => debug!(address = %node.address, "skipped node, no pool value"),
            }
        }
        for (pool, nodes) in &pools {
            self.run_pool(pool, nodes).await;
        }
        Ok(())
    }

    async fn run_pool(&self, pool: &str, nodes: &[Node]) {
        let mut event = match self.prov.store().try_start_autoscale_event(pool) {
            Ok(event) => event,
            Err(StateError::EventLocked(_)) => {
                debug!(pool, "skipping, autoscale already running");
                return;
            }
            Err(err) => {
                error!(pool, error = %err, "failed to open autoscale event");
                return;
            }
        };
        match self.scale_pool(pool, nodes, &mut event).await {
            Ok(()) => event.successful = true,
            Err(err) => {
                event.error = err.to_string();
                error!(pool, error = %err, "autoscale run failed");
            }
        }
        if let Err(err) = self.prov.store().finish_autoscale_event(event) {
            error!(pool, error = %err, "failed to close autoscale event");
        }
    }

    async fn scale_pool(
        &self,
        pool: &str,
        nodes: &[Node],
        event: &mut AutoScaleEvent,
    ) -> AutoscaleResult<()> {
        let rule = match self.rule_for(pool)? {
            Some(rule) => rule,
            None => {
                event.reason = format!("no autoscale rule for {pool:?}");
                return Ok(());
            }
        };
        if !rule.enabled {
            event.reason = format!("autoscale rule disabled for {pool:?}");
            return Ok(());
        }

        let store = self.prov.store();
        let result = if rule.max_container_count > 0 {
            count_scale(store, &rule, nodes)?
        } else {
            memory_scale(
                store,
                self.prov.apps(),
                &rule,
                &self.config.total_memory_metadata,
                nodes,
            )
            .await?
        };
        event.reason = result.reason.clone();
        info!(pool, reason = %result.reason, to_add = result.to_add,
            to_remove = result.to_remove.len(), "scaler decision");

        let mut added = Vec::new();
        if result.to_add > 0 {
            event.action = AutoScaleAction::Add;
            added = self.add_nodes(nodes, result.to_add).await?;
            event.nodes = added.iter().map(|n| n.address.clone()).collect();
        } else if !result.to_remove.is_empty() {
            event.action = AutoScaleAction::Remove;
            event.nodes = result.to_remove.iter().map(|n| n.address.clone()).collect();
            self.remove_nodes(&result.to_remove).await?;
        }

        if !rule.prevent_rebalance {
            self.rebalance_if_needed(pool, &result, !added.is_empty(), event)
                .await?;
        }
        Ok(())
    }

    fn rule_for(&self, pool: &str) -> AutoscaleResult<Option<AutoScaleRule>> {
        let store = self.prov.store();
        match store.autoscale_rule(pool)? {
            Some(rule) => Ok(Some(rule)),
            None => Ok(store.autoscale_rule("")?),
        }
    }

    /// Create `count` machines in parallel, each cloned from the pool's
    /// least-represented metadata. Partial success is tolerated as long
    /// as at least one node came up.
    async fn add_nodes(&self, model_nodes: &[Node], count: usize) -> AutoscaleResult<Vec<Node>> {
        let metadata = choose_metadata_from_nodes(model_nodes)?;
        if !metadata.contains_key(IAAS_METADATA) {
            return Err(AutoscaleError::MissingIaas(metadata));
        }
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let iaas = self.iaas.clone();
            let queue = self.queue.clone();
            let registry = self.prov.registry().clone();
            let metadata = metadata.clone();
            let wait = self.config.wait_time_new_machine;
            handles.push(tokio::spawn(async move {
                add_one_node(iaas, queue, registry, metadata, wait).await
            }));
        }
        let mut added = Vec::new();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(node)) => added.push(node),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err.to_string());
                }
                Err(join_err) => {
                    first_error.get_or_insert(join_err.to_string());
                }
            }
        }
        if let Some(err) = first_error {
            if added.is_empty() {
                return Err(AutoscaleError::PartialNodeAdd(err));
            }
            warn!(error = %err, "not all required nodes were created");
        }
        Ok(added)
    }

    /// Remove nodes: unregister, drain their containers onto the rest
    /// of the pool, then destroy the backing machines in parallel.
    async fn remove_nodes(&self, nodes: &[Node]) -> AutoscaleResult<()> {
        for node in nodes {
            if node.iaas().is_none() {
                return Err(AutoscaleError::MissingIaas(node.metadata.clone()));
            }
        }
        let registry = self.prov.registry();
        let mut errors = Vec::new();
        for node in nodes {
            if let Err(err) = registry.unregister(&node.address).await {
                errors.push(format!("unable to unregister node {}: {err}", node.address));
            }
        }

        let locker = Arc::new(AppLocker::new(
            self.prov.apps().clone(),
            self.prov.router().clone(),
        ));
        let log = ProgressLog::discard();
        for node in nodes {
            if let Err(err) = move_containers(&self.prov, &locker, node.host(), None, &log).await {
                warn!(
                    host = node.host(),
                    error = %err,
                    "not all containers were drained from removed node"
                );
            }
        }

        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let iaas = self.iaas.clone();
            let node = node.clone();
            handles.push(tokio::spawn(async move {
                let machine_id = match node.iaas_id() {
                    Some(id) => Some(id.to_string()),
                    None => iaas
                        .find_machine_by_address(&node.address)
                        .await
                        .ok()
                        .flatten()
                        .map(|m| m.id),
                };
                let Some(id) = machine_id else {
                    warn!(address = %node.address, "no machine found for removed node");
                    return;
                };
                if let Err(err) = iaas.delete_machine(&id).await {
                    warn!(machine = %id, error = %err, "failed to destroy machine");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if !errors.is_empty() {
            return Err(AutoscaleError::NodeRemoval { errors });
        }
        Ok(())
    }

    /// Decide whether the pool is worth rebalancing: skip after a
    /// removal (the drain spread things out), force after an add, and
    /// otherwise compare the live gap with a dry-run's.
    async fn rebalance_if_needed(
        &self,
        pool: &str,
        result: &ScalerResult,
        force: bool,
        event: &mut AutoScaleEvent,
    ) -> AutoscaleResult<()> {
        if !result.to_remove.is_empty() {
            return Ok(());
        }
        let filter = RebalanceFilter {
            pool: Some(pool.to_string()),
            apps: Vec::new(),
        };
        let log = ProgressLog::discard();
        if force {
            rebalance(&self.prov, &filter, false, &log).await?;
            return Ok(());
        }
        let hosts: Vec<String> = self
            .prov
            .registry()
            .list()
            .await?
            .into_iter()
            .filter(|n| n.pool() == Some(pool))
            .filter(|n| n.status == NodeCreationStatus::Created)
            .map(|n| n.host().to_string())
            .collect();
        let gap = host_gap(self.prov.store(), &hosts)?;
        let dry = rebalance(&self.prov, &filter, true, &log).await?;
        let gap_after = host_gap(dry.store(), &hosts)?;
        if (gap - gap_after).abs() > REBALANCE_GAP_THRESHOLD {
            info!(pool, gap, gap_after, "rebalancing");
            event.action = AutoScaleAction::Rebalance;
            event.reason = format!("gap is {gap}, after rebalance gap will be {gap_after}");
            rebalance(&self.prov, &filter, false, &log).await?;
        }
        Ok(())
    }
}

async fn add_one_node(
    iaas: Arc<dyn Iaas>,
    queue: Arc<dyn WorkQueue>,
    registry: Arc<dyn NodeRegistry>,
    metadata: BTreeMap<String, String>,
    wait: Duration,
) -> AutoscaleResult<Node> {
    let machine = iaas.create_machine(&metadata).await?;
    let mut node = Node {
        address: machine.address.clone(),
        metadata,
        status: NodeCreationStatus::Pending,
        failure_count: 0,
        last_success: None,
    };
    node.metadata
        .insert(IAAS_ID_METADATA.to_string(), machine.id.clone());
    info!(address = %node.address, "new machine created, waiting for bootstrap");

    if let Err(err) = registry.register(node.clone()).await {
        destroy_machine(&iaas, &machine.id).await;
        return Err(err.into());
    }
    if let Err(err) = queue.bootstrap_node(&node.address, wait).await {
        if let Err(err) = registry.unregister(&node.address).await {
            error!(address = %node.address, error = %err, "failed to drop unbootstrapped node");
        }
        destroy_machine(&iaas, &machine.id).await;
        return Err(err.into());
    }
    node.status = NodeCreationStatus::Created;
    registry.update(node.clone()).await?;
    info!(address = %node.address, "new machine started");
    Ok(node)
}

async fn destroy_machine(iaas: &Arc<dyn Iaas>, id: &str) {
    if let Err(err) = iaas.delete_machine(id).await {
        error!(machine = %id, error = %err, "failed to destroy machine after aborted node add");
    }
}
