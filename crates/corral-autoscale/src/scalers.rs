//! Per-pool scaling decisions.
//!
//! A scaler looks at a pool's nodes and containers and answers with
//! how many nodes to add, which nodes to remove, or neither. The
//! decision is advisory; the autoscaler owns execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use corral_cluster::{AppService, Node};
use corral_state::{AutoScaleRule, StateStore};
use tracing::debug;

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::metadata::choose_nodes_for_removal;

/// What a scaler decided for one pool.
#[derive(Debug, Default)]
pub struct ScalerResult {
    pub to_add: usize,
    pub to_remove: Vec<Node>,
    pub to_rebalance: bool,
    pub reason: String,
}

impl ScalerResult {
    pub fn is_rebalance_only(&self) -> bool {
        self.to_add == 0 && self.to_remove.is_empty() && self.to_rebalance
    }

    pub fn no_action(&self) -> bool {
        self.to_add == 0 && self.to_remove.is_empty() && !self.to_rebalance
    }
}

/// Count scaler: every node offers `max_container_count` slots. Add
/// nodes when the pool is over capacity; remove when the free slots
/// exceed a full node's worth scaled by the scale-down ratio.
pub fn count_scale(
    store: &StateStore,
    rule: &AutoScaleRule,
    nodes: &[Node],
) -> AutoscaleResult<ScalerResult> {
    let hosts: Vec<String> = nodes.iter().map(|n| n.host().to_string()).collect();
    let counts = store.count_containers_by_host(&hosts, &HashSet::new())?;
    let total: usize = counts.values().sum();
    let max_count = i64::from(rule.max_container_count);
    let free_slots = nodes.len() as i64 * max_count - total as i64;
    let reason = format!("number of free slots is {free_slots}");

    if free_slots < 0 {
        let to_add = ((-free_slots + max_count - 1) / max_count) as usize;
        return Ok(ScalerResult {
            to_add,
            reason,
            ..Default::default()
        });
    }
    let scaled_max = (max_count as f32 * rule.scale_down_ratio) as i64;
    if scaled_max > 0 && free_slots > scaled_max {
        let to_remove_count = (free_slots / scaled_max) as usize;
        let chosen = choose_nodes_for_removal(nodes, to_remove_count)?;
        if chosen.is_empty() {
            debug!(pool = %rule.pool, "would scale down but metadata diversity forbids it");
            return Ok(ScalerResult {
                reason,
                ..Default::default()
            });
        }
        return Ok(ScalerResult {
            to_remove: chosen,
            reason,
            ..Default::default()
        });
    }
    Ok(ScalerResult {
        reason,
        ..Default::default()
    })
}

struct NodeMemory {
    node: Node,
    max: i64,
    reserved: i64,
    available: i64,
}

/// Memory scaler: each node's capacity is its total-memory metadata
/// scaled by `max_memory_ratio`; usage is the sum of the plan memory of
/// its containers. The pool must keep room for the largest plan on at
/// least one node.
pub async fn memory_scale(
    store: &StateStore,
    apps: &Arc<dyn AppService>,
    rule: &AutoScaleRule,
    total_memory_metadata: &str,
    nodes: &[Node],
) -> AutoscaleResult<ScalerResult> {
    let mut plan_cache: HashMap<String, u64> = HashMap::new();
    let mut max_plan: i64 = 0;
    let mut data = Vec::with_capacity(nodes.len());
    for node in nodes {
        let total: f64 = node
            .metadata
            .get(total_memory_metadata)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AutoscaleError::MissingMemoryMetadata {
                address: node.address.clone(),
                key: total_memory_metadata.to_string(),
            })?;
        let max = (total * f64::from(rule.max_memory_ratio)) as i64;
        let mut reserved: i64 = 0;
        for cont in store.containers_by_host(node.host())? {
            let memory = match plan_cache.get(&cont.app_name) {
                Some(m) => *m,
                None => {
                    let m = apps
                        .app(&cont.app_name)
                        .await
                        .map(|a| a.plan_memory)
                        .unwrap_or(0);
                    plan_cache.insert(cont.app_name.clone(), m);
                    m
                }
            };
            reserved += memory as i64;
            max_plan = max_plan.max(memory as i64);
        }
        data.push(NodeMemory {
            node: node.clone(),
            max,
            reserved,
            available: max - reserved,
        });
    }
    if max_plan == 0 {
        return Ok(ScalerResult {
            reason: "no app memory information for this pool".to_string(),
            ..Default::default()
        });
    }

    let can_fit_max = data.iter().any(|d| d.available >= max_plan);
    if !can_fit_max {
        let total_reserved: i64 = data.iter().map(|d| d.reserved).sum();
        let total_max: i64 = data.iter().map(|d| d.max).sum();
        let per_node = data.iter().map(|d| d.max).max().unwrap_or(0).max(1);
        let missing = total_reserved + max_plan - total_max;
        let to_add = ((missing + per_node - 1) / per_node).max(1) as usize;
        return Ok(ScalerResult {
            to_add,
            reason: format!("can't add {max_plan} bytes to an existing node"),
            ..Default::default()
        });
    }

    // Scale down while the remaining nodes can absorb the evicted
    // containers and still fit the largest plan with headroom.
    let scaled_plan = (max_plan as f64 * f64::from(rule.scale_down_ratio)) as i64;
    let mut remaining: Vec<NodeMemory> = data;
    remaining.sort_by_key(|d| d.reserved);
    let mut chosen: Vec<Node> = Vec::new();
    loop {
        let nodes_left: Vec<Node> = remaining.iter().map(|d| d.node.clone()).collect();
        let mut picked = None;
        for (i, candidate) in remaining.iter().enumerate() {
            if !crate::metadata::can_remove_node(&candidate.node, &nodes_left)? {
                continue;
            }
            let spare_after: i64 = remaining
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, d)| d.available)
                .sum::<i64>()
                - candidate.reserved;
            if spare_after >= scaled_plan {
                picked = Some(i);
            }
            break;
        }
        match picked {
            Some(i) => chosen.push(remaining.remove(i).node),
            None => break,
        }
    }
    if !chosen.is_empty() {
        return Ok(ScalerResult {
            reason: format!(
                "containers can be distributed in only {} nodes",
                nodes.len() - chosen.len()
            ),
            to_remove: chosen,
            ..Default::default()
        });
    }
    let free: i64 = remaining.iter().map(|d| d.available).sum();
    Ok(ScalerResult {
        reason: format!("number of free bytes is {free}"),
        ..Default::default()
    })
}
