//! Metadata diversity accounting for node add and remove decisions.
//!
//! A pool's nodes usually differ only in a few metadata keys (zone,
//! instance type). Those keys partition the pool into groups; growth
//! clones the smallest group and removal never deletes a group's last
//! member.

use std::collections::BTreeMap;

use corral_cluster::{Node, IAAS_ID_METADATA};

use crate::error::{AutoscaleError, AutoscaleResult};

/// One exclusive metadata set and how many nodes carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaGroup {
    pub metadata: BTreeMap<String, String>,
    pub freq: usize,
}

/// Metadata relevant for grouping. The machine id is unique per node
/// and pre-IaaS nodes may lack it entirely, so it never counts.
fn clean_metadata(node: &Node) -> BTreeMap<String, String> {
    let mut metadata = node.metadata.clone();
    metadata.remove(IAAS_ID_METADATA);
    metadata
}

/// Partition node metadata into the part common to every node and the
/// per-group exclusive sets, with each set's node count.
///
/// Fails when two exclusive sets partially overlap: the nodes can't be
/// grouped and any add/remove choice would skew the pool.
pub fn split_metadata(
    metadata: &[BTreeMap<String, String>],
) -> AutoscaleResult<(Vec<MetaGroup>, BTreeMap<String, String>)> {
    let mut common = BTreeMap::new();
    let mut exclusive: Vec<BTreeMap<String, String>> = vec![BTreeMap::new(); metadata.len()];
    for (i, meta) in metadata.iter().enumerate() {
        for (key, value) in meta {
            let differs = metadata
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && other.get(key) != Some(value));
            if differs {
                exclusive[i].insert(key.clone(), value.clone());
            } else {
                common.insert(key.clone(), value.clone());
            }
        }
    }

    let mut groups: Vec<MetaGroup> = Vec::new();
    let mut grouped = vec![false; exclusive.len()];
    for i in 0..exclusive.len() {
        if exclusive[i].is_empty() {
            continue;
        }
        let mut freq = 1;
        for j in 0..exclusive.len() {
            if i == j {
                continue;
            }
            let diff_count = exclusive[i]
                .iter()
                .filter(|(k, v)| exclusive[j].get(*k) != Some(*v))
                .count();
            if diff_count > 0 && diff_count < exclusive[i].len() {
                return Err(AutoscaleError::UnbalancedMetadata {
                    first: exclusive[i].clone(),
                    second: exclusive[j].clone(),
                });
            }
            if diff_count == 0 {
                if j > i {
                    grouped[j] = true;
                }
                freq += 1;
            }
        }
        if !grouped[i] {
            groups.push(MetaGroup {
                metadata: exclusive[i].clone(),
                freq,
            });
        }
    }
    Ok((groups, common))
}

/// Metadata for a new machine: the common set plus the smallest
/// exclusive group's, growing the least-represented configuration.
pub fn choose_metadata_from_nodes(nodes: &[Node]) -> AutoscaleResult<BTreeMap<String, String>> {
    let metadata: Vec<_> = nodes.iter().map(clean_metadata).collect();
    let (mut groups, mut chosen) = split_metadata(&metadata)?;
    groups.sort_by(|a, b| a.freq.cmp(&b.freq).then_with(|| a.metadata.cmp(&b.metadata)));
    if let Some(smallest) = groups.first() {
        for (key, value) in &smallest.metadata {
            chosen.insert(key.clone(), value.clone());
        }
    }
    Ok(chosen)
}

/// Whether removing `chosen` keeps at least one node of every exclusive
/// metadata group alive.
pub fn can_remove_node(chosen: &Node, nodes: &[Node]) -> AutoscaleResult<bool> {
    if nodes.len() == 1 {
        return Ok(false);
    }
    let metadata: Vec<_> = nodes.iter().map(clean_metadata).collect();
    let (groups, _) = split_metadata(&metadata)?;
    if groups.is_empty() {
        return Ok(true);
    }
    let chosen_metadata = clean_metadata(chosen);
    for group in &groups {
        let matches = group
            .metadata
            .iter()
            .all(|(k, v)| chosen_metadata.get(k) == Some(v));
        if matches {
            return Ok(group.freq > 1);
        }
    }
    Ok(false)
}

/// Pick up to `count` nodes that are safe to remove, re-checking
/// diversity after each pick.
pub fn choose_nodes_for_removal(nodes: &[Node], count: usize) -> AutoscaleResult<Vec<Node>> {
    let mut remaining: Vec<Node> = nodes.to_vec();
    let mut chosen = Vec::new();
    for node in nodes {
        if can_remove_node(node, &remaining)? {
            remaining.retain(|n| n.address != node.address);
            chosen.push(node.clone());
            if chosen.len() >= count {
                break;
            }
        }
    }
    Ok(chosen)
}
