//! Container moving and fleet rebalancing.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use corral_cluster::{NodeCreationStatus, ProgressLog};
use corral_state::{Container, ContainerStatus, StateStore};

use crate::actions::{replace_units_pipeline, AddSpec, UnitChangeArgs};
use crate::error::{ProvisionError, ProvisionResult};
use crate::locker::AppLocker;
use crate::provisioner::Provisioner;

/// Selects the containers a rebalance touches.
#[derive(Debug, Clone, Default)]
pub struct RebalanceFilter {
    /// Restrict to nodes of this pool.
    pub pool: Option<String>,
    /// Restrict to these apps; empty means all.
    pub apps: Vec<String>,
}

/// Replace one container with a fresh one, destination chosen by the
/// scheduler unless `to_host` pins it. Holds the app lock throughout
/// and returns the replacements.
pub async fn move_one_container(
    prov: &Provisioner,
    locker: &AppLocker,
    cont: Container,
    to_host: Option<&str>,
    log: &ProgressLog,
) -> ProvisionResult<Vec<Container>> {
    if !locker.lock(&cont.app_name).await {
        return Err(ProvisionError::AppLocked(cont.app_name.clone()));
    }
    let result = move_locked(prov, cont.clone(), to_host, log).await;
    locker.unlock(&cont.app_name).await;
    result
}

async fn move_locked(
    prov: &Provisioner,
    cont: Container,
    to_host: Option<&str>,
    log: &ProgressLog,
) -> ProvisionResult<Vec<Container>> {
    let app = prov.apps.app(&cont.app_name).await?;
    let image = prov.config.images.current_image(&prov.store, &cont.app_name)?;
    let suffix = to_host.map(|h| format!(" to {h}")).unwrap_or_default();
    log.line(format!(
        "Moving unit {} for {:?} from {}{}...",
        cont.short_id(),
        app.name,
        cont.host_addr,
        suffix
    ));

    // A stopped unit moves as a stopped unit.
    let status = if cont.expected_status() == ContainerStatus::Stopped {
        ContainerStatus::Stopped
    } else {
        ContainerStatus::Started
    };
    let args = UnitChangeArgs {
        prov: prov.clone(),
        app,
        to_add: [(
            cont.process_name.clone(),
            AddSpec {
                quantity: 1,
                status,
            },
        )]
        .into(),
        to_remove: vec![cont.clone()],
        to_hosts: to_host.map(|h| vec![h.to_string()]).unwrap_or_default(),
        image,
        log: log.clone(),
        app_destroy: false,
    };
    let state = replace_units_pipeline().execute(&args).await?;
    log.line(format!("Finished moving unit {}.", cont.short_id()));
    Ok(state.added)
}

/// Drain a host: move every container on it, in parallel. Returns a
/// composite error naming each failed move.
pub async fn move_containers(
    prov: &Provisioner,
    locker: &Arc<AppLocker>,
    from_host: &str,
    to_host: Option<&str>,
    log: &ProgressLog,
) -> ProvisionResult<()> {
    let containers = prov.store.containers_by_host(from_host)?;
    if containers.is_empty() {
        log.line(format!("No units to move in {from_host}."));
        return Ok(());
    }
    log.line(format!(
        "Moving {} units from {from_host}...",
        containers.len()
    ));
    move_all(prov, locker, containers, to_host, log).await
}

async fn move_all(
    prov: &Provisioner,
    locker: &Arc<AppLocker>,
    containers: Vec<Container>,
    to_host: Option<&str>,
    log: &ProgressLog,
) -> ProvisionResult<()> {
    let mut handles = Vec::new();
    for cont in containers {
        let prov = prov.clone();
        let locker = locker.clone();
        let log = log.clone();
        let to_host = to_host.map(str::to_string);
        handles.push(tokio::spawn(async move {
            let short = cont.short_id().to_string();
            move_one_container(&prov, &locker, cont, to_host.as_deref(), &log)
                .await
                .map_err(|err| format!("Error moving unit {short}: {err}"))
        }));
    }
    let mut errors = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(msg)) => errors.push(msg),
            Err(join_err) => errors.push(format!("move task failed: {join_err}")),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::MoveFailures { errors })
    }
}

/// Spread containers matching the filter across their pool's nodes.
///
/// In dry mode the moves run against a snapshot with inert
/// collaborators; otherwise a clone performs them for real. Either
/// way the scheduler ignores the moved set, so the not-yet-removed
/// originals don't distort placement, and the provisioner that ran
/// the moves is returned so callers can measure the resulting layout.
pub async fn rebalance(
    prov: &Provisioner,
    filter: &RebalanceFilter,
    dry: bool,
    log: &ProgressLog,
) -> ProvisionResult<Provisioner> {
    let nodes = prov
        .registry
        .list()
        .await
        .map_err(ProvisionError::Other)?
        .into_iter()
        .filter(|n| n.status == NodeCreationStatus::Created)
        .filter(|n| match &filter.pool {
            Some(pool) => n.pool() == Some(pool.as_str()),
            None => true,
        })
        .collect::<Vec<_>>();
    let hosts: Vec<String> = nodes.iter().map(|n| n.host().to_string()).collect();
    let containers = prov
        .store
        .containers_by_apps_and_hosts(&filter.apps, &hosts)?;
    info!(count = containers.len(), dry, "rebalancing containers");

    let moved_ids: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();
    let clone = if dry {
        prov.dry_clone()?.with_ignored_scheduler(moved_ids)
    } else {
        prov.with_ignored_scheduler(moved_ids)
    };
    let locker = Arc::new(AppLocker::new(clone.apps.clone(), clone.router.clone()));
    move_all(&clone, &locker, containers, None, log).await?;
    Ok(clone)
}

/// Spread between the most and least loaded of `hosts`.
pub fn host_gap(store: &StateStore, hosts: &[String]) -> ProvisionResult<i64> {
    if hosts.is_empty() {
        return Ok(0);
    }
    let counts = store.count_containers_by_host(hosts, &HashSet::new())?;
    let max = counts.values().copied().max().unwrap_or(0) as i64;
    let min = counts.values().copied().min().unwrap_or(0) as i64;
    Ok(max - min)
}
