//! Container healing: a periodic pass that finds units whose status
//! reports went silent and recreates them elsewhere.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corral_cluster::ProgressLog;
use corral_provision::mover::move_one_container;
use corral_provision::{AppLocker, Provisioner};
use corral_state::{
    epoch_secs, Container, ContainerStatus, EntitySnapshot, HealingEvent, HealingKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{HealerError, HealerResult};
use crate::{STORM_LIMIT, STORM_WINDOW_SECS};

#[derive(Debug, Clone)]
pub struct ContainerHealerConfig {
    /// How long a container may go without a successful status report
    /// before it is considered dead.
    pub max_unresponsive: Duration,
    /// Pause between healing passes.
    pub interval: Duration,
}

impl Default for ContainerHealerConfig {
    fn default() -> Self {
        Self {
            max_unresponsive: Duration::from_secs(120),
            interval: Duration::from_secs(30),
        }
    }
}

/// Periodically sweeps the fleet for unresponsive containers and moves
/// each one, oldest silence first.
pub struct ContainerHealer {
    prov: Provisioner,
    locker: Arc<AppLocker>,
    config: ContainerHealerConfig,
    /// Rotates the candidate list across passes so one container stuck
    /// in a failing heal doesn't shadow the rest.
    probe_offset: AtomicUsize,
}

impl ContainerHealer {
    pub fn new(prov: Provisioner, locker: Arc<AppLocker>, config: ContainerHealerConfig) -> Self {
        Self {
            prov,
            locker,
            config,
            probe_offset: AtomicUsize::new(0),
        }
    }

    /// Healing loop. Runs until the shutdown channel fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "container healing pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// One healing pass. Per-container failures are logged and don't
    /// stop the sweep.
    pub async fn run_once(&self) -> HealerResult<()> {
        let mut candidates = self
            .prov
            .store()
            .unresponsive_containers(self.config.max_unresponsive.as_secs(), epoch_secs())?;
        candidates.sort_by_key(|c| c.last_success_status_update);
        let offset = self.probe_offset.fetch_add(1, Ordering::Relaxed);
        if !candidates.is_empty() {
            let split = offset % candidates.len();
            candidates.rotate_left(split);
        }
        for cont in candidates {
            if let Err(err) = self.heal_container(&cont).await {
                error!(
                    container = cont.short_id(),
                    app = %cont.app_name,
                    error = %err,
                    "container healing failed"
                );
            }
        }
        Ok(())
    }

    /// Heal one unresponsive container. Returns the replacement, or
    /// `None` when healing turned out to be unnecessary.
    pub async fn heal_container(&self, cont: &Container) -> HealerResult<Option<Container>> {
        // The record may be stale: if the runtime still reports the
        // container up, the silence was on the reporting side.
        if let Ok(info) = self
            .prov
            .runtime()
            .inspect_container(&cont.host_addr, &cont.id)
            .await
        {
            if info.running || info.restarting {
                self.prov
                    .store()
                    .set_container_status(&cont.name, ContainerStatus::Started, true)?;
                debug!(
                    container = cont.short_id(),
                    "container is still up, skipping healing"
                );
                return Ok(None);
            }
        }

        let count = self.prov.store().healing_count_for(
            HealingKind::ContainerHealing,
            &cont.id,
            STORM_WINDOW_SECS,
            epoch_secs(),
        )?;
        if count > STORM_LIMIT {
            return Err(HealerError::StormLimit {
                lineage: cont.id.clone(),
                limit: STORM_LIMIT,
                count,
            });
        }

        if !self.locker.lock(&cont.app_name).await {
            debug!(
                app = %cont.app_name,
                container = cont.short_id(),
                "app locked, skipping container healing"
            );
            return Ok(None);
        }
        let result = self.heal_locked(cont).await;
        self.locker.unlock(&cont.app_name).await;
        result
    }

    async fn heal_locked(&self, cont: &Container) -> HealerResult<Option<Container>> {
        // Another operation may have removed it while we waited on the
        // lock.
        if self.prov.store().container_by_name(&cont.name)?.is_none() {
            return Ok(None);
        }

        info!(
            container = cont.short_id(),
            app = %cont.app_name,
            host = %cont.host_addr,
            "healing unresponsive container"
        );
        let mut event =
            HealingEvent::open(HealingKind::ContainerHealing, container_snapshot(cont));
        self.prov.store().put_healing_event(&event)?;

        let log = ProgressLog::discard();
        let result = move_one_container(&self.prov, &self.locker, cont.clone(), None, &log).await;
        event.finished_at = Some(epoch_secs());
        let outcome = match result {
            Ok(added) => {
                let replacement = added.into_iter().next();
                if let Some(repl) = &replacement {
                    event.created = Some(container_snapshot(repl));
                    event.successful = true;
                }
                Ok(replacement)
            }
            Err(err) => {
                event.error = err.to_string();
                Err(err.into())
            }
        };
        self.prov.store().put_healing_event(&event)?;
        outcome
    }
}

fn container_snapshot(cont: &Container) -> EntitySnapshot {
    EntitySnapshot::Container {
        id: cont.id.clone(),
        name: cont.name.clone(),
        app_name: cont.app_name.clone(),
        process_name: cont.process_name.clone(),
        host_addr: cont.host_addr.clone(),
    }
}
