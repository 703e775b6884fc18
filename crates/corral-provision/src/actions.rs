//! Concrete lifecycle actions and the prewired pipelines.
//!
//! Two pipeline families share this module:
//!
//! * per-container pipelines (context [`RunContainerArgs`], result
//!   [`Container`]) that take one unit from nothing to running — or,
//!   for deploys, to a committed image;
//! * unit-change pipelines (context [`UnitChangeArgs`], result
//!   [`UnitState`]) that swap sets of units while keeping the router
//!   pointed at healthy containers throughout.
//!
//! Ordering in the replace pipeline is load-bearing: new units must be
//! healthy before any old route goes, and old routes must be gone
//! before old units die.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, warn};

use corral_cluster::{App, ContainerSpec, ProgressLog};
use corral_pipeline::{Action, Pipeline};
use corral_scheduler::ScheduleOpts;
use corral_state::{epoch_secs, Container, ContainerStatus};

use crate::error::ProvisionResult;
use crate::provisioner::Provisioner;
use crate::runner::{run_in_containers, ContainerCallback, RollbackCallback};

const DEFAULT_EXPOSED_PORT: &str = "8888/tcp";

/// Random lowercase-hex suffix for container names and dry-run ids.
pub(crate) fn random_suffix(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| HEX[rng.random_range(0..HEX.len())] as char)
        .collect()
}

/// A process is routable when it serves web traffic. Apps predating
/// process declarations have a single unnamed process, which is web.
fn is_web_process(process: &str) -> bool {
    process == "web" || process.is_empty()
}

// ── Per-container pipeline ─────────────────────────────────────────

#[derive(Clone)]
pub struct RunContainerArgs {
    pub prov: Provisioner,
    pub app: App,
    /// Image the container runs (for deploy builds, the base image).
    pub image: String,
    /// Commit target for deploy builds; `None` for plain units.
    pub build_image: Option<String>,
    pub process: String,
    /// Restrict placement to these hosts; empty lets the scheduler
    /// roam the whole pool.
    pub pin_hosts: Vec<String>,
    pub initial_status: ContainerStatus,
    pub log: ProgressLog,
}

struct InsertEmptyContainer;

#[async_trait]
impl Action<RunContainerArgs, Container> for InsertEmptyContainer {
    fn name(&self) -> &str {
        "insert-empty-container"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        _prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let now = epoch_secs();
        let cont = Container {
            id: String::new(),
            name: format!("{}-{}", ctx.app.name, random_suffix(10)),
            app_name: ctx.app.name.clone(),
            process_name: ctx.process.clone(),
            platform: ctx.app.platform.clone(),
            image: ctx.image.clone(),
            building_image: ctx.build_image.clone().unwrap_or_default(),
            host_addr: String::new(),
            host_port: String::new(),
            exposed_port: DEFAULT_EXPOSED_PORT.to_string(),
            ip: String::new(),
            status: if ctx.build_image.is_some() {
                ContainerStatus::Building
            } else {
                ContainerStatus::Created
            },
            status_updated_at: now,
            last_success_status_update: None,
            routable: false,
        };
        ctx.prov.store.insert_container(&cont)?;
        Ok(cont)
    }

    async fn backward(&self, ctx: &RunContainerArgs, result: &Container) {
        if let Err(err) = ctx.prov.store.delete_container(&result.name) {
            error!(container = %result.name, error = %err, "failed to remove container row");
        }
    }
}

struct CreateContainer;

#[async_trait]
impl Action<RunContainerArgs, Container> for CreateContainer {
    fn name(&self) -> &str {
        "create-container"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let mut cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        let mut nodes = ctx.prov.pool_nodes(&ctx.app.pool).await?;
        if !ctx.pin_hosts.is_empty() {
            nodes.retain(|n| ctx.pin_hosts.iter().any(|h| h == n.host()));
        }
        let opts = ScheduleOpts {
            update_name: Some(cont.name.clone()),
        };
        let node = ctx
            .prov
            .scheduler
            .schedule(&ctx.app, &ctx.process, &opts, &nodes)
            .await?;
        let host = node.host().to_string();

        let spec = ContainerSpec {
            name: cont.name.clone(),
            image: ctx.image.clone(),
            app_name: ctx.app.name.clone(),
            process_name: ctx.process.clone(),
            memory: ctx.app.plan_memory,
            exposed_port: cont.exposed_port.clone(),
        };
        let _slot = ctx.prov.limiter.acquire(&host).await;
        cont.id = ctx.prov.runtime.create_container(&host, &spec).await?;
        cont.host_addr = host;
        Ok(cont)
    }

    async fn backward(&self, ctx: &RunContainerArgs, result: &Container) {
        let _slot = ctx.prov.limiter.acquire(&result.host_addr).await;
        if let Err(err) = ctx
            .prov
            .runtime
            .remove_container(&result.host_addr, &result.id)
            .await
        {
            error!(container = %result.short_id(), error = %err, "failed to remove runtime container");
        }
    }
}

struct SetContainerId;

#[async_trait]
impl Action<RunContainerArgs, Container> for SetContainerId {
    fn name(&self) -> &str {
        "set-container-id"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        ctx.prov.store.set_container_id(&cont.name, &cont.id)?;
        Ok(cont)
    }
}

struct StartContainer;

#[async_trait]
impl Action<RunContainerArgs, Container> for StartContainer {
    fn name(&self) -> &str {
        "start-container"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let mut cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        let _slot = ctx.prov.limiter.acquire(&cont.host_addr).await;
        ctx.prov
            .runtime
            .start_container(&cont.host_addr, &cont.id)
            .await?;
        cont.status = ContainerStatus::Starting;
        cont.status_updated_at = epoch_secs();
        Ok(cont)
    }

    async fn backward(&self, ctx: &RunContainerArgs, result: &Container) {
        let _slot = ctx.prov.limiter.acquire(&result.host_addr).await;
        if let Err(err) = ctx
            .prov
            .runtime
            .stop_container(&result.host_addr, &result.id)
            .await
        {
            error!(container = %result.short_id(), error = %err, "failed to stop container");
        }
    }
}

/// Replacement for `start-container` when the unit being replaced was
/// stopped: the new one is created but stays stopped.
struct KeepContainerStopped;

#[async_trait]
impl Action<RunContainerArgs, Container> for KeepContainerStopped {
    fn name(&self) -> &str {
        "stop-container"
    }

    async fn forward(
        &self,
        _ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let mut cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        cont.status = ContainerStatus::Stopped;
        cont.status_updated_at = epoch_secs();
        Ok(cont)
    }
}

struct UpdateContainerInDb;

#[async_trait]
impl Action<RunContainerArgs, Container> for UpdateContainerInDb {
    fn name(&self) -> &str {
        "update-container-in-db"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        ctx.prov.store.update_container(&cont)?;
        Ok(cont)
    }
}

struct SetNetworkInfo;

#[async_trait]
impl Action<RunContainerArgs, Container> for SetNetworkInfo {
    fn name(&self) -> &str {
        "set-network-info"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let mut cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        let inspected = ctx
            .prov
            .runtime
            .inspect_container(&cont.host_addr, &cont.id)
            .await?;
        cont.ip = inspected.ip;
        cont.host_port = inspected.host_port;
        ctx.prov.store.update_container(&cont)?;
        Ok(cont)
    }
}

/// Deploy-build tail: stream build logs, require a clean exit, commit
/// the filesystem as the app's next image, and discard the builder.
struct FollowLogsAndCommit;

#[async_trait]
impl Action<RunContainerArgs, Container> for FollowLogsAndCommit {
    fn name(&self) -> &str {
        "follow-logs-and-commit"
    }

    async fn forward(
        &self,
        ctx: &RunContainerArgs,
        prev: Option<&Container>,
    ) -> anyhow::Result<Container> {
        let mut cont = prev.cloned().ok_or_else(|| anyhow::anyhow!("no container"))?;
        let build_image = ctx
            .build_image
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no build image configured"))?;

        let logs = ctx
            .prov
            .runtime
            .container_logs(&cont.host_addr, &cont.id)
            .await?;
        for line in logs.lines() {
            ctx.log.line(line);
        }
        let exit = ctx
            .prov
            .runtime
            .wait_container(&cont.host_addr, &cont.id)
            .await?;
        if exit != 0 {
            anyhow::bail!("build container exited with status {exit}");
        }
        ctx.prov
            .runtime
            .commit_container(&cont.host_addr, &cont.id, &build_image)
            .await?;

        // The builder served its purpose; drop it everywhere.
        if let Err(err) = ctx
            .prov
            .runtime
            .remove_container(&cont.host_addr, &cont.id)
            .await
        {
            warn!(container = %cont.short_id(), error = %err, "failed to remove build container");
        }
        ctx.prov.store.delete_container(&cont.name)?;

        cont.image = build_image;
        cont.building_image = String::new();
        Ok(cont)
    }
}

fn run_unit_pipeline(stopped: bool) -> Pipeline<RunContainerArgs, Container> {
    let start_or_stop: Arc<dyn Action<RunContainerArgs, Container>> = if stopped {
        Arc::new(KeepContainerStopped)
    } else {
        Arc::new(StartContainer)
    };
    Pipeline::new(vec![
        Arc::new(InsertEmptyContainer),
        Arc::new(CreateContainer),
        Arc::new(SetContainerId),
        start_or_stop,
        Arc::new(UpdateContainerInDb),
        Arc::new(SetNetworkInfo),
    ])
}

/// Run one unit from nothing to running (or created-stopped).
pub async fn run_new_unit(args: &RunContainerArgs) -> ProvisionResult<Container> {
    let stopped = args.initial_status == ContainerStatus::Stopped;
    Ok(run_unit_pipeline(stopped).execute(args).await?)
}

/// Run a deploy build container and commit its image.
pub async fn run_build_unit(args: &RunContainerArgs) -> ProvisionResult<Container> {
    let pipeline = Pipeline::new(vec![
        Arc::new(InsertEmptyContainer) as Arc<dyn Action<RunContainerArgs, Container>>,
        Arc::new(CreateContainer),
        Arc::new(SetContainerId),
        Arc::new(StartContainer),
        Arc::new(UpdateContainerInDb),
        Arc::new(FollowLogsAndCommit),
    ]);
    Ok(pipeline.execute(args).await?)
}

// ── Unit-change pipeline ───────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct AddSpec {
    pub quantity: u32,
    /// Initial status for the new units; stopped units are replaced by
    /// stopped units.
    pub status: ContainerStatus,
}

#[derive(Clone)]
pub struct UnitChangeArgs {
    pub prov: Provisioner,
    pub app: App,
    pub to_add: BTreeMap<String, AddSpec>,
    pub to_remove: Vec<Container>,
    /// Pin new units to these hosts; empty lets the scheduler choose.
    pub to_hosts: Vec<String>,
    /// Image for the new units; also promoted by `update-app-image`.
    pub image: String,
    pub log: ProgressLog,
    /// The app is going away: route-removal failures are swallowed.
    pub app_destroy: bool,
}

/// Result threaded through the unit-change actions. Each action's
/// backward receives the value *it* returned, so each records what it
/// did here.
#[derive(Debug, Clone, Default)]
pub struct UnitState {
    pub added: Vec<Container>,
    /// Route addresses added by `add-new-routes`.
    pub added_routes: Vec<String>,
    /// Route addresses removed by `remove-old-routes`.
    pub removed_routes: Vec<String>,
}

/// Printed by the failing action before the pipeline unwinds.
fn rollback_notice(ctx: &UnitChangeArgs, err: &anyhow::Error) {
    ctx.log.line("**** ROLLING BACK AFTER FAILURE ****");
    ctx.log.line(format!(" ---> {err} <---"));
}

async fn destroy_container(prov: &Provisioner, cont: &Container) -> anyhow::Result<()> {
    let _slot = prov.limiter.acquire(&cont.host_addr).await;
    if !cont.id.is_empty() {
        if let Err(err) = prov.runtime.stop_container(&cont.host_addr, &cont.id).await {
            warn!(container = %cont.short_id(), error = %err, "stop before removal failed");
        }
        prov.runtime
            .remove_container(&cont.host_addr, &cont.id)
            .await?;
    }
    prov.store.delete_container(&cont.name)?;
    Ok(())
}

async fn destroy_added(ctx: &UnitChangeArgs, added: &[Container]) {
    for cont in added {
        match destroy_container(&ctx.prov, cont).await {
            Ok(()) => ctx.log.line(format!(
                " ---> Destroyed unit {} [{}]",
                cont.short_id(),
                cont.process_name
            )),
            Err(err) => {
                error!(container = %cont.short_id(), error = %err, "rollback destroy failed");
            }
        }
    }
}

struct ProvisionAddUnitsToHost;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for ProvisionAddUnitsToHost {
    fn name(&self) -> &str {
        "provision-add-units-to-host"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        _prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let mut state = UnitState::default();
        for (process, spec) in &ctx.to_add {
            ctx.log.line(format!(
                "---- Starting {q} new units [{process}: {q}] ----",
                q = spec.quantity
            ));
            for _ in 0..spec.quantity {
                let args = RunContainerArgs {
                    prov: ctx.prov.clone(),
                    app: ctx.app.clone(),
                    image: ctx.image.clone(),
                    build_image: None,
                    process: process.clone(),
                    pin_hosts: ctx.to_hosts.clone(),
                    initial_status: spec.status,
                    log: ctx.log.clone(),
                };
                let cont = match run_new_unit(&args).await {
                    Ok(cont) => cont,
                    Err(err) => {
                        // The pipeline skips the failing action's own
                        // backward, so units from earlier iterations
                        // are cleaned here.
                        destroy_added(ctx, &state.added).await;
                        return Err(err.into());
                    }
                };
                ctx.log
                    .line(format!(" ---> Started unit {} [{process}]", cont.short_id()));
                state.added.push(cont);
            }
        }
        Ok(state)
    }

    async fn backward(&self, ctx: &UnitChangeArgs, result: &UnitState) {
        destroy_added(ctx, &result.added).await;
    }

    async fn on_error(&self, ctx: &UnitChangeArgs, err: &anyhow::Error) {
        rollback_notice(ctx, err);
    }
}

struct BindAndHealthcheck;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for BindAndHealthcheck {
    fn name(&self) -> &str {
        "bind-and-healthcheck"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let state = prev.cloned().unwrap_or_default();
        // An already-unhealthy app must not gate its own rollout on a
        // healthcheck that can't pass.
        let check_health = !ctx.to_remove.iter().any(|c| {
            matches!(c.status, ContainerStatus::Error | ContainerStatus::Stopped)
        });

        let prov = ctx.prov.clone();
        let app = ctx.app.clone();
        let healthcheck = ctx.app.healthcheck.clone();
        let hooks = ctx.app.restart_after_hooks.clone();
        let callback: ContainerCallback = Arc::new(move |cont, sink| {
            let prov = prov.clone();
            let app = app.clone();
            let healthcheck = healthcheck.clone();
            let hooks = hooks.clone();
            Box::pin(async move {
                let _slot = prov.limiter.acquire(&cont.host_addr).await;
                // A bind failure must not sink the rollout; the unit
                // still goes to the rollback set for unbinding.
                if let Err(err) = prov.apps.bind_unit(&app, &cont).await {
                    warn!(container = %cont.short_id(), error = %err, "ignored error binding unit");
                }
                sink.push(cont.clone());
                if check_health && is_web_process(&cont.process_name) {
                    if let Some(spec) = &healthcheck {
                        if cont.valid_addr() {
                            prov.runtime
                                .run_healthcheck(&cont.host_addr, &cont.host_port, spec)
                                .await?;
                        }
                    }
                }
                for cmd in &hooks {
                    prov.runtime
                        .exec_container(&cont.host_addr, &cont.id, cmd)
                        .await?;
                }
                Ok(())
            })
        });
        let prov = ctx.prov.clone();
        let app = ctx.app.clone();
        let rollback: RollbackCallback = Arc::new(move |cont| {
            let prov = prov.clone();
            let app = app.clone();
            Box::pin(async move { prov.apps.unbind_unit(&app, &cont).await })
        });
        run_in_containers(
            &state.added,
            ctx.prov.config.max_workers,
            true,
            callback,
            Some(rollback),
        )
        .await?;
        Ok(state)
    }

    async fn backward(&self, ctx: &UnitChangeArgs, result: &UnitState) {
        for cont in &result.added {
            if let Err(err) = ctx.prov.apps.unbind_unit(&ctx.app, cont).await {
                error!(container = %cont.short_id(), error = %err, "unbind failed during rollback");
            }
        }
    }

    async fn on_error(&self, ctx: &UnitChangeArgs, err: &anyhow::Error) {
        rollback_notice(ctx, err);
    }
}

struct AddNewRoutes;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for AddNewRoutes {
    fn name(&self) -> &str {
        "add-new-routes"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let mut state = prev.cloned().unwrap_or_default();
        for i in 0..state.added.len() {
            let cont = &state.added[i];
            if !is_web_process(&cont.process_name) || !cont.valid_addr() {
                continue;
            }
            let Some(addr) = cont.address() else { continue };
            if let Err(err) = ctx
                .prov
                .router
                .add_routes(&ctx.app.name, std::slice::from_ref(&addr))
                .await
            {
                // Undo the partial set before failing.
                if let Err(undo_err) = ctx
                    .prov
                    .router
                    .remove_routes(&ctx.app.name, &state.added_routes)
                    .await
                {
                    error!(app = %ctx.app.name, error = %undo_err, "failed to undo partial routes");
                }
                return Err(err);
            }
            state.added[i].routable = true;
            state.added_routes.push(addr);
        }
        Ok(state)
    }

    async fn backward(&self, ctx: &UnitChangeArgs, result: &UnitState) {
        if result.added_routes.is_empty() {
            return;
        }
        if let Err(err) = ctx
            .prov
            .router
            .remove_routes(&ctx.app.name, &result.added_routes)
            .await
        {
            error!(app = %ctx.app.name, error = %err, "failed to remove routes during rollback");
        }
    }

    async fn on_error(&self, ctx: &UnitChangeArgs, err: &anyhow::Error) {
        rollback_notice(ctx, err);
    }
}

struct SetRouterHealthcheck;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for SetRouterHealthcheck {
    fn name(&self) -> &str {
        "set-router-healthcheck"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let state = prev.cloned().unwrap_or_default();
        if ctx.prov.router.supports_custom_healthcheck() {
            ctx.prov
                .router
                .set_healthcheck(&ctx.app.name, ctx.app.healthcheck.clone())
                .await?;
        }
        Ok(state)
    }

    async fn backward(&self, ctx: &UnitChangeArgs, _result: &UnitState) {
        if !ctx.prov.router.supports_custom_healthcheck() {
            return;
        }
        if let Err(err) = ctx.prov.router.set_healthcheck(&ctx.app.name, None).await {
            error!(app = %ctx.app.name, error = %err, "failed to reset router healthcheck");
        }
    }

    async fn on_error(&self, ctx: &UnitChangeArgs, err: &anyhow::Error) {
        rollback_notice(ctx, err);
    }
}

struct RemoveOldRoutes;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for RemoveOldRoutes {
    fn name(&self) -> &str {
        "remove-old-routes"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let mut state = prev.cloned().unwrap_or_default();
        for cont in &ctx.to_remove {
            if !is_web_process(&cont.process_name) || !cont.valid_addr() {
                continue;
            }
            let Some(addr) = cont.address() else { continue };
            if let Err(err) = ctx
                .prov
                .router
                .remove_routes(&ctx.app.name, std::slice::from_ref(&addr))
                .await
            {
                if ctx.app_destroy {
                    // The app is going away with its routes.
                    warn!(app = %ctx.app.name, error = %err, "route removal failed during destroy");
                    continue;
                }
                if let Err(undo_err) = ctx
                    .prov
                    .router
                    .add_routes(&ctx.app.name, &state.removed_routes)
                    .await
                {
                    error!(app = %ctx.app.name, error = %undo_err, "failed to restore removed routes");
                }
                return Err(err);
            }
            state.removed_routes.push(addr);
        }
        Ok(state)
    }

    async fn backward(&self, ctx: &UnitChangeArgs, result: &UnitState) {
        if result.removed_routes.is_empty() {
            return;
        }
        if let Err(err) = ctx
            .prov
            .router
            .add_routes(&ctx.app.name, &result.removed_routes)
            .await
        {
            error!(app = %ctx.app.name, error = %err, "failed to re-add routes during rollback");
        }
    }

    async fn on_error(&self, ctx: &UnitChangeArgs, err: &anyhow::Error) {
        rollback_notice(ctx, err);
    }
}

struct UpdateAppImage;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for UpdateAppImage {
    fn name(&self) -> &str {
        "update-app-image"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let state = prev.cloned().unwrap_or_default();
        if !ctx.image.is_empty() {
            ctx.prov
                .config
                .images
                .promote(&ctx.prov.store, &ctx.prov.runtime, &ctx.app.name, &ctx.image)
                .await?;
        }
        Ok(state)
    }
}

struct ProvisionRemoveOldUnits;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for ProvisionRemoveOldUnits {
    fn name(&self) -> &str {
        "provision-remove-old-units"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let state = prev.cloned().unwrap_or_default();
        let prov = ctx.prov.clone();
        // The new units are live; a straggler that won't die is logged
        // and left for the healer.
        let callback: ContainerCallback = Arc::new(move |cont, _sink| {
            let prov = prov.clone();
            Box::pin(async move {
                if let Err(err) = destroy_container(&prov, &cont).await {
                    error!(container = %cont.short_id(), error = %err, "failed to remove old unit");
                }
                Ok(())
            })
        });
        run_in_containers(
            &ctx.to_remove,
            ctx.prov.config.max_workers,
            true,
            callback,
            None,
        )
        .await?;
        Ok(state)
    }
}

struct ProvisionUnbindOldUnits;

#[async_trait]
impl Action<UnitChangeArgs, UnitState> for ProvisionUnbindOldUnits {
    fn name(&self) -> &str {
        "provision-unbind-old-units"
    }

    async fn forward(
        &self,
        ctx: &UnitChangeArgs,
        prev: Option<&UnitState>,
    ) -> anyhow::Result<UnitState> {
        let state = prev.cloned().unwrap_or_default();
        let prov = ctx.prov.clone();
        let app = ctx.app.clone();
        let callback: ContainerCallback = Arc::new(move |cont, _sink| {
            let prov = prov.clone();
            let app = app.clone();
            Box::pin(async move {
                if let Err(err) = prov.apps.unbind_unit(&app, &cont).await {
                    error!(container = %cont.short_id(), error = %err, "failed to unbind old unit");
                }
                Ok(())
            })
        });
        run_in_containers(
            &ctx.to_remove,
            ctx.prov.config.max_workers,
            true,
            callback,
            None,
        )
        .await?;
        Ok(state)
    }
}

/// Full unit swap: deploys, moves, and rebalances.
pub fn replace_units_pipeline() -> Pipeline<UnitChangeArgs, UnitState> {
    Pipeline::new(vec![
        Arc::new(ProvisionAddUnitsToHost) as Arc<dyn Action<UnitChangeArgs, UnitState>>,
        Arc::new(BindAndHealthcheck),
        Arc::new(AddNewRoutes),
        Arc::new(SetRouterHealthcheck),
        Arc::new(RemoveOldRoutes),
        Arc::new(UpdateAppImage),
        Arc::new(ProvisionRemoveOldUnits),
        Arc::new(ProvisionUnbindOldUnits),
    ])
}

/// Scale-up without anything to remove.
pub fn create_units_pipeline() -> Pipeline<UnitChangeArgs, UnitState> {
    Pipeline::new(vec![
        Arc::new(ProvisionAddUnitsToHost) as Arc<dyn Action<UnitChangeArgs, UnitState>>,
        Arc::new(BindAndHealthcheck),
        Arc::new(AddNewRoutes),
        Arc::new(UpdateAppImage),
    ])
}

/// Teardown of existing units.
pub fn destroy_units_pipeline() -> Pipeline<UnitChangeArgs, UnitState> {
    Pipeline::new(vec![
        Arc::new(RemoveOldRoutes) as Arc<dyn Action<UnitChangeArgs, UnitState>>,
        Arc::new(ProvisionRemoveOldUnits),
        Arc::new(ProvisionUnbindOldUnits),
    ])
}
