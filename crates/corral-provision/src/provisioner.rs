//! Provisioner façade: wires the collaborators and exposes unit ops.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use corral_cluster::{
    App, AppService, ContainerRuntime, ContainerSpec, HealthcheckSpec, HostLimiter,
    InspectedContainer, Node, NodeCreationStatus, NodeRegistry, ProgressLog, Router,
};
use corral_scheduler::Scheduler;
use corral_state::{Container, ContainerStatus, StateStore};

use crate::actions::{
    create_units_pipeline, destroy_units_pipeline, random_suffix, replace_units_pipeline,
    run_build_unit, AddSpec, RunContainerArgs, UnitChangeArgs,
};
use crate::error::ProvisionResult;
use crate::images::ImageConfig;

#[derive(Clone)]
pub struct ProvisionConfig {
    pub images: ImageConfig,
    /// Worker cap for parallel per-container fan-out; 0 = one worker
    /// per container.
    pub max_workers: usize,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            images: ImageConfig::default(),
            max_workers: 0,
        }
    }
}

/// Entry point for unit operations. Cheap to clone; all collaborators
/// are shared handles.
#[derive(Clone)]
pub struct Provisioner {
    pub(crate) store: StateStore,
    pub(crate) registry: Arc<dyn NodeRegistry>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) apps: Arc<dyn AppService>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) limiter: Arc<dyn HostLimiter>,
    pub(crate) config: ProvisionConfig,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        registry: Arc<dyn NodeRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<dyn Router>,
        apps: Arc<dyn AppService>,
        scheduler: Arc<Scheduler>,
        limiter: Arc<dyn HostLimiter>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            store,
            registry,
            runtime,
            router,
            apps,
            scheduler,
            limiter,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn NodeRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn apps(&self) -> &Arc<dyn AppService> {
        &self.apps
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn image_config(&self) -> &ImageConfig {
        &self.config.images
    }

    /// Usable nodes in a pool: registered, bootstrapped, not disabled.
    pub async fn pool_nodes(&self, pool: &str) -> ProvisionResult<Vec<Node>> {
        Ok(self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|n| n.pool() == Some(pool))
            .filter(|n| n.status == NodeCreationStatus::Created)
            .collect())
    }

    /// A provisioner whose scheduler ignores the given container ids.
    /// Used by rebalance so in-flight moves don't distort placement.
    pub fn with_ignored_scheduler(&self, ids: impl IntoIterator<Item = String>) -> Provisioner {
        let mut clone = self.clone();
        clone.scheduler = Arc::new(self.scheduler.with_ignored(ids));
        clone
    }

    /// A provisioner over a snapshot of the container state with inert
    /// collaborators. Moves run against the snapshot and touch nothing
    /// real; callers read the snapshot store afterwards.
    pub fn dry_clone(&self) -> ProvisionResult<Provisioner> {
        let snapshot = self.store.snapshot()?;
        let mut clone = self.clone();
        clone.scheduler = Arc::new(self.scheduler.over_store(snapshot.clone()));
        clone.store = snapshot;
        clone.runtime = Arc::new(DryRuntime);
        clone.router = Arc::new(DryRouter);
        clone.apps = Arc::new(DryApps {
            inner: self.apps.clone(),
        });
        Ok(clone)
    }

    // ── Unit operations ────────────────────────────────────────────

    /// Add `count` units of a process, scheduler-placed.
    pub async fn add_units(
        &self,
        app_name: &str,
        process: &str,
        count: u32,
        log: ProgressLog,
    ) -> ProvisionResult<Vec<Container>> {
        let app = self.apps.app(app_name).await?;
        let image = self.config.images.current_image(&self.store, app_name)?;
        let args = UnitChangeArgs {
            prov: self.clone(),
            app,
            to_add: BTreeMap::from([(
                process.to_string(),
                AddSpec {
                    quantity: count,
                    status: ContainerStatus::Started,
                },
            )]),
            to_remove: Vec::new(),
            to_hosts: Vec::new(),
            image,
            log,
            app_destroy: false,
        };
        let state = create_units_pipeline().execute(&args).await?;
        Ok(state.added)
    }

    /// Remove `count` units of a process, victims chosen by the
    /// scheduler from the most loaded hosts.
    pub async fn remove_units(
        &self,
        app_name: &str,
        process: &str,
        count: u32,
        log: ProgressLog,
    ) -> ProvisionResult<()> {
        let app = self.apps.app(app_name).await?;
        let nodes = self.pool_nodes(&app.pool).await?;
        let mut victims: Vec<Container> = Vec::new();
        for _ in 0..count {
            let sched = self
                .scheduler
                .with_ignored(victims.iter().map(|c| c.id.clone()));
            victims.push(sched.removable_container(&app, process, &nodes).await?);
        }
        let args = UnitChangeArgs {
            prov: self.clone(),
            app,
            to_add: BTreeMap::new(),
            to_remove: victims,
            to_hosts: Vec::new(),
            image: String::new(),
            log,
            app_destroy: false,
        };
        destroy_units_pipeline().execute(&args).await?;
        Ok(())
    }

    /// Remove every unit and the image history of an app.
    pub async fn destroy_app(&self, app_name: &str, log: ProgressLog) -> ProvisionResult<()> {
        let app = self.apps.app(app_name).await?;
        let to_remove = self.store.containers_by_app(app_name)?;
        let args = UnitChangeArgs {
            prov: self.clone(),
            app,
            to_add: BTreeMap::new(),
            to_remove,
            to_hosts: Vec::new(),
            image: String::new(),
            log,
            app_destroy: true,
        };
        destroy_units_pipeline().execute(&args).await?;
        self.store.delete_image_record(app_name)?;
        info!(app = app_name, "app destroyed");
        Ok(())
    }

    /// Build a new image from the app's current one, then replace every
    /// existing unit with units of the new image. Returns the image.
    pub async fn deploy(&self, app_name: &str, log: ProgressLog) -> ProvisionResult<String> {
        let app = self.apps.app(app_name).await?;
        let base_image = self.config.images.current_image(&self.store, app_name)?;
        let build_image = self.config.images.new_image_name(&self.store, app_name)?;

        let build_args = RunContainerArgs {
            prov: self.clone(),
            app: app.clone(),
            image: base_image,
            build_image: Some(build_image.clone()),
            process: String::new(),
            pin_hosts: Vec::new(),
            initial_status: ContainerStatus::Building,
            log: log.clone(),
        };
        run_build_unit(&build_args).await?;

        let old = self.store.containers_by_app(app_name)?;
        let mut to_add: BTreeMap<String, AddSpec> = BTreeMap::new();
        for cont in &old {
            let spec = to_add
                .entry(cont.process_name.clone())
                .or_insert(AddSpec {
                    quantity: 0,
                    status: cont.expected_status(),
                });
            spec.quantity += 1;
        }
        if to_add.is_empty() {
            to_add.insert(
                "web".to_string(),
                AddSpec {
                    quantity: 1,
                    status: ContainerStatus::Started,
                },
            );
        }
        let args = UnitChangeArgs {
            prov: self.clone(),
            app,
            to_add,
            to_remove: old,
            to_hosts: Vec::new(),
            image: build_image.clone(),
            log,
            app_destroy: false,
        };
        replace_units_pipeline().execute(&args).await?;
        Ok(build_image)
    }
}

// ── Inert collaborators for dry runs ───────────────────────────────

struct DryRuntime;

#[async_trait]
impl ContainerRuntime for DryRuntime {
    async fn create_container(
        &self,
        _host: &str,
        _spec: &ContainerSpec,
    ) -> anyhow::Result<String> {
        Ok(format!("dry{}", random_suffix(12)))
    }

    async fn start_container(&self, _host: &str, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop_container(&self, _host: &str, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_container(&self, _host: &str, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn inspect_container(
        &self,
        _host: &str,
        _id: &str,
    ) -> anyhow::Result<InspectedContainer> {
        Ok(InspectedContainer {
            running: true,
            restarting: false,
            ip: "0.0.0.0".to_string(),
            host_port: "0".to_string(),
        })
    }

    async fn wait_container(&self, _host: &str, _id: &str) -> anyhow::Result<i64> {
        Ok(0)
    }

    async fn container_logs(&self, _host: &str, _id: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn commit_container(&self, _host: &str, _id: &str, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_image(&self, _image: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn exec_container(&self, _host: &str, _id: &str, _cmd: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run_healthcheck(
        &self,
        _host: &str,
        _port: &str,
        _spec: &HealthcheckSpec,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct DryRouter;

#[async_trait]
impl Router for DryRouter {
    async fn add_routes(&self, _app_name: &str, _addresses: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove_routes(&self, _app_name: &str, _addresses: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rebuild_routes(&self, _app: &App) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Real app lookups, inert bindings and always-granted locks.
struct DryApps {
    inner: Arc<dyn AppService>,
}

#[async_trait]
impl AppService for DryApps {
    async fn app(&self, name: &str) -> anyhow::Result<App> {
        self.inner.app(name).await
    }

    async fn bind_unit(&self, _app: &App, _container: &Container) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unbind_unit(&self, _app: &App, _container: &Container) -> anyhow::Result<()> {
        Ok(())
    }

    async fn acquire_lock(
        &self,
        _app_name: &str,
        _owner: &str,
        _reason: &str,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn release_lock(&self, _app_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
