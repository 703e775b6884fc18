//! Shared fixtures for this crate's tests.

use std::sync::Arc;

use corral_cluster::testing::{FakeApps, FakeRouter, FakeRuntime, InMemoryRegistry};
use corral_cluster::{App, LocalLimiter, Node};
use corral_scheduler::{Scheduler, SchedulerOpts};
use corral_state::{Container, ContainerStatus, StateStore};

use crate::provisioner::{ProvisionConfig, Provisioner};

pub(crate) struct Harness {
    pub prov: Provisioner,
    pub store: StateStore,
    pub registry: Arc<InMemoryRegistry>,
    pub runtime: Arc<FakeRuntime>,
    pub router: Arc<FakeRouter>,
    pub apps: Arc<FakeApps>,
}

pub(crate) fn app(name: &str) -> App {
    App {
        name: name.to_string(),
        platform: "python".to_string(),
        pool: "pool1".to_string(),
        plan_memory: 0,
        deploys: 1,
        healthcheck: None,
        restart_after_hooks: Vec::new(),
    }
}

pub(crate) fn harness(hosts: &[&str], apps: Vec<App>) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let registry = Arc::new(InMemoryRegistry::with_nodes(
        hosts
            .iter()
            .map(|h| Node::new(format!("http://{h}:2375"), "pool1")),
    ));
    let runtime = Arc::new(FakeRuntime::default());
    let router = Arc::new(FakeRouter::default());
    let apps = Arc::new(FakeApps::with_apps(apps));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        apps.clone(),
        SchedulerOpts::default(),
    ));
    let prov = Provisioner::new(
        store.clone(),
        registry.clone(),
        runtime.clone(),
        router.clone(),
        apps.clone(),
        scheduler,
        Arc::new(LocalLimiter::new(0)),
        ProvisionConfig::default(),
    );
    Harness {
        prov,
        store,
        registry,
        runtime,
        router,
        apps,
    }
}

/// Seed a repository container that looks fully deployed on `host`.
pub(crate) fn seed_container(
    store: &StateStore,
    name: &str,
    id: &str,
    app: &str,
    process: &str,
    host: &str,
    port: &str,
) -> Container {
    let cont = Container {
        id: id.to_string(),
        name: name.to_string(),
        app_name: app.to_string(),
        process_name: process.to_string(),
        platform: "python".to_string(),
        image: format!("corral/app-{app}"),
        building_image: String::new(),
        host_addr: host.to_string(),
        host_port: port.to_string(),
        exposed_port: "8888/tcp".to_string(),
        ip: "172.17.0.2".to_string(),
        status: ContainerStatus::Started,
        status_updated_at: 1000,
        last_success_status_update: Some(1000),
        routable: false,
    };
    store.insert_container(&cont).unwrap();
    cont
}
