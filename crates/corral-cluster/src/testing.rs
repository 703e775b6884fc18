//! In-memory fakes for every collaborator interface.
//!
//! These power the crate tests across the workspace, so they live in
//! the library proper rather than behind `cfg(test)`. Each fake records
//! calls and can be told to fail specific operations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use corral_state::Container;

use crate::app::{App, AppService, HealthcheckSpec};
use crate::node::{Machine, Node};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, Iaas, InspectedContainer, NodeRegistry, Router, WorkQueue,
};

// ── Registry ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryRegistry {
    nodes: Mutex<BTreeMap<String, Node>>,
}

impl InMemoryRegistry {
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let registry = Self::default();
        {
            let mut map = registry.nodes.lock().unwrap();
            for node in nodes {
                map.insert(node.address.clone(), node);
            }
        }
        registry
    }

    pub fn addresses(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl NodeRegistry for InMemoryRegistry {
    async fn register(&self, node: Node) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&node.address) {
            anyhow::bail!("node {} already registered", node.address);
        }
        nodes.insert(node.address.clone(), node);
        Ok(())
    }

    async fn unregister(&self, address: &str) -> anyhow::Result<()> {
        self.nodes.lock().unwrap().remove(address);
        Ok(())
    }

    async fn update(&self, node: Node) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(&node.address) {
            anyhow::bail!("node {} not registered", node.address);
        }
        nodes.insert(node.address.clone(), node);
        Ok(())
    }

    async fn node(&self, address: &str) -> anyhow::Result<Option<Node>> {
        Ok(self.nodes.lock().unwrap().get(address).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }
}

// ── Runtime ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FakeRuntimeContainer {
    pub host: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub restarting: bool,
}

/// Fake container runtime. Ids are sequential (`fake-1`, `fake-2`, ...)
/// padded past the short-id length. Operations named in `fail_ops`
/// fail once per entry.
#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicU64,
    pub containers: Mutex<HashMap<String, FakeRuntimeContainer>>,
    fail_ops: Mutex<Vec<String>>,
    fail_after: Mutex<HashMap<String, usize>>,
    /// Exit code reported by `wait_container`.
    pub exit_code: AtomicU64,
    pub committed: Mutex<Vec<String>>,
    pub removed_images: Mutex<Vec<String>>,
    pub healthchecks: Mutex<Vec<String>>,
    /// `(container id, command)` pairs seen by `exec_container`.
    pub execs: Mutex<Vec<(String, String)>>,
}

impl FakeRuntime {
    /// Make the next call to the named operation fail.
    pub fn fail_once(&self, op: &str) {
        self.fail_ops.lock().unwrap().push(op.to_string());
    }

    /// Let the named operation succeed `successes` times, then fail
    /// once.
    pub fn fail_after(&self, op: &str, successes: usize) {
        self.fail_after
            .lock()
            .unwrap()
            .insert(op.to_string(), successes);
    }

    fn check_fail(&self, op: &str) -> anyhow::Result<()> {
        let mut ops = self.fail_ops.lock().unwrap();
        if let Some(pos) = ops.iter().position(|o| o == op) {
            ops.remove(pos);
            anyhow::bail!("runtime {op} failed");
        }
        drop(ops);
        let mut delayed = self.fail_after.lock().unwrap();
        if let Some(remaining) = delayed.get_mut(op) {
            if *remaining == 0 {
                delayed.remove(op);
                anyhow::bail!("runtime {op} failed");
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn container(&self, id: &str) -> anyhow::Result<FakeRuntimeContainer> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such container {id}"))
    }

    /// Flip the runtime state directly, simulating a crash or restart.
    pub fn set_state(&self, id: &str, running: bool, restarting: bool) {
        if let Some(cont) = self.containers.lock().unwrap().get_mut(id) {
            cont.running = running;
            cont.restarting = restarting;
        }
    }

    pub fn hosts_of(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for cont in self.containers.lock().unwrap().values() {
            *counts.entry(cont.host.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, host: &str, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.check_fail("create")?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake{n:012}");
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeRuntimeContainer {
                host: host.to_string(),
                spec: spec.clone(),
                running: false,
                restarting: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, _host: &str, id: &str) -> anyhow::Result<()> {
        self.check_fail("start")?;
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(id) {
            Some(cont) => {
                cont.running = true;
                Ok(())
            }
            None => anyhow::bail!("no such container {id}"),
        }
    }

    async fn stop_container(&self, _host: &str, id: &str) -> anyhow::Result<()> {
        self.check_fail("stop")?;
        if let Some(cont) = self.containers.lock().unwrap().get_mut(id) {
            cont.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, _host: &str, id: &str) -> anyhow::Result<()> {
        self.check_fail("remove")?;
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn inspect_container(
        &self,
        _host: &str,
        id: &str,
    ) -> anyhow::Result<InspectedContainer> {
        self.check_fail("inspect")?;
        let cont = self.container(id)?;
        // Unique host port per container, derived from the id sequence.
        let seq: u64 = id
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .parse()
            .unwrap_or(0);
        Ok(InspectedContainer {
            running: cont.running,
            restarting: cont.restarting,
            ip: "172.17.0.2".to_string(),
            host_port: format!("{}", 49000 + seq),
        })
    }

    async fn wait_container(&self, _host: &str, id: &str) -> anyhow::Result<i64> {
        self.check_fail("wait")?;
        self.container(id)?;
        Ok(self.exit_code.load(Ordering::SeqCst) as i64)
    }

    async fn container_logs(&self, _host: &str, id: &str) -> anyhow::Result<String> {
        self.container(id)?;
        Ok(format!("logs for {id}\n"))
    }

    async fn commit_container(&self, _host: &str, id: &str, image: &str) -> anyhow::Result<()> {
        self.check_fail("commit")?;
        self.container(id)?;
        self.committed.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> anyhow::Result<()> {
        self.check_fail("remove_image")?;
        self.removed_images.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn exec_container(&self, _host: &str, id: &str, cmd: &str) -> anyhow::Result<()> {
        self.check_fail("exec")?;
        self.container(id)?;
        self.execs
            .lock()
            .unwrap()
            .push((id.to_string(), cmd.to_string()));
        Ok(())
    }

    async fn run_healthcheck(
        &self,
        host: &str,
        port: &str,
        spec: &HealthcheckSpec,
    ) -> anyhow::Result<()> {
        self.check_fail("healthcheck")?;
        self.healthchecks
            .lock()
            .unwrap()
            .push(format!("{host}:{port}{}", spec.path));
        Ok(())
    }
}

// ── Router ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeRouter {
    pub routes: Mutex<HashMap<String, BTreeSet<String>>>,
    pub healthchecks: Mutex<HashMap<String, Option<HealthcheckSpec>>>,
    pub rebuilt: Mutex<Vec<String>>,
    fail_after: Mutex<Option<usize>>,
    custom_healthcheck: bool,
}

impl FakeRouter {
    pub fn with_custom_healthcheck() -> Self {
        Self {
            custom_healthcheck: true,
            ..Self::default()
        }
    }

    /// Fail `add_routes` after the given number of successful route
    /// additions (counted per address, across calls).
    pub fn fail_add_after(&self, successes: usize) {
        *self.fail_after.lock().unwrap() = Some(successes);
    }

    pub fn routes_for(&self, app: &str) -> Vec<String> {
        self.routes
            .lock()
            .unwrap()
            .get(app)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Router for FakeRouter {
    async fn add_routes(&self, app_name: &str, addresses: &[String]) -> anyhow::Result<()> {
        let mut routes = self.routes.lock().unwrap();
        let entry = routes.entry(app_name.to_string()).or_default();
        for addr in addresses {
            let mut fail_after = self.fail_after.lock().unwrap();
            if let Some(remaining) = fail_after.as_mut() {
                if *remaining == 0 {
                    anyhow::bail!("router add failed for {addr}");
                }
                *remaining -= 1;
            }
            entry.insert(addr.clone());
        }
        Ok(())
    }

    async fn remove_routes(&self, app_name: &str, addresses: &[String]) -> anyhow::Result<()> {
        if let Some(entry) = self.routes.lock().unwrap().get_mut(app_name) {
            for addr in addresses {
                entry.remove(addr);
            }
        }
        Ok(())
    }

    fn supports_custom_healthcheck(&self) -> bool {
        self.custom_healthcheck
    }

    async fn set_healthcheck(
        &self,
        app_name: &str,
        spec: Option<HealthcheckSpec>,
    ) -> anyhow::Result<()> {
        self.healthchecks
            .lock()
            .unwrap()
            .insert(app_name.to_string(), spec);
        Ok(())
    }

    async fn rebuild_routes(&self, app: &App) -> anyhow::Result<()> {
        self.rebuilt.lock().unwrap().push(app.name.clone());
        Ok(())
    }
}

// ── App service ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeApps {
    apps: Mutex<HashMap<String, App>>,
    pub bound: Mutex<Vec<String>>,
    pub unbound: Mutex<Vec<String>>,
    locks: Mutex<HashMap<String, (String, String)>>,
    refuse_lock: Mutex<bool>,
    fail_bind: Mutex<bool>,
}

impl FakeApps {
    pub fn with_apps(apps: impl IntoIterator<Item = App>) -> Self {
        let service = Self::default();
        {
            let mut map = service.apps.lock().unwrap();
            for app in apps {
                map.insert(app.name.clone(), app);
            }
        }
        service
    }

    pub fn refuse_locks(&self) {
        *self.refuse_lock.lock().unwrap() = true;
    }

    /// Every `bind_unit` call fails from now on.
    pub fn fail_binds(&self) {
        *self.fail_bind.lock().unwrap() = true;
    }

    pub fn lock_held(&self, app_name: &str) -> bool {
        self.locks.lock().unwrap().contains_key(app_name)
    }
}

#[async_trait]
impl AppService for FakeApps {
    async fn app(&self, name: &str) -> anyhow::Result<App> {
        self.apps
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("app {name} not found"))
    }

    async fn bind_unit(&self, _app: &App, container: &Container) -> anyhow::Result<()> {
        if *self.fail_bind.lock().unwrap() {
            anyhow::bail!("bind of {} failed", container.name);
        }
        self.bound.lock().unwrap().push(container.name.clone());
        Ok(())
    }

    async fn unbind_unit(&self, _app: &App, container: &Container) -> anyhow::Result<()> {
        self.unbound.lock().unwrap().push(container.name.clone());
        Ok(())
    }

    async fn acquire_lock(
        &self,
        app_name: &str,
        owner: &str,
        reason: &str,
    ) -> anyhow::Result<bool> {
        if *self.refuse_lock.lock().unwrap() {
            return Ok(false);
        }
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(app_name) {
            return Ok(false);
        }
        locks.insert(
            app_name.to_string(),
            (owner.to_string(), reason.to_string()),
        );
        Ok(true)
    }

    async fn release_lock(&self, app_name: &str) -> anyhow::Result<()> {
        self.locks.lock().unwrap().remove(app_name);
        Ok(())
    }
}

// ── IaaS & queue ───────────────────────────────────────────────────

/// Produces machines at `base-N` addresses (or a fixed address).
#[derive(Default)]
pub struct FakeIaas {
    next: AtomicU64,
    fixed_address: Mutex<Option<String>>,
    pub machines: Mutex<HashMap<String, Machine>>,
    fail_create: Mutex<bool>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeIaas {
    /// Every created machine gets this exact address.
    pub fn with_fixed_address(address: &str) -> Self {
        Self {
            fixed_address: Mutex::new(Some(address.to_string())),
            ..Self::default()
        }
    }

    pub fn fail_creations(&self) {
        *self.fail_create.lock().unwrap() = true;
    }
}

#[async_trait]
impl Iaas for FakeIaas {
    async fn create_machine(
        &self,
        _metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<Machine> {
        if *self.fail_create.lock().unwrap() {
            anyhow::bail!("iaas create failed");
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let address = match self.fixed_address.lock().unwrap().clone() {
            Some(addr) => addr,
            None => format!("http://m{n}.example.com:2375"),
        };
        let machine = Machine {
            id: format!("machine-{n}"),
            address,
        };
        self.machines
            .lock()
            .unwrap()
            .insert(machine.id.clone(), machine.clone());
        Ok(machine)
    }

    async fn delete_machine(&self, id: &str) -> anyhow::Result<()> {
        self.machines.lock().unwrap().remove(id);
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn find_machine_by_address(&self, address: &str) -> anyhow::Result<Option<Machine>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .find(|m| m.address == address)
            .cloned())
    }
}

#[derive(Default)]
pub struct FakeQueue {
    pub bootstrapped: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl FakeQueue {
    pub fn fail_bootstraps(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl WorkQueue for FakeQueue {
    async fn bootstrap_node(&self, address: &str, _timeout: Duration) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("bootstrap of {address} failed");
        }
        self.bootstrapped.lock().unwrap().push(address.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[tokio::test]
    async fn registry_rejects_duplicates() {
        let registry = InMemoryRegistry::default();
        registry.register(Node::new("http://h1:2375", "p1")).await.unwrap();
        assert!(registry.register(Node::new("http://h1:2375", "p1")).await.is_err());
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn runtime_lifecycle() {
        let runtime = FakeRuntime::default();
        let spec = ContainerSpec {
            name: "app-x".to_string(),
            image: "img:v1".to_string(),
            app_name: "app".to_string(),
            process_name: "web".to_string(),
            memory: 0,
            exposed_port: "8888/tcp".to_string(),
        };
        let id = runtime.create_container("h1", &spec).await.unwrap();
        assert!(id.len() > 10);

        runtime.start_container("h1", &id).await.unwrap();
        let inspected = runtime.inspect_container("h1", &id).await.unwrap();
        assert!(inspected.running);

        runtime.fail_once("start");
        assert!(runtime.start_container("h1", &id).await.is_err());
        runtime.start_container("h1", &id).await.unwrap();
    }

    #[tokio::test]
    async fn router_partial_failure() {
        let router = FakeRouter::default();
        router.fail_add_after(1);
        let addrs = vec!["http://a:1".to_string(), "http://b:1".to_string()];
        assert!(router.add_routes("app", &addrs).await.is_err());
        // First address landed before the failure.
        assert_eq!(router.routes_for("app"), vec!["http://a:1".to_string()]);
    }

    #[tokio::test]
    async fn app_lock_is_exclusive() {
        let apps = FakeApps::default();
        assert!(apps.acquire_lock("a", "internal", "move").await.unwrap());
        assert!(!apps.acquire_lock("a", "internal", "move").await.unwrap());
        apps.release_lock("a").await.unwrap();
        assert!(apps.acquire_lock("a", "internal", "move").await.unwrap());
    }
}
