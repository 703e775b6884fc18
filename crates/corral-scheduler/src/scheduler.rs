//! Placement and victim selection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use corral_cluster::{App, AppService, Node};
use corral_state::{Container, StateStore};

use crate::error::{SchedulerError, SchedulerResult};

/// Spreading a single app+process across hosts strictly dominates
/// global balance in the placement score.
const APP_COUNT_WEIGHT: usize = 10_000;

/// Static scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOpts {
    /// Fraction of a node's total memory that may be reserved by
    /// container plans; 0 disables the memory filter.
    pub max_memory_ratio: f32,
    /// Node metadata key holding total memory in bytes; empty disables
    /// the memory filter.
    pub total_memory_metadata: String,
}

/// Per-call placement options.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOpts {
    /// Name of an already-inserted repository row to pin to the chosen
    /// host atomically.
    pub update_name: Option<String>,
}

pub struct Scheduler {
    store: StateStore,
    apps: Arc<dyn AppService>,
    opts: SchedulerOpts,
    /// Container ids excluded from load counts; set on rebalance clones
    /// so in-flight moves don't distort scores.
    ignored: HashSet<String>,
    /// Serializes placement so concurrent schedules observe each
    /// other's repository updates.
    place_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: StateStore, apps: Arc<dyn AppService>, opts: SchedulerOpts) -> Self {
        Self {
            store,
            apps,
            opts,
            ignored: HashSet::new(),
            place_lock: Mutex::new(()),
        }
    }

    /// A scheduler over the same store that excludes the given
    /// container ids from every count.
    pub fn with_ignored(&self, ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            store: self.store.clone(),
            apps: self.apps.clone(),
            opts: self.opts.clone(),
            ignored: ids.into_iter().collect(),
            place_lock: Mutex::new(()),
        }
    }

    /// A scheduler with the same configuration over a different store
    /// (dry-run snapshots).
    pub fn over_store(&self, store: StateStore) -> Self {
        Self {
            store,
            apps: self.apps.clone(),
            opts: self.opts.clone(),
            ignored: self.ignored.clone(),
            place_lock: Mutex::new(()),
        }
    }

    /// Pick the host for a new container of `app`+`process` among the
    /// pool-filtered candidates.
    pub async fn schedule(
        &self,
        app: &App,
        process: &str,
        opts: &ScheduleOpts,
        nodes: &[Node],
    ) -> SchedulerResult<Node> {
        if app.name.is_empty() {
            return Err(SchedulerError::InvalidInput("empty app name".to_string()));
        }
        if nodes.is_empty() {
            return Err(SchedulerError::NoNodes);
        }
        let _guard = self.place_lock.lock().await;

        let candidates = self.filter_by_memory(app, nodes).await?;
        let chosen = self.min_score_node(app, process, &candidates)?;
        debug!(app = %app.name, process, host = chosen.host(), "scheduled");

        if let Some(name) = &opts.update_name {
            self.store.set_container_host(name, chosen.host())?;
        }
        Ok(chosen)
    }

    /// Pick the container to remove for `app`+`process`: a container on
    /// the most loaded host, falling back to any host still running one.
    pub async fn removable_container(
        &self,
        app: &App,
        process: &str,
        nodes: &[Node],
    ) -> SchedulerResult<Container> {
        if nodes.is_empty() {
            return Err(SchedulerError::NoNodes);
        }
        let _guard = self.place_lock.lock().await;

        let scores = self.host_scores(&app.name, process, nodes)?;
        let victim_host = scores
            .iter()
            .max_by_key(|(_, score)| *score)
            .map(|(host, _)| host.clone())
            .ok_or(SchedulerError::NoNodes)?;

        let on_host = self
            .store
            .containers_by_app_process(&app.name, process)?
            .into_iter()
            .filter(|c| !self.ignored.contains(&c.id))
            .collect::<Vec<_>>();
        on_host
            .iter()
            .find(|c| c.host_addr == victim_host)
            .or_else(|| on_host.first())
            .cloned()
            .ok_or_else(|| SchedulerError::NoVictim {
                app: app.name.clone(),
                process: process.to_string(),
            })
    }

    /// The least loaded host overall, ignoring app affinity. Used when
    /// draining nodes without an app context.
    pub async fn any_node(&self, nodes: &[Node]) -> SchedulerResult<Node> {
        if nodes.is_empty() {
            return Err(SchedulerError::NoNodes);
        }
        let hosts: Vec<String> = nodes.iter().map(|n| n.host().to_string()).collect();
        let counts = self.store.count_containers_by_host(&hosts, &self.ignored)?;
        let chosen = nodes
            .iter()
            .min_by_key(|n| counts.get(n.host()).copied().unwrap_or(0))
            .ok_or(SchedulerError::NoNodes)?;
        Ok(chosen.clone())
    }

    fn min_score_node(
        &self,
        app: &App,
        process: &str,
        nodes: &[Node],
    ) -> SchedulerResult<Node> {
        let scores = self.host_scores(&app.name, process, nodes)?;
        // Ties resolve to the first candidate in iteration order.
        let mut best: Option<(&Node, usize)> = None;
        for node in nodes {
            let Some(score) = scores.get(node.host()).copied() else {
                continue;
            };
            if best.is_none_or(|(_, s)| score < s) {
                best = Some((node, score));
            }
        }
        best.map(|(n, _)| n.clone()).ok_or(SchedulerError::NoNodes)
    }

    fn host_scores(
        &self,
        app_name: &str,
        process: &str,
        nodes: &[Node],
    ) -> SchedulerResult<HashMap<String, usize>> {
        let hosts: Vec<String> = nodes.iter().map(|n| n.host().to_string()).collect();
        let host_counts = self.store.count_containers_by_host(&hosts, &self.ignored)?;
        let app_counts =
            self.store
                .count_app_process_by_host(&hosts, app_name, process, &self.ignored)?;
        Ok(hosts
            .into_iter()
            .map(|host| {
                let score = app_counts.get(&host).copied().unwrap_or(0) * APP_COUNT_WEIGHT
                    + host_counts.get(&host).copied().unwrap_or(0);
                (host, score)
            })
            .collect())
    }

    /// Drop nodes whose reserved memory plus the app's plan would
    /// exceed `total × ratio`. Never fails when a pool's autoscale rule
    /// is enabled: capacity is coming, so placement proceeds anywhere.
    async fn filter_by_memory<'a>(
        &self,
        app: &App,
        nodes: &'a [Node],
    ) -> SchedulerResult<Vec<Node>> {
        if self.opts.max_memory_ratio == 0.0 || self.opts.total_memory_metadata.is_empty() {
            return Ok(nodes.to_vec());
        }
        let mut plan_cache: HashMap<String, u64> = HashMap::new();
        plan_cache.insert(app.name.clone(), app.plan_memory);

        let mut fitting = Vec::new();
        for node in nodes {
            let Some(total) = node
                .metadata
                .get(&self.opts.total_memory_metadata)
                .and_then(|v| v.parse::<u64>().ok())
            else {
                // Nodes without the metadata are not memory-managed.
                fitting.push(node.clone());
                continue;
            };
            let mut reserved: u64 = 0;
            for cont in self.store.containers_by_host(node.host())? {
                if self.ignored.contains(&cont.id) {
                    continue;
                }
                let memory = match plan_cache.get(&cont.app_name) {
                    Some(m) => *m,
                    None => {
                        let m = self
                            .apps
                            .app(&cont.app_name)
                            .await
                            .map(|a| a.plan_memory)
                            .unwrap_or(0);
                        plan_cache.insert(cont.app_name.clone(), m);
                        m
                    }
                };
                reserved += memory;
            }
            let limit = (total as f64 * self.opts.max_memory_ratio as f64) as u64;
            if reserved + app.plan_memory <= limit {
                fitting.push(node.clone());
            }
        }
        if !fitting.is_empty() {
            return Ok(fitting);
        }
        let needed_mb = app.plan_memory as f64 / (1024.0 * 1024.0);
        if self.pool_autoscale_enabled(&app.pool)? {
            warn!(
                app = %app.name,
                pool = %app.pool,
                %needed_mb,
                "no node with enough memory, ignoring memory restrictions"
            );
            return Ok(nodes.to_vec());
        }
        Err(SchedulerError::NoMemory {
            app: app.name.clone(),
            needed_mb,
        })
    }

    fn pool_autoscale_enabled(&self, pool: &str) -> SchedulerResult<bool> {
        let rule = match self.store.autoscale_rule(pool)? {
            Some(rule) => Some(rule),
            None => self.store.autoscale_rule("")?,
        };
        Ok(rule.is_some_and(|r| r.enabled))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use corral_cluster::testing::FakeApps;
    use corral_state::{AutoScaleRule, ContainerStatus};

    use super::*;

    fn app(name: &str, pool: &str, memory: u64) -> App {
        App {
            name: name.to_string(),
            platform: "python".to_string(),
            pool: pool.to_string(),
            plan_memory: memory,
            deploys: 1,
            healthcheck: None,
            restart_after_hooks: Vec::new(),
        }
    }

    fn scheduler_with(apps: Vec<App>, opts: SchedulerOpts) -> Scheduler {
        let store = StateStore::open_in_memory().unwrap();
        Scheduler::new(store, Arc::new(FakeApps::with_apps(apps)), opts)
    }

    fn place(store: &StateStore, name: &str, id: &str, app: &str, process: &str, host: &str) {
        store
            .insert_container(&Container {
                id: id.to_string(),
                name: name.to_string(),
                app_name: app.to_string(),
                process_name: process.to_string(),
                platform: "python".to_string(),
                image: String::new(),
                building_image: String::new(),
                host_addr: host.to_string(),
                host_port: "49000".to_string(),
                exposed_port: String::new(),
                ip: String::new(),
                status: ContainerStatus::Started,
                status_updated_at: 0,
                last_success_status_update: None,
                routable: false,
            })
            .unwrap();
    }

    fn nodes(hosts: &[&str]) -> Vec<Node> {
        hosts
            .iter()
            .map(|h| Node::new(format!("http://{h}:2375"), "pool1"))
            .collect()
    }

    #[tokio::test]
    async fn schedule_spreads_app_process_across_hosts() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a.clone()], SchedulerOpts::default());
        let candidates = nodes(&["h1", "h2", "h3"]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..9 {
            let node = sched
                .schedule(&a, "web", &ScheduleOpts::default(), &candidates)
                .await
                .unwrap();
            place(
                &sched.store,
                &format!("myapp-{i}"),
                &format!("id{i}"),
                "myapp",
                "web",
                node.host(),
            );
            *counts.entry(node.host().to_string()).or_insert(0) += 1;
        }
        // 9 placements over 3 hosts land evenly.
        assert_eq!(counts["h1"], 3);
        assert_eq!(counts["h2"], 3);
        assert_eq!(counts["h3"], 3);
    }

    #[tokio::test]
    async fn tie_breaks_by_total_host_load() {
        let a = app("myapp", "pool1", 0);
        let b = app("other", "pool1", 0);
        let sched = scheduler_with(vec![a.clone(), b], SchedulerOpts::default());
        // Equal myapp counts, but h1 carries an extra app.
        place(&sched.store, "other-1", "o1", "other", "web", "h1");

        let node = sched
            .schedule(&a, "web", &ScheduleOpts::default(), &nodes(&["h1", "h2"]))
            .await
            .unwrap();
        assert_eq!(node.host(), "h2");
    }

    #[tokio::test]
    async fn app_spread_dominates_total_load() {
        let a = app("myapp", "pool1", 0);
        let b = app("other", "pool1", 0);
        let sched = scheduler_with(vec![a.clone(), b], SchedulerOpts::default());
        // h2 is globally busier, but h1 already runs this app+process.
        place(&sched.store, "myapp-1", "m1", "myapp", "web", "h1");
        for i in 0..5 {
            place(
                &sched.store,
                &format!("other-{i}"),
                &format!("o{i}"),
                "other",
                "web",
                "h2",
            );
        }
        let node = sched
            .schedule(&a, "web", &ScheduleOpts::default(), &nodes(&["h1", "h2"]))
            .await
            .unwrap();
        assert_eq!(node.host(), "h2");
    }

    #[tokio::test]
    async fn ignored_containers_do_not_count() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a.clone()], SchedulerOpts::default());
        place(&sched.store, "myapp-1", "m1", "myapp", "web", "h1");
        place(&sched.store, "myapp-2", "m2", "myapp", "web", "h1");

        // Without the ignore set h2 wins; ignoring h1's containers
        // makes the hosts equal and the first candidate wins.
        let clone = sched.with_ignored(["m1".to_string(), "m2".to_string()]);
        let node = clone
            .schedule(&a, "web", &ScheduleOpts::default(), &nodes(&["h1", "h2"]))
            .await
            .unwrap();
        assert_eq!(node.host(), "h1");
    }

    #[tokio::test]
    async fn schedule_updates_named_row() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a.clone()], SchedulerOpts::default());
        place(&sched.store, "myapp-new", "m1", "myapp", "web", "");

        let opts = ScheduleOpts {
            update_name: Some("myapp-new".to_string()),
        };
        let node = sched
            .schedule(&a, "web", &opts, &nodes(&["h1"]))
            .await
            .unwrap();
        let stored = sched.store.container_by_name("myapp-new").unwrap().unwrap();
        assert_eq!(stored.host_addr, node.host());
    }

    #[tokio::test]
    async fn empty_candidates_fail() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a.clone()], SchedulerOpts::default());
        assert!(matches!(
            sched.schedule(&a, "web", &ScheduleOpts::default(), &[]).await,
            Err(SchedulerError::NoNodes)
        ));
    }

    fn memory_node(host: &str, total: u64) -> Node {
        let mut node = Node::new(format!("http://{host}:2375"), "pool1");
        node.metadata
            .insert("totalMemory".to_string(), total.to_string());
        node
    }

    fn memory_opts() -> SchedulerOpts {
        SchedulerOpts {
            max_memory_ratio: 0.8,
            total_memory_metadata: "totalMemory".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_filter_excludes_full_nodes() {
        let a = app("myapp", "pool1", 512);
        let sched = scheduler_with(vec![a.clone()], memory_opts());
        // h1: total 1000, limit 800, already holds 512 of myapp.
        place(&sched.store, "myapp-1", "m1", "myapp", "web", "h1");

        let candidates = vec![memory_node("h1", 1000), memory_node("h2", 1000)];
        let node = sched
            .schedule(&a, "web", &ScheduleOpts::default(), &candidates)
            .await
            .unwrap();
        assert_eq!(node.host(), "h2");
    }

    #[tokio::test]
    async fn memory_exhaustion_errors_without_autoscale() {
        let a = app("myapp", "pool1", 900);
        let sched = scheduler_with(vec![a.clone()], memory_opts());
        let candidates = vec![memory_node("h1", 1000)];
        assert!(matches!(
            sched.schedule(&a, "web", &ScheduleOpts::default(), &candidates).await,
            Err(SchedulerError::NoMemory { .. })
        ));
    }

    #[tokio::test]
    async fn memory_exhaustion_falls_back_when_autoscale_enabled() {
        let a = app("myapp", "pool1", 900);
        let sched = scheduler_with(vec![a.clone()], memory_opts());
        sched
            .store
            .upsert_autoscale_rule(&AutoScaleRule {
                pool: "pool1".to_string(),
                enabled: true,
                ..AutoScaleRule::default()
            })
            .unwrap();
        let candidates = vec![memory_node("h1", 1000)];
        let node = sched
            .schedule(&a, "web", &ScheduleOpts::default(), &candidates)
            .await
            .unwrap();
        assert_eq!(node.host(), "h1");
    }

    #[tokio::test]
    async fn nodes_without_memory_metadata_always_fit() {
        let a = app("myapp", "pool1", 900);
        let sched = scheduler_with(vec![a.clone()], memory_opts());
        let mut bare = Node::new("http://h1:2375", "pool1");
        bare.metadata = BTreeMap::from([("pool".to_string(), "pool1".to_string())]);
        let node = sched
            .schedule(&a, "web", &ScheduleOpts::default(), &[bare])
            .await
            .unwrap();
        assert_eq!(node.host(), "h1");
    }

    #[tokio::test]
    async fn victim_comes_from_most_loaded_host() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a.clone()], SchedulerOpts::default());
        place(&sched.store, "myapp-1", "m1", "myapp", "web", "h1");
        place(&sched.store, "myapp-2", "m2", "myapp", "web", "h1");
        place(&sched.store, "myapp-3", "m3", "myapp", "web", "h2");

        let victim = sched
            .removable_container(&a, "web", &nodes(&["h1", "h2"]))
            .await
            .unwrap();
        assert_eq!(victim.host_addr, "h1");
    }

    #[tokio::test]
    async fn victim_falls_back_off_max_host() {
        let a = app("myapp", "pool1", 0);
        let b = app("other", "pool1", 0);
        let sched = scheduler_with(vec![a.clone(), b], SchedulerOpts::default());
        // h1 is most loaded, but only h2 runs myapp.
        place(&sched.store, "other-1", "o1", "other", "web", "h1");
        place(&sched.store, "other-2", "o2", "other", "web", "h1");
        place(&sched.store, "myapp-1", "m1", "myapp", "web", "h2");

        let victim = sched
            .removable_container(&a, "web", &nodes(&["h1", "h2"]))
            .await
            .unwrap();
        assert_eq!(victim.name, "myapp-1");
    }

    #[tokio::test]
    async fn no_victim_when_app_has_no_containers() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a.clone()], SchedulerOpts::default());
        assert!(matches!(
            sched.removable_container(&a, "web", &nodes(&["h1"])).await,
            Err(SchedulerError::NoVictim { .. })
        ));
    }

    #[tokio::test]
    async fn any_node_picks_least_loaded() {
        let a = app("myapp", "pool1", 0);
        let sched = scheduler_with(vec![a], SchedulerOpts::default());
        place(&sched.store, "myapp-1", "m1", "myapp", "web", "h1");
        let node = sched.any_node(&nodes(&["h1", "h2"])).await.unwrap();
        assert_eq!(node.host(), "h2");
    }
}
