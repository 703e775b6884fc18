//! StateStore — redb-backed persistence for the corral orchestrator.
//!
//! Provides the container repository (CRUD plus the fleet queries the
//! scheduler and healers run), per-app image records with an atomic
//! version counter, the healing event log, and autoscale rules/events.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing and dry-run rebalance snapshots).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Clone containers and image records into a fresh in-memory store.
    ///
    /// Used by dry-run rebalance: moves are simulated against the snapshot
    /// while the real collection stays untouched.
    pub fn snapshot(&self) -> StateResult<StateStore> {
        let copy = StateStore::open_in_memory()?;
        for cont in self.list_containers()? {
            copy.insert_container(&cont)?;
        }
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ImageRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            copy.put_image_record(&record)?;
        }
        Ok(copy)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        txn.open_table(IMAGES).map_err(map_err!(Table))?;
        txn.open_table(HEALING_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(AUTOSCALE_RULES).map_err(map_err!(Table))?;
        txn.open_table(AUTOSCALE_EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Insert a new container record. Fails if the name is taken.
    pub fn insert_container(&self, cont: &Container) -> StateResult<()> {
        let value = serde_json::to_vec(cont).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let exists = table
                .get(cont.name.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StateError::Conflict(format!(
                    "container {:?}",
                    cont.name
                )));
            }
            table
                .insert(cont.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %cont.name, app = %cont.app_name, "container stored");
        Ok(())
    }

    /// Replace the full container record for `cont.name`.
    pub fn update_container(&self, cont: &Container) -> StateResult<()> {
        self.modify_container(&cont.name, |stored| *stored = cont.clone())
            .map(|_| ())
    }

    /// Atomically read-modify-write the container with the given name.
    pub fn modify_container(
        &self,
        name: &str,
        apply: impl FnOnce(&mut Container),
    ) -> StateResult<Container> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let mut cont: Container = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("container {name:?}"))),
            };
            apply(&mut cont);
            if cont.name != name {
                table.remove(name).map_err(map_err!(Write))?;
            }
            let value = serde_json::to_vec(&cont).map_err(map_err!(Serialize))?;
            table
                .insert(cont.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            updated = cont;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Partial update: set the runtime id.
    pub fn set_container_id(&self, name: &str, id: &str) -> StateResult<()> {
        self.modify_container(name, |c| c.id = id.to_string())?;
        Ok(())
    }

    /// Partial update: set the placement host.
    pub fn set_container_host(&self, name: &str, host_addr: &str) -> StateResult<()> {
        self.modify_container(name, |c| c.host_addr = host_addr.to_string())?;
        Ok(())
    }

    /// Partial update: status transition, stamping the update time and
    /// optionally the last-success time.
    pub fn set_container_status(
        &self,
        name: &str,
        status: ContainerStatus,
        success: bool,
    ) -> StateResult<Container> {
        let now = epoch_secs();
        self.modify_container(name, |c| {
            c.status = status;
            c.status_updated_at = now;
            if success {
                c.last_success_status_update = Some(now);
            }
        })
    }

    /// Delete a container record by name. Returns true if it existed.
    pub fn delete_container(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Get a container by its unique name.
    pub fn container_by_name(&self, name: &str) -> StateResult<Option<Container>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Find a container by a runtime-id prefix. A unique match on any
    /// prefix resolves; more than one match is an error.
    pub fn container_by_id_prefix(&self, prefix: &str) -> StateResult<Container> {
        if prefix.is_empty() {
            return Err(StateError::NotFound("container with empty id".to_string()));
        }
        let mut found: Option<Container> = None;
        for cont in self.list_containers()? {
            if cont.id.starts_with(prefix) {
                if found.is_some() {
                    return Err(StateError::AmbiguousContainerId(prefix.to_string()));
                }
                found = Some(cont);
            }
        }
        found.ok_or_else(|| StateError::NotFound(format!("container {prefix:?}")))
    }

    /// List every container record.
    pub fn list_containers(&self) -> StateResult<Vec<Container>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let cont: Container =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(cont);
        }
        Ok(results)
    }

    /// Containers placed on the given host.
    pub fn containers_by_host(&self, host_addr: &str) -> StateResult<Vec<Container>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.host_addr == host_addr)
            .collect())
    }

    /// Containers owned by an app.
    pub fn containers_by_app(&self, app_name: &str) -> StateResult<Vec<Container>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.app_name == app_name)
            .collect())
    }

    /// Containers for a process within an app. An empty process matches
    /// containers whose process is empty or missing.
    pub fn containers_by_app_process(
        &self,
        app_name: &str,
        process: &str,
    ) -> StateResult<Vec<Container>> {
        Ok(self
            .containers_by_app(app_name)?
            .into_iter()
            .filter(|c| c.process_name == process)
            .collect())
    }

    /// Containers matching the given app and host filters. Empty filters
    /// match everything.
    pub fn containers_by_apps_and_hosts(
        &self,
        apps: &[String],
        hosts: &[String],
    ) -> StateResult<Vec<Container>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| apps.is_empty() || apps.iter().any(|a| *a == c.app_name))
            .filter(|c| hosts.is_empty() || hosts.iter().any(|h| *h == c.host_addr))
            .collect())
    }

    /// Runnable containers on a host (status not created/building/stopped).
    pub fn running_containers_by_host(&self, host_addr: &str) -> StateResult<Vec<Container>> {
        Ok(self
            .containers_by_host(host_addr)?
            .into_iter()
            .filter(Container::is_runnable)
            .collect())
    }

    /// Containers that look dead: last success older than the threshold,
    /// placed and identified, and not in a status where silence is normal.
    pub fn unresponsive_containers(
        &self,
        max_unresponsive_secs: u64,
        now: u64,
    ) -> StateResult<Vec<Container>> {
        let cutoff = now.saturating_sub(max_unresponsive_secs);
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| !c.id.is_empty() && !c.app_name.is_empty())
            .filter(|c| !c.host_port.is_empty() || !c.process_name.is_empty())
            .filter(|c| {
                !matches!(
                    c.status,
                    ContainerStatus::Building | ContainerStatus::Asleep | ContainerStatus::Stopped
                )
            })
            .filter(|c| matches!(c.last_success_status_update, Some(t) if t < cutoff))
            .collect())
    }

    /// Count containers per host, skipping ignored ids.
    pub fn count_containers_by_host(
        &self,
        hosts: &[String],
        ignored_ids: &HashSet<String>,
    ) -> StateResult<HashMap<String, usize>> {
        self.aggregate_by_host(hosts, ignored_ids, |_| true)
    }

    /// Count containers per host for one app+process, skipping ignored
    /// ids. An empty process matches containers with an empty process.
    pub fn count_app_process_by_host(
        &self,
        hosts: &[String],
        app_name: &str,
        process: &str,
        ignored_ids: &HashSet<String>,
    ) -> StateResult<HashMap<String, usize>> {
        self.aggregate_by_host(hosts, ignored_ids, |c| {
            c.app_name == app_name && c.process_name == process
        })
    }

    fn aggregate_by_host(
        &self,
        hosts: &[String],
        ignored_ids: &HashSet<String>,
        matches: impl Fn(&Container) -> bool,
    ) -> StateResult<HashMap<String, usize>> {
        let mut counts: HashMap<String, usize> =
            hosts.iter().map(|h| (h.clone(), 0)).collect();
        for cont in self.list_containers()? {
            if ignored_ids.contains(&cont.id) || !matches(&cont) {
                continue;
            }
            if let Some(count) = counts.get_mut(&cont.host_addr) {
                *count += 1;
            }
        }
        Ok(counts)
    }

    // ── Image records ──────────────────────────────────────────────

    /// Store a full image record (used by snapshotting and tests).
    pub fn put_image_record(&self, record: &ImageRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            table
                .insert(record.app_name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the image record for an app.
    pub fn image_record(&self, app_name: &str) -> StateResult<Option<ImageRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        match table.get(app_name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Atomically increment and return the app's image version counter.
    pub fn next_image_version(&self, app_name: &str) -> StateResult<u64> {
        let mut version = 0;
        self.modify_image_record(app_name, |record| {
            record.count += 1;
            version = record.count;
        })?;
        Ok(version)
    }

    /// Record an image name as current: any prior occurrence is removed
    /// first, so re-promoting an image moves it to the end.
    pub fn append_image_name(&self, app_name: &str, image: &str) -> StateResult<()> {
        self.modify_image_record(app_name, |record| {
            record.images.retain(|img| img != image);
            record.images.push(image.to_string());
        })
    }

    /// The app's current image: the last entry of its image list.
    pub fn current_image(&self, app_name: &str) -> StateResult<Option<String>> {
        Ok(self
            .image_record(app_name)?
            .and_then(|r| r.images.last().cloned()))
    }

    /// Drop image names beyond the history window, oldest first, and
    /// return them so the caller can remove the backing artifacts.
    pub fn prune_images(&self, app_name: &str, keep: usize) -> StateResult<Vec<String>> {
        let mut removed = Vec::new();
        self.modify_image_record(app_name, |record| {
            while record.images.len() > keep {
                removed.push(record.images.remove(0));
            }
        })?;
        Ok(removed)
    }

    /// Delete the whole image record for an app. Returns true if present.
    pub fn delete_image_record(&self, app_name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            existed = table.remove(app_name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn modify_image_record(
        &self,
        app_name: &str,
        apply: impl FnOnce(&mut ImageRecord),
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            let mut record: ImageRecord = match table.get(app_name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => ImageRecord {
                    app_name: app_name.to_string(),
                    ..ImageRecord::default()
                },
            };
            apply(&mut record);
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(app_name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Healing events ─────────────────────────────────────────────

    /// Append a healing event (or overwrite it with its "end" update).
    pub fn put_healing_event(&self, event: &HealingEvent) -> StateResult<()> {
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HEALING_EVENTS).map_err(map_err!(Table))?;
            table
                .insert(event.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a healing event by id.
    pub fn healing_event(&self, id: &str) -> StateResult<Option<HealingEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HEALING_EVENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Healing history, newest first, optionally filtered by kind.
    pub fn list_healing_events(
        &self,
        kind: Option<HealingKind>,
    ) -> StateResult<Vec<HealingEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HEALING_EVENTS).map_err(map_err!(Table))?;
        let mut events = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: HealingEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if kind.is_none() || kind == Some(event.kind) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(events)
    }

    /// Count consecutive healings in the lineage ending at `lineage_id`.
    ///
    /// Walks the chain newest to oldest: an event whose created entity is
    /// the current id precedes it, and that event's failing entity is the
    /// previous link. Only events inside the window count, and the walk
    /// stops after 10 links.
    pub fn healing_count_for(
        &self,
        kind: HealingKind,
        lineage_id: &str,
        window_secs: u64,
        now: u64,
    ) -> StateResult<usize> {
        const MAX_COUNT: usize = 10;
        let cutoff = now.saturating_sub(window_secs);
        let events = self.list_healing_events(Some(kind))?;
        let mut count = 0;
        let mut current = lineage_id.to_string();
        while count < MAX_COUNT {
            let previous = events.iter().find(|e| {
                e.started_at >= cutoff
                    && e.created
                        .as_ref()
                        .is_some_and(|c| c.lineage_id() == current)
            });
            match previous {
                Some(event) => {
                    count += 1;
                    current = event.failing.lineage_id().to_string();
                }
                None => break,
            }
        }
        Ok(count)
    }

    // ── Autoscale rules & events ───────────────────────────────────

    /// Insert or update an autoscale rule.
    pub fn upsert_autoscale_rule(&self, rule: &AutoScaleRule) -> StateResult<()> {
        rule.validate().map_err(StateError::Write)?;
        let value = serde_json::to_vec(rule).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AUTOSCALE_RULES).map_err(map_err!(Table))?;
            table
                .insert(rule.pool.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The rule stored for an exact pool name (no default fallback).
    pub fn autoscale_rule(&self, pool: &str) -> StateResult<Option<AutoScaleRule>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUTOSCALE_RULES).map_err(map_err!(Table))?;
        match table.get(pool).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    /// Open an exclusive autoscale event for a pool. Fails with
    /// `EventLocked` while a previous event is still running.
    pub fn try_start_autoscale_event(&self, pool: &str) -> StateResult<AutoScaleEvent> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let event;
        {
            let mut table = txn.open_table(AUTOSCALE_EVENTS).map_err(map_err!(Table))?;
            if let Some(guard) = table.get(pool).map_err(map_err!(Read))? {
                let existing: AutoScaleEvent =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                if existing.running {
                    return Err(StateError::EventLocked(pool.to_string()));
                }
            }
            event = AutoScaleEvent {
                pool: pool.to_string(),
                running: true,
                started_at: epoch_secs(),
                finished_at: None,
                action: AutoScaleAction::NoOp,
                reason: String::new(),
                successful: false,
                error: String::new(),
                nodes: Vec::new(),
            };
            let value = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
            table
                .insert(pool, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(event)
    }

    /// Close an autoscale event, releasing the pool guard.
    pub fn finish_autoscale_event(&self, mut event: AutoScaleEvent) -> StateResult<()> {
        event.running = false;
        event.finished_at = Some(epoch_secs());
        let value = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AUTOSCALE_EVENTS).map_err(map_err!(Table))?;
            table
                .insert(event.pool.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The latest autoscale event for a pool.
    pub fn autoscale_event(&self, pool: &str) -> StateResult<Option<AutoScaleEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUTOSCALE_EVENTS).map_err(map_err!(Table))?;
        match table.get(pool).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn cont(name: &str, id: &str, app: &str, process: &str, host: &str) -> Container {
        Container {
            id: id.to_string(),
            name: name.to_string(),
            app_name: app.to_string(),
            process_name: process.to_string(),
            platform: "python".to_string(),
            image: format!("corral/app-{app}:v1"),
            building_image: String::new(),
            host_addr: host.to_string(),
            host_port: "49000".to_string(),
            exposed_port: "8888/tcp".to_string(),
            ip: "172.17.0.2".to_string(),
            status: ContainerStatus::Started,
            status_updated_at: 1000,
            last_success_status_update: Some(1000),
            routable: false,
        }
    }

    #[test]
    fn container_crud_roundtrip() {
        let store = test_store();
        let c = cont("app-x1", "id1", "app", "web", "h1");
        store.insert_container(&c).unwrap();
        assert_eq!(store.container_by_name("app-x1").unwrap(), Some(c.clone()));

        // Duplicate name rejected.
        assert!(matches!(
            store.insert_container(&c),
            Err(StateError::Conflict(_))
        ));

        store.set_container_id("app-x1", "id-new").unwrap();
        store.set_container_host("app-x1", "h2").unwrap();
        let got = store.container_by_name("app-x1").unwrap().unwrap();
        assert_eq!(got.id, "id-new");
        assert_eq!(got.host_addr, "h2");

        assert!(store.delete_container("app-x1").unwrap());
        assert!(!store.delete_container("app-x1").unwrap());
    }

    #[test]
    fn modify_container_can_rename() {
        let store = test_store();
        store
            .insert_container(&cont("app-old", "id1", "app", "web", "h1"))
            .unwrap();
        store
            .modify_container("app-old", |c| c.name = "app-new".to_string())
            .unwrap();
        assert!(store.container_by_name("app-old").unwrap().is_none());
        assert!(store.container_by_name("app-new").unwrap().is_some());
    }

    #[test]
    fn id_prefix_lookup() {
        let store = test_store();
        store
            .insert_container(&cont("a-1", "abcdef", "a", "web", "h1"))
            .unwrap();
        store
            .insert_container(&cont("a-2", "abc123", "a", "web", "h1"))
            .unwrap();

        assert_eq!(store.container_by_id_prefix("abcd").unwrap().id, "abcdef");
        assert!(matches!(
            store.container_by_id_prefix("abc"),
            Err(StateError::AmbiguousContainerId(_))
        ));
        assert!(matches!(
            store.container_by_id_prefix("zzz"),
            Err(StateError::NotFound(_))
        ));
        assert!(matches!(
            store.container_by_id_prefix(""),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn host_and_app_queries() {
        let store = test_store();
        store
            .insert_container(&cont("a-1", "i1", "a", "web", "h1"))
            .unwrap();
        store
            .insert_container(&cont("a-2", "i2", "a", "worker", "h2"))
            .unwrap();
        store
            .insert_container(&cont("b-1", "i3", "b", "web", "h1"))
            .unwrap();

        assert_eq!(store.containers_by_host("h1").unwrap().len(), 2);
        assert_eq!(store.containers_by_app("a").unwrap().len(), 2);
        assert_eq!(store.containers_by_app_process("a", "web").unwrap().len(), 1);
        assert_eq!(
            store
                .containers_by_apps_and_hosts(&["a".to_string()], &["h1".to_string()])
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .containers_by_apps_and_hosts(&[], &[])
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn empty_process_matches_empty_only() {
        let store = test_store();
        store
            .insert_container(&cont("a-1", "i1", "a", "", "h1"))
            .unwrap();
        store
            .insert_container(&cont("a-2", "i2", "a", "web", "h1"))
            .unwrap();
        let matched = store.containers_by_app_process("a", "").unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "a-1");
    }

    #[test]
    fn running_containers_skip_parked() {
        let store = test_store();
        let mut stopped = cont("a-1", "i1", "a", "web", "h1");
        stopped.status = ContainerStatus::Stopped;
        store.insert_container(&stopped).unwrap();
        store
            .insert_container(&cont("a-2", "i2", "a", "web", "h1"))
            .unwrap();
        assert_eq!(store.running_containers_by_host("h1").unwrap().len(), 1);
    }

    #[test]
    fn unresponsive_query_filters() {
        let store = test_store();
        let now = 10_000;

        let mut stale = cont("a-1", "i1", "a", "web", "h1");
        stale.last_success_status_update = Some(now - 500);
        store.insert_container(&stale).unwrap();

        let mut fresh = cont("a-2", "i2", "a", "web", "h1");
        fresh.last_success_status_update = Some(now - 10);
        store.insert_container(&fresh).unwrap();

        let mut never = cont("a-3", "i3", "a", "web", "h1");
        never.last_success_status_update = None;
        store.insert_container(&never).unwrap();

        let mut stopped = cont("a-4", "i4", "a", "web", "h1");
        stopped.last_success_status_update = Some(now - 500);
        stopped.status = ContainerStatus::Stopped;
        store.insert_container(&stopped).unwrap();

        let unresponsive = store.unresponsive_containers(120, now).unwrap();
        assert_eq!(unresponsive.len(), 1);
        assert_eq!(unresponsive[0].name, "a-1");
    }

    #[test]
    fn aggregation_honors_ignored_ids() {
        let store = test_store();
        store
            .insert_container(&cont("a-1", "i1", "a", "web", "h1"))
            .unwrap();
        store
            .insert_container(&cont("a-2", "i2", "a", "web", "h1"))
            .unwrap();
        store
            .insert_container(&cont("b-1", "i3", "b", "web", "h2"))
            .unwrap();

        let hosts = vec!["h1".to_string(), "h2".to_string()];
        let none = HashSet::new();
        let counts = store.count_containers_by_host(&hosts, &none).unwrap();
        assert_eq!(counts["h1"], 2);
        assert_eq!(counts["h2"], 1);

        let ignored: HashSet<String> = ["i1".to_string()].into();
        let counts = store.count_containers_by_host(&hosts, &ignored).unwrap();
        assert_eq!(counts["h1"], 1);

        let counts = store
            .count_app_process_by_host(&hosts, "a", "web", &none)
            .unwrap();
        assert_eq!(counts["h1"], 2);
        assert_eq!(counts["h2"], 0);
    }

    #[test]
    fn image_counter_increments() {
        let store = test_store();
        assert_eq!(store.next_image_version("myapp").unwrap(), 1);
        assert_eq!(store.next_image_version("myapp").unwrap(), 2);
        assert_eq!(store.next_image_version("other").unwrap(), 1);
    }

    #[test]
    fn image_append_moves_to_end() {
        let store = test_store();
        store.append_image_name("myapp", "img:v1").unwrap();
        store.append_image_name("myapp", "img:v2").unwrap();
        assert_eq!(
            store.current_image("myapp").unwrap().as_deref(),
            Some("img:v2")
        );

        // Re-promoting v1 moves it to the end without duplicating it.
        store.append_image_name("myapp", "img:v1").unwrap();
        let record = store.image_record("myapp").unwrap().unwrap();
        assert_eq!(record.images, vec!["img:v2", "img:v1"]);

        // Promoting the current image twice is a no-op for the tail.
        store.append_image_name("myapp", "img:v1").unwrap();
        let record = store.image_record("myapp").unwrap().unwrap();
        assert_eq!(record.images, vec!["img:v2", "img:v1"]);
    }

    #[test]
    fn image_prune_drops_oldest() {
        let store = test_store();
        for v in 1..=5 {
            store
                .append_image_name("myapp", &format!("img:v{v}"))
                .unwrap();
        }
        let removed = store.prune_images("myapp", 2).unwrap();
        assert_eq!(removed, vec!["img:v1", "img:v2", "img:v3"]);
        let record = store.image_record("myapp").unwrap().unwrap();
        assert_eq!(record.images, vec!["img:v4", "img:v5"]);
    }

    #[test]
    fn healing_chain_counting() {
        let store = test_store();
        let now = epoch_secs();
        // cont1 → cont2 → cont3: two healings in the lineage of cont3.
        for (failing, created) in [("cont1", "cont2"), ("cont2", "cont3")] {
            let mut evt = HealingEvent::open(
                HealingKind::ContainerHealing,
                EntitySnapshot::Container {
                    id: failing.to_string(),
                    name: format!("app-{failing}"),
                    app_name: "app".to_string(),
                    process_name: "web".to_string(),
                    host_addr: "h1".to_string(),
                },
            );
            evt.created = Some(EntitySnapshot::Container {
                id: created.to_string(),
                name: format!("app-{created}"),
                app_name: "app".to_string(),
                process_name: "web".to_string(),
                host_addr: "h1".to_string(),
            });
            evt.successful = true;
            store.put_healing_event(&evt).unwrap();
        }

        let count = store
            .healing_count_for(HealingKind::ContainerHealing, "cont3", 1800, now)
            .unwrap();
        assert_eq!(count, 2);

        // Other kinds don't count against the chain.
        let count = store
            .healing_count_for(HealingKind::NodeHealing, "cont3", 1800, now)
            .unwrap();
        assert_eq!(count, 0);

        // Outside the window the chain resets.
        let count = store
            .healing_count_for(HealingKind::ContainerHealing, "cont3", 1800, now + 3600)
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn autoscale_event_guard_is_exclusive() {
        let store = test_store();
        let evt = store.try_start_autoscale_event("pool1").unwrap();
        assert!(matches!(
            store.try_start_autoscale_event("pool1"),
            Err(StateError::EventLocked(_))
        ));
        // Other pools are independent.
        store.try_start_autoscale_event("pool2").unwrap();

        store.finish_autoscale_event(evt).unwrap();
        store.try_start_autoscale_event("pool1").unwrap();
    }

    #[test]
    fn autoscale_rule_storage() {
        let store = test_store();
        let rule = AutoScaleRule {
            pool: "pool1".to_string(),
            enabled: true,
            max_container_count: 10,
            ..AutoScaleRule::default()
        };
        store.upsert_autoscale_rule(&rule).unwrap();
        assert_eq!(store.autoscale_rule("pool1").unwrap(), Some(rule));
        assert_eq!(store.autoscale_rule("other").unwrap(), None);

        let bad = AutoScaleRule {
            scale_down_ratio: 0.5,
            ..AutoScaleRule::default()
        };
        assert!(store.upsert_autoscale_rule(&bad).is_err());
    }

    #[test]
    fn snapshot_is_isolated() {
        let store = test_store();
        store
            .insert_container(&cont("a-1", "i1", "a", "web", "h1"))
            .unwrap();
        store.append_image_name("a", "img:v1").unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.list_containers().unwrap().len(), 1);
        assert_eq!(snap.current_image("a").unwrap().as_deref(), Some("img:v1"));

        snap.delete_container("a-1").unwrap();
        assert_eq!(store.list_containers().unwrap().len(), 1);
    }

    #[test]
    fn on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store
                .insert_container(&cont("a-1", "i1", "a", "web", "h1"))
                .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_containers().unwrap().len(), 1);
    }
}
