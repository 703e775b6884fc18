//! Reference-counted application lock.
//!
//! Serializes mutating operations per app. Reentrant within the
//! process; the first acquisition takes the cluster-wide lock through
//! the app service, guarding against other orchestrators. Releasing
//! the last reference triggers a route rebuild before the external
//! lock goes: moved units may have changed the route table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, warn};

use corral_cluster::{AppService, Router};

const LOCK_OWNER: &str = "internal";
const LOCK_REASON: &str = "container-move";

pub struct AppLocker {
    apps: Arc<dyn AppService>,
    router: Arc<dyn Router>,
    refcounts: Mutex<HashMap<String, usize>>,
}

impl AppLocker {
    pub fn new(apps: Arc<dyn AppService>, router: Arc<dyn Router>) -> Self {
        Self {
            apps,
            router,
            refcounts: Mutex::new(HashMap::new()),
        }
    }

    /// Take the lock, or return false when another orchestrator holds
    /// it. Callers fail fast on false rather than wait.
    pub async fn lock(&self, app_name: &str) -> bool {
        let mut counts = self.refcounts.lock().await;
        if let Some(count) = counts.get_mut(app_name) {
            *count += 1;
            return true;
        }
        let acquired = match self.apps.acquire_lock(app_name, LOCK_OWNER, LOCK_REASON).await {
            Ok(acquired) => acquired,
            Err(err) => {
                error!(app = app_name, error = %err, "app lock acquisition failed");
                false
            }
        };
        if acquired {
            counts.insert(app_name.to_string(), 1);
        }
        acquired
    }

    /// Drop one reference; releasing the last one rebuilds the app's
    /// routes and frees the external lock.
    pub async fn unlock(&self, app_name: &str) {
        let mut counts = self.refcounts.lock().await;
        let Some(count) = counts.get_mut(app_name) else {
            warn!(app = app_name, "unlock without a matching lock");
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        counts.remove(app_name);
        match self.apps.app(app_name).await {
            Ok(app) => {
                if let Err(err) = self.router.rebuild_routes(&app).await {
                    error!(app = app_name, error = %err, "route rebuild failed on unlock");
                }
            }
            Err(err) => error!(app = app_name, error = %err, "app fetch failed on unlock"),
        }
        if let Err(err) = self.apps.release_lock(app_name).await {
            error!(app = app_name, error = %err, "external lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use corral_cluster::testing::{FakeApps, FakeRouter};
    use corral_cluster::App;

    use super::*;

    fn locker() -> (AppLocker, Arc<FakeApps>, Arc<FakeRouter>) {
        let apps = Arc::new(FakeApps::with_apps([App {
            name: "myapp".to_string(),
            platform: "python".to_string(),
            pool: "pool1".to_string(),
            plan_memory: 0,
            deploys: 1,
            healthcheck: None,
            restart_after_hooks: Vec::new(),
        }]));
        let router = Arc::new(FakeRouter::default());
        (
            AppLocker::new(apps.clone(), router.clone()),
            apps,
            router,
        )
    }

    #[tokio::test]
    async fn reentrant_within_process() {
        let (locker, apps, router) = locker();
        assert!(locker.lock("myapp").await);
        assert!(locker.lock("myapp").await);
        assert!(locker.lock("myapp").await);

        locker.unlock("myapp").await;
        locker.unlock("myapp").await;
        // Two of three released: external lock still held, no rebuild.
        assert!(apps.lock_held("myapp"));
        assert!(router.rebuilt.lock().unwrap().is_empty());

        locker.unlock("myapp").await;
        assert!(!apps.lock_held("myapp"));
        assert_eq!(*router.rebuilt.lock().unwrap(), vec!["myapp".to_string()]);
    }

    #[tokio::test]
    async fn external_contention_fails_fast() {
        let (locker, apps, _) = locker();
        // Another orchestrator owns the external lock.
        assert!(apps.acquire_lock("myapp", "other", "deploy").await.unwrap());
        assert!(!locker.lock("myapp").await);
    }

    #[tokio::test]
    async fn unlock_without_lock_is_harmless() {
        let (locker, apps, _) = locker();
        locker.unlock("myapp").await;
        assert!(!apps.lock_held("myapp"));
    }
}
