//! Versioned per-app image naming and retention.

use std::sync::Arc;

use tracing::warn;

use corral_cluster::ContainerRuntime;
use corral_state::{StateResult, StateStore};

#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Registry host prefix; empty for a local daemon.
    pub registry: String,
    pub namespace: String,
    /// How many image names to retain per app.
    pub history_size: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            registry: String::new(),
            namespace: "corral".to_string(),
            history_size: 10,
        }
    }
}

impl ImageConfig {
    fn base_name(&self, app_name: &str) -> String {
        if self.registry.is_empty() {
            format!("{}/app-{app_name}", self.namespace)
        } else {
            format!("{}/{}/app-{app_name}", self.registry, self.namespace)
        }
    }

    /// Reserve the next image version for an app:
    /// `<registry>/<namespace>/app-<app>:v<N>`.
    pub fn new_image_name(&self, store: &StateStore, app_name: &str) -> StateResult<String> {
        let version = store.next_image_version(app_name)?;
        Ok(format!("{}:v{version}", self.base_name(app_name)))
    }

    /// The app's current image. Apps deployed before versioned naming
    /// have no record; they resolve to the legacy untagged name.
    pub fn current_image(&self, store: &StateStore, app_name: &str) -> StateResult<String> {
        match store.current_image(app_name)? {
            Some(image) => Ok(image),
            None => Ok(self.base_name(app_name)),
        }
    }

    /// Promote `image` to current and prune history beyond the window.
    /// Pruned artifacts are removed from the runtime best-effort.
    pub async fn promote(
        &self,
        store: &StateStore,
        runtime: &Arc<dyn ContainerRuntime>,
        app_name: &str,
        image: &str,
    ) -> StateResult<()> {
        store.append_image_name(app_name, image)?;
        for old in store.prune_images(app_name, self.history_size)? {
            if let Err(err) = runtime.remove_image(&old).await {
                warn!(app = app_name, image = %old, error = %err, "image prune failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use corral_cluster::testing::FakeRuntime;

    use super::*;

    #[test]
    fn versioned_names_increment() {
        let store = StateStore::open_in_memory().unwrap();
        let config = ImageConfig {
            registry: "registry.example.com".to_string(),
            ..ImageConfig::default()
        };
        assert_eq!(
            config.new_image_name(&store, "myapp").unwrap(),
            "registry.example.com/corral/app-myapp:v1"
        );
        assert_eq!(
            config.new_image_name(&store, "myapp").unwrap(),
            "registry.example.com/corral/app-myapp:v2"
        );
    }

    #[test]
    fn registryless_names_skip_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        let config = ImageConfig::default();
        assert_eq!(
            config.new_image_name(&store, "myapp").unwrap(),
            "corral/app-myapp:v1"
        );
    }

    #[test]
    fn current_image_falls_back_to_legacy_name() {
        let store = StateStore::open_in_memory().unwrap();
        let config = ImageConfig::default();
        assert_eq!(
            config.current_image(&store, "legacy").unwrap(),
            "corral/app-legacy"
        );
    }

    #[tokio::test]
    async fn promotion_prunes_and_removes_artifacts() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime = FakeRuntime::default();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
        let config = ImageConfig {
            history_size: 2,
            ..ImageConfig::default()
        };
        for v in 1..=3 {
            config
                .promote(&store, &runtime, "myapp", &format!("corral/app-myapp:v{v}"))
                .await
                .unwrap();
        }
        assert_eq!(
            config.current_image(&store, "myapp").unwrap(),
            "corral/app-myapp:v3"
        );
        let record = store.image_record("myapp").unwrap().unwrap();
        assert_eq!(record.images.len(), 2);
    }

    #[tokio::test]
    async fn repromotion_is_idempotent_at_the_tail() {
        let store = StateStore::open_in_memory().unwrap();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::default());
        let config = ImageConfig::default();
        config
            .promote(&store, &runtime, "myapp", "corral/app-myapp:v1")
            .await
            .unwrap();
        config
            .promote(&store, &runtime, "myapp", "corral/app-myapp:v1")
            .await
            .unwrap();
        let record = store.image_record("myapp").unwrap().unwrap();
        assert_eq!(record.images, vec!["corral/app-myapp:v1"]);
    }
}
