//! Parallel per-container execution.
//!
//! Runs a callback over a list of containers, partitioned into
//! contiguous slices across worker tasks. On the first error no new
//! work starts; in-flight work finishes; then a rollback callback runs
//! for every container the callbacks registered. Returns the first
//! captured error; rollback errors are logged only.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use corral_state::Container;

pub type ContainerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type ContainerCallback = Arc<dyn Fn(Container, RollbackSink) -> ContainerFuture + Send + Sync>;
pub type RollbackFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type RollbackCallback = Arc<dyn Fn(Container) -> RollbackFuture + Send + Sync>;

/// Collects containers whose work completed far enough to need undoing.
/// Callbacks register a container *before* the step that might fail.
#[derive(Clone, Default)]
pub struct RollbackSink {
    registered: Arc<Mutex<Vec<Container>>>,
}

impl RollbackSink {
    pub fn push(&self, container: Container) {
        self.registered.lock().unwrap().push(container);
    }

    fn drain(&self) -> Vec<Container> {
        std::mem::take(&mut self.registered.lock().unwrap())
    }
}

pub async fn run_in_containers(
    containers: &[Container],
    max_workers: usize,
    parallel: bool,
    callback: ContainerCallback,
    rollback: Option<RollbackCallback>,
) -> anyhow::Result<()> {
    if containers.is_empty() {
        return Ok(());
    }
    let workers = if !parallel {
        1
    } else if max_workers == 0 {
        containers.len()
    } else {
        max_workers.min(containers.len())
    };
    let chunk = containers.len().div_ceil(workers);

    let sink = RollbackSink::default();
    let failed = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::new();
    for slice in containers.chunks(chunk) {
        let slice = slice.to_vec();
        let callback = callback.clone();
        let sink = sink.clone();
        let failed = failed.clone();
        let first_error = first_error.clone();
        handles.push(tokio::spawn(async move {
            for container in slice {
                if failed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(err) = callback(container, sink.clone()).await {
                    failed.store(true, Ordering::SeqCst);
                    first_error.lock().unwrap().get_or_insert(err);
                    return;
                }
            }
        }));
    }
    for handle in handles {
        // Worker bodies don't panic; a JoinError still must not wedge
        // the rollback, so it is folded into the error slot.
        if let Err(err) = handle.await {
            failed.store(true, Ordering::SeqCst);
            first_error
                .lock()
                .unwrap()
                .get_or_insert(anyhow::anyhow!("worker task failed: {err}"));
        }
    }

    let err = first_error.lock().unwrap().take();
    match err {
        Some(err) => {
            if let Some(rollback) = rollback {
                for container in sink.drain() {
                    let name = container.name.clone();
                    if let Err(rb_err) = rollback(container).await {
                        error!(container = %name, error = %rb_err, "rollback failed");
                    }
                }
            }
            Err(err)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use corral_state::ContainerStatus;

    use super::*;

    fn cont(name: &str) -> Container {
        Container {
            id: name.to_string(),
            name: name.to_string(),
            app_name: "app".to_string(),
            process_name: "web".to_string(),
            platform: String::new(),
            image: String::new(),
            building_image: String::new(),
            host_addr: "h1".to_string(),
            host_port: String::new(),
            exposed_port: String::new(),
            ip: String::new(),
            status: ContainerStatus::Started,
            status_updated_at: 0,
            last_success_status_update: None,
            routable: false,
        }
    }

    #[tokio::test]
    async fn runs_every_container_on_success() {
        let containers: Vec<_> = (0..7).map(|i| cont(&format!("c{i}"))).collect();
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = counter.clone();
        let callback: ContainerCallback = Arc::new(move |_, _| {
            let c = c2.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        run_in_containers(&containers, 3, true, callback, None)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn first_error_triggers_rollback_of_registered() {
        let containers: Vec<_> = (0..4).map(|i| cont(&format!("c{i}"))).collect();
        let rolled_back = Arc::new(Mutex::new(Vec::new()));

        let callback: ContainerCallback = Arc::new(move |container: Container, sink| {
            Box::pin(async move {
                if container.name == "c2" {
                    anyhow::bail!("boom on {}", container.name);
                }
                sink.push(container);
                Ok(())
            })
        });
        let rb = rolled_back.clone();
        let rollback: RollbackCallback = Arc::new(move |container: Container| {
            let rb = rb.clone();
            Box::pin(async move {
                rb.lock().unwrap().push(container.name);
                Ok(())
            })
        });

        // Serial execution makes the failure point deterministic.
        let err = run_in_containers(&containers, 0, false, callback, Some(rollback))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom on c2"));
        // c0 and c1 registered before the failure; c3 never ran.
        assert_eq!(*rolled_back.lock().unwrap(), vec!["c0", "c1"]);
    }

    #[tokio::test]
    async fn rollback_errors_do_not_mask_the_first_error() {
        let containers = vec![cont("c0"), cont("c1")];
        let callback: ContainerCallback = Arc::new(|container: Container, sink| {
            Box::pin(async move {
                if container.name == "c1" {
                    anyhow::bail!("real failure");
                }
                sink.push(container);
                Ok(())
            })
        });
        let rollback: RollbackCallback =
            Arc::new(|_| Box::pin(async { anyhow::bail!("rollback also failed") }));
        let err = run_in_containers(&containers, 0, false, callback, Some(rollback))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("real failure"));
    }

    #[tokio::test]
    async fn empty_list_is_a_noop() {
        let callback: ContainerCallback = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        run_in_containers(&[], 4, true, callback, None).await.unwrap();
    }
}
