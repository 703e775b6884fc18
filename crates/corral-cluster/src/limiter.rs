//! Per-host admission limiter.
//!
//! Bounds the number of in-flight runtime operations against any one
//! host so a mass rollout can't swamp a single node's daemon. The guard
//! releases the slot on drop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Held for the duration of one runtime operation against a host.
pub struct LimiterGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

pub trait HostLimiter: Send + Sync {
    /// Wait for a slot on the host. Unlimited limiters return at once.
    fn acquire(
        &self,
        host: &str,
    ) -> Pin<Box<dyn Future<Output = LimiterGuard> + Send + '_>>;
}

/// In-process limiter: one semaphore per host, lazily created.
pub struct LocalLimiter {
    limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl LocalLimiter {
    /// A limit of zero means unlimited.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, host: &str) -> Option<Arc<Semaphore>> {
        if self.limit == 0 {
            return None;
        }
        let mut hosts = self.hosts.lock().unwrap();
        Some(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
                .clone(),
        )
    }
}

impl HostLimiter for LocalLimiter {
    fn acquire(
        &self,
        host: &str,
    ) -> Pin<Box<dyn Future<Output = LimiterGuard> + Send + '_>> {
        let sem = self.semaphore(host);
        Box::pin(async move {
            let permit = match sem {
                // The semaphore is never closed, so acquire can't fail.
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            LimiterGuard { _permit: permit }
        })
    }
}

/// No limiting at all; used for dry runs and tests.
pub struct NoopLimiter;

impl HostLimiter for NoopLimiter {
    fn acquire(
        &self,
        _host: &str,
    ) -> Pin<Box<dyn Future<Output = LimiterGuard> + Send + '_>> {
        Box::pin(async { LimiterGuard { _permit: None } })
    }
}
