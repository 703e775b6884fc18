//! Cooperative cancellation for long-running pipelines.

use tokio::sync::watch;

/// Owning side of a cancellation pair. Dropping it does NOT cancel;
/// cancellation is always an explicit call.
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

/// Cheap, cloneable handle actions poll between steps.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl CancellationSource {
    pub fn new() -> (CancellationSource, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancellationSource { tx }, Cancellation { rx })
    }

    /// Flag every handle as canceled.
    pub fn cancel(&self) {
        // send only fails with no receivers, which is fine to ignore.
        let _ = self.tx.send(true);
    }
}

impl Cancellation {
    /// A handle that can never be canceled, for callers without a source.
    pub fn never() -> Cancellation {
        let (_, rx) = watch::channel(false);
        Cancellation { rx }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flips_all_handles() {
        let (src, handle) = CancellationSource::new();
        let other = handle.clone();
        assert!(!handle.is_canceled());
        src.cancel();
        assert!(handle.is_canceled());
        assert!(other.is_canceled());
    }

    #[test]
    fn never_handle_stays_live() {
        let handle = Cancellation::never();
        assert!(!handle.is_canceled());
    }
}
