//! The unit of work a pipeline composes.

use async_trait::async_trait;

/// One reversible step in a pipeline over context `C` and result `R`.
///
/// `forward` sees the previous action's result (or `None` for the first
/// action) and produces its own. `backward` undoes a *completed*
/// forward; it receives the result that forward returned and must not
/// fail — irrecoverable cleanup problems are logged, not propagated.
#[async_trait]
pub trait Action<C, R>: Send + Sync
where
    C: Send + Sync,
    R: Send + Sync,
{
    /// Stable name used in logs and error messages.
    fn name(&self) -> &str;

    async fn forward(&self, ctx: &C, prev: Option<&R>) -> anyhow::Result<R>;

    /// Undo a completed forward. Default: nothing to undo.
    async fn backward(&self, _ctx: &C, _result: &R) {}

    /// Hook invoked on this action when its own forward fails, before
    /// any rollback starts. Default: nothing.
    async fn on_error(&self, _ctx: &C, _err: &anyhow::Error) {}
}
