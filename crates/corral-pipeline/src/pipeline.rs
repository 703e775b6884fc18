//! Sequential executor with reverse-order rollback.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::action::Action;
use crate::cancel::Cancellation;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no actions")]
    Empty,

    #[error("pipeline canceled before action {action:?}")]
    Canceled { action: String },

    #[error("action {action:?} failed: {source}")]
    ActionFailed {
        action: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type PipelineResult<R> = Result<R, PipelineError>;

/// An ordered list of actions executed forward-then-rollback.
pub struct Pipeline<C, R> {
    actions: Vec<Arc<dyn Action<C, R>>>,
}

impl<C, R> Pipeline<C, R>
where
    C: Send + Sync,
    R: Send + Sync,
{
    pub fn new(actions: Vec<Arc<dyn Action<C, R>>>) -> Self {
        Self { actions }
    }

    /// Run every action forward in order, threading each result into the
    /// next forward, and return the last result.
    ///
    /// On failure the failing action's `on_error` hook runs first, then
    /// the completed actions are rolled back newest-first, each with its
    /// own forward result. Rollback is best-effort and cannot abort.
    pub async fn execute(&self, ctx: &C) -> PipelineResult<R> {
        self.execute_canceling(ctx, &Cancellation::never()).await
    }

    /// Like [`execute`](Self::execute), but checks the cancellation
    /// handle before each forward and rolls back if it fired.
    pub async fn execute_canceling(
        &self,
        ctx: &C,
        cancel: &Cancellation,
    ) -> PipelineResult<R> {
        if self.actions.is_empty() {
            return Err(PipelineError::Empty);
        }
        let mut done: Vec<(&Arc<dyn Action<C, R>>, R)> = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            if cancel.is_canceled() {
                let err = PipelineError::Canceled {
                    action: action.name().to_string(),
                };
                self.rollback(ctx, &mut done).await;
                return Err(err);
            }
            debug!(action = action.name(), "running forward");
            let prev = done.last().map(|(_, r)| r);
            match action.forward(ctx, prev).await {
                Ok(result) => done.push((action, result)),
                Err(source) => {
                    error!(action = action.name(), error = %source, "forward failed");
                    action.on_error(ctx, &source).await;
                    self.rollback(ctx, &mut done).await;
                    return Err(PipelineError::ActionFailed {
                        action: action.name().to_string(),
                        source,
                    });
                }
            }
        }
        // Non-empty pipeline always has a last result here.
        let (_, result) = done.pop().ok_or(PipelineError::Empty)?;
        Ok(result)
    }

    async fn rollback(&self, ctx: &C, done: &mut Vec<(&Arc<dyn Action<C, R>>, R)>) {
        while let Some((action, result)) = done.pop() {
            debug!(action = action.name(), "rolling back");
            action.backward(ctx, &result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cancel::CancellationSource;

    /// Shared trace of forward/backward invocations across actions.
    #[derive(Default)]
    struct Trace {
        log: Mutex<Vec<String>>,
    }

    impl Trace {
        fn push(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct Step {
        name: String,
        fail: bool,
    }

    impl Step {
        fn new(name: &str, fail: bool) -> Arc<dyn Action<Trace, u32>> {
            Arc::new(Step {
                name: name.to_string(),
                fail,
            })
        }
    }

    #[async_trait]
    impl Action<Trace, u32> for Step {
        fn name(&self) -> &str {
            &self.name
        }

        async fn forward(&self, ctx: &Trace, prev: Option<&u32>) -> anyhow::Result<u32> {
            ctx.push(format!("fwd:{}", self.name));
            if self.fail {
                anyhow::bail!("step {} exploded", self.name);
            }
            Ok(prev.copied().unwrap_or(0) + 1)
        }

        async fn backward(&self, ctx: &Trace, result: &u32) {
            ctx.push(format!("back:{}:{result}", self.name));
        }

        async fn on_error(&self, ctx: &Trace, _err: &anyhow::Error) {
            ctx.push(format!("err:{}", self.name));
        }
    }

    #[tokio::test]
    async fn forward_threads_results() {
        let pipeline = Pipeline::new(vec![
            Step::new("a", false),
            Step::new("b", false),
            Step::new("c", false),
        ]);
        let trace = Trace::default();
        let result = pipeline.execute(&trace).await.unwrap();
        assert_eq!(result, 3);
        assert_eq!(trace.entries(), vec!["fwd:a", "fwd:b", "fwd:c"]);
    }

    #[tokio::test]
    async fn failure_rolls_back_in_reverse_skipping_failer() {
        let pipeline = Pipeline::new(vec![
            Step::new("a", false),
            Step::new("b", false),
            Step::new("c", true),
        ]);
        let trace = Trace::default();
        let err = pipeline.execute(&trace).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ActionFailed { ref action, .. } if action == "c"
        ));
        // error hook on the failer, then backwards newest-first with each
        // action's own result; c's backward never runs.
        assert_eq!(
            trace.entries(),
            vec!["fwd:a", "fwd:b", "fwd:c", "err:c", "back:b:2", "back:a:1"]
        );
    }

    #[tokio::test]
    async fn first_action_failure_has_nothing_to_roll_back() {
        let pipeline = Pipeline::new(vec![Step::new("a", true), Step::new("b", false)]);
        let trace = Trace::default();
        pipeline.execute(&trace).await.unwrap_err();
        assert_eq!(trace.entries(), vec!["fwd:a", "err:a"]);
    }

    #[tokio::test]
    async fn empty_pipeline_is_an_error() {
        let pipeline: Pipeline<Trace, u32> = Pipeline::new(vec![]);
        let trace = Trace::default();
        assert!(matches!(
            pipeline.execute(&trace).await,
            Err(PipelineError::Empty)
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_and_rolls_back() {
        let (src, cancel) = CancellationSource::new();

        struct CancelingStep {
            src: CancellationSource,
        }

        #[async_trait]
        impl Action<Trace, u32> for CancelingStep {
            fn name(&self) -> &str {
                "canceler"
            }

            async fn forward(&self, ctx: &Trace, _prev: Option<&u32>) -> anyhow::Result<u32> {
                ctx.push("fwd:canceler");
                self.src.cancel();
                Ok(1)
            }

            async fn backward(&self, ctx: &Trace, _result: &u32) {
                ctx.push("back:canceler");
            }
        }

        let pipeline = Pipeline::new(vec![
            Arc::new(CancelingStep { src }) as Arc<dyn Action<Trace, u32>>,
            Step::new("b", false),
        ]);
        let trace = Trace::default();
        let err = pipeline.execute_canceling(&trace, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Canceled { ref action } if action == "b"));
        assert_eq!(trace.entries(), vec!["fwd:canceler", "back:canceler"]);
    }
}
