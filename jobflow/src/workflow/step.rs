//! Step trait.

use async_trait::async_trait;

use crate::Result;
use crate::domain::StepContext;

/// One executable step of a workflow.
///
/// `Ok(false)` is an expected failure (the step already logged why); `Err` is
/// recorded as an error message on the step. Long-running steps should watch
/// [`StepContext::cancellation_token`].
#[async_trait]
pub trait WorkflowStep: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &StepContext<'_>) -> Result<bool>;
}

/// A step backed by a synchronous closure.
pub struct StepFn<F> {
    name: String,
    f: F,
}

impl<F> StepFn<F>
where
    F: Fn(&StepContext<'_>) -> Result<bool> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> WorkflowStep for StepFn<F>
where
    F: Fn(&StepContext<'_>) -> Result<bool> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<bool> {
        (self.f)(ctx)
    }
}
