use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::host::{ExecutionHost, InProcessHost};
use super::operators::OperatorRegistry;
use super::pipeline::PipelineDispatch;
use super::types::{PipelineContext, ProviderError, ProviderResult};
use crate::ast::Node;
use crate::eval::{Interpreter, OperatorContext};
use crate::value::{Value, ValueStream};

/// Builds the stream a server session pumps to its client.
#[mockall::automock]
#[async_trait]
pub trait QueryProvider: Send + Sync {
    /// `plan` has passed the security check. `argument` is the value the
    /// client sent ahead of the subscription, if any.
    async fn create_pipeline(
        &self,
        plan: Node,
        argument: Option<Value>,
        context: PipelineContext,
    ) -> ProviderResult<ValueStream>;
}

/// Evaluates plans with the tree-walking interpreter.
pub struct InterpreterProvider {
    operators: Arc<OperatorRegistry>,
    dispatch: Arc<PipelineDispatch>,
    host: Arc<dyn ExecutionHost>,
    initialized: OnceCell<()>,
}

impl Default for InterpreterProvider {
    fn default() -> Self {
        Self::new(OperatorRegistry::standard())
    }
}

impl InterpreterProvider {
    pub fn new(operators: OperatorRegistry) -> Self {
        Self {
            operators: Arc::new(operators),
            dispatch: Arc::new(PipelineDispatch::standard()),
            host: Arc::new(InProcessHost),
            initialized: OnceCell::new(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: PipelineDispatch) -> Self {
        self.dispatch = Arc::new(dispatch);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ExecutionHost>) -> Self {
        self.host = host;
        self
    }

    async fn ensure_host(&self) -> ProviderResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                debug!("Initializing execution host {}", self.host.name());
                self.host.initialize().await
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueryProvider for InterpreterProvider {
    #[instrument(level = "debug", skip_all, fields(plan = %plan.ty()))]
    async fn create_pipeline(
        &self,
        plan: Node,
        argument: Option<Value>,
        context: PipelineContext,
    ) -> ProviderResult<ValueStream> {
        self.ensure_host().await?;
        let operators =
            OperatorContext::new(context.duplex.clone()).with_cancel(context.cancel.clone());
        let interpreter = Interpreter::new(self.operators.clone(), operators.clone());
        let value = interpreter.evaluate(&plan).await?;
        let pipeline = self
            .dispatch
            .dispatch(plan.ty(), &operators, value, argument)
            .map_err(ProviderError::from)?;
        Ok(pipeline
            .take_until(context.cancel.cancelled_owned())
            .boxed())
    }
}
