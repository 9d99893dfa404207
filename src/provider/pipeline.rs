use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::ast::{TypeDesc, well_known};
use crate::eval::{EvalResult, OperatorContext};
use crate::value::{Value, ValueStream};

/// Turns the evaluated plan value into the stream sent to the client.
pub type PipelineFactory =
    Arc<dyn Fn(&OperatorContext, Value, Option<Value>) -> EvalResult<ValueStream> + Send + Sync>;

/// Pipeline factories keyed by the tag of the plan's result type.
///
/// Built once per provider; lookups are plain map reads.
#[derive(Clone)]
pub struct PipelineDispatch {
    factories: HashMap<String, PipelineFactory>,
}

impl Default for PipelineDispatch {
    fn default() -> Self {
        Self::standard()
    }
}

impl PipelineDispatch {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut dispatch = Self::empty();
        dispatch.register(well_known::OBSERVABLE, |ctx, value, _| ctx.to_stream(&value));
        dispatch.register(well_known::ENUMERABLE, |ctx, value, _| ctx.to_stream(&value));
        dispatch.register(well_known::LIST, |ctx, value, _| ctx.to_stream(&value));
        dispatch.register(well_known::FUNCTION, |ctx, value, argument| {
            let ctx = ctx.clone();
            let arguments = argument.into_iter().collect();
            Ok(stream::once(async move {
                match ctx.call(&value, arguments).await {
                    Ok(result) => match ctx.to_stream(&result) {
                        Ok(s) => s,
                        Err(_) => stream::iter(vec![Ok(result)]).boxed(),
                    },
                    Err(e) => stream::iter(vec![Err(e.to_remote())]).boxed(),
                }
            })
            .flatten()
            .boxed())
        });
        dispatch
    }

    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&OperatorContext, Value, Option<Value>) -> EvalResult<ValueStream>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(tag.to_string(), Arc::new(factory));
    }

    /// Scalar results without a registered factory become a one-element
    /// stream.
    pub fn dispatch(
        &self,
        ty: &TypeDesc,
        context: &OperatorContext,
        value: Value,
        argument: Option<Value>,
    ) -> EvalResult<ValueStream> {
        match self.factories.get(ty.tag()) {
            Some(factory) => {
                debug!("Dispatching {} plan", ty.tag());
                factory(context, value, argument)
            }
            None => Ok(stream::iter(vec![Ok(value)]).boxed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HostValue;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_function_plan_applies_argument() {
        let square = Value::Host(HostValue::function(|args: Vec<Value>| async move {
            let n = args[0].as_int().unwrap_or(0);
            Ok(Value::List((0..n).map(|i| Value::Int(i * i)).collect()))
        }));
        let ty = TypeDesc::function(vec![TypeDesc::int()], TypeDesc::list(TypeDesc::int()));
        let items: Vec<_> = PipelineDispatch::standard()
            .dispatch(&ty, &OperatorContext::default(), square, Some(Value::Int(3)))
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            items,
            vec![Ok(Value::Int(0)), Ok(Value::Int(1)), Ok(Value::Int(4))]
        );
    }

    #[tokio::test]
    async fn test_scalar_plan_is_single_element() {
        let items: Vec<_> = PipelineDispatch::standard()
            .dispatch(&TypeDesc::int(), &OperatorContext::default(), Value::Int(9), None)
            .unwrap()
            .collect()
            .await;
        assert_eq!(items, vec![Ok(Value::Int(9))]);
    }
}
