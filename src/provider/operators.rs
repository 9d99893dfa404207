//! Built-in query operators, looked up by `Declaring.Name` method keys.

use std::collections::HashMap;
use std::future::{Future, ready};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::ast::well_known;
use crate::error::RemoteError;
use crate::eval::{EvalError, EvalResult, OperatorContext};
use crate::value::{HostValue, Value, ValueStream};

pub type OperatorFuture = BoxFuture<'static, EvalResult<Value>>;
pub type Operator = Arc<dyn Fn(OperatorContext, Vec<Value>) -> OperatorFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Operator>,
}

impl OperatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The observable and enumerable operators every server understands.
    pub fn standard() -> Self {
        let mut registry = Self::new();

        registry.register("Observable.Range", |_, args| async move {
            let (start, count) = (int_arg(&args, 0)?, int_arg(&args, 1)?);
            Ok(observable(move || range(start, count)))
        });
        registry.register("Observable.Return", |_, args| async move {
            let value = arg(&args, 0)?.clone();
            Ok(observable(move || stream::iter(vec![Ok(value.clone())]).boxed()))
        });
        registry.register("Observable.Empty", |_, _| async move {
            Ok(observable(|| stream::empty().boxed()))
        });
        registry.register("Observable.Throw", |_, args| async move {
            let error = match arg(&args, 0)? {
                Value::String(message) => RemoteError::user(message.clone()),
                other => RemoteError::user(other.to_string()),
            };
            Ok(observable(move || stream::iter(vec![Err(error.clone())]).boxed()))
        });
        registry.register("Observable.Select", |ctx, args| async move {
            Ok(observable(select(ctx, args)?))
        });
        registry.register("Observable.Where", |ctx, args| async move {
            Ok(observable(filter(ctx, args)?))
        });
        registry.register("Observable.Take", |ctx, args| async move {
            let (source, count) = (arg(&args, 0)?.clone(), count_arg(&args, 1)?);
            Ok(observable(move || derived(&ctx, &source, |s| s.take(count).boxed())))
        });
        registry.register("Observable.Skip", |ctx, args| async move {
            let (source, count) = (arg(&args, 0)?.clone(), count_arg(&args, 1)?);
            Ok(observable(move || derived(&ctx, &source, |s| s.skip(count).boxed())))
        });
        registry.register("Observable.Concat", |ctx, args| async move {
            let (first, second) = (arg(&args, 0)?.clone(), arg(&args, 1)?.clone());
            Ok(observable(move || {
                let tail = stream_or_error(&ctx, &second);
                derived(&ctx, &first, move |s| s.chain(tail).boxed())
            }))
        });
        registry.register("Observable.Merge", |ctx, args| async move {
            let (first, second) = (arg(&args, 0)?.clone(), arg(&args, 1)?.clone());
            Ok(observable(move || {
                let other = stream_or_error(&ctx, &second);
                derived(&ctx, &first, move |s| stream::select(s, other).boxed())
            }))
        });
        registry.register("Observable.ToObservable", |ctx, args| async move {
            let source = arg(&args, 0)?.clone();
            ctx.check_streamable(&source)?;
            Ok(observable(move || stream_or_error(&ctx, &source)))
        });

        registry.register("Enumerable.Range", |_, args| async move {
            let (start, count) = (int_arg(&args, 0)?, int_arg(&args, 1)?);
            Ok(sequence(move || range(start, count)))
        });
        registry.register("Enumerable.Select", |ctx, args| async move {
            Ok(sequence(select(ctx, args)?))
        });
        registry.register("Enumerable.Where", |ctx, args| async move {
            Ok(sequence(filter(ctx, args)?))
        });
        registry.register("Enumerable.ToList", |ctx, args| async move {
            let items: Vec<_> = ctx.to_stream(arg(&args, 0)?)?.collect().await;
            let items = items
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(EvalError::Thrown)?;
            Ok(Value::List(items))
        });

        debug!("Standard operator registry with {} operators", registry.len());
        registry
    }

    pub fn register<F, Fut>(&mut self, key: &str, operator: F)
    where
        F: Fn(OperatorContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EvalResult<Value>> + Send + 'static,
    {
        self.operators.insert(
            key.to_string(),
            Arc::new(move |ctx, args| Box::pin(operator(ctx, args))),
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.operators.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub async fn call(
        &self,
        key: &str,
        context: OperatorContext,
        arguments: Vec<Value>,
    ) -> EvalResult<Value> {
        let operator = self
            .operators
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError::UnknownOperator(key.to_string()))?;
        operator(context, arguments).await
    }
}

fn observable<F>(factory: F) -> Value
where
    F: Fn() -> ValueStream + Send + Sync + 'static,
{
    Value::Host(HostValue::stream(factory))
}

fn sequence<F>(factory: F) -> Value
where
    F: Fn() -> ValueStream + Send + Sync + 'static,
{
    Value::Host(HostValue::sequence(factory))
}

fn arg(args: &[Value], at: usize) -> EvalResult<&Value> {
    args.get(at)
        .ok_or_else(|| EvalError::Unsupported(format!("missing argument {}", at)))
}

fn int_arg(args: &[Value], at: usize) -> EvalResult<i64> {
    let value = arg(args, at)?;
    value
        .as_int()
        .ok_or_else(|| EvalError::mismatch(well_known::INT, value.type_name()))
}

fn count_arg(args: &[Value], at: usize) -> EvalResult<usize> {
    let count = int_arg(args, at)?;
    usize::try_from(count).map_err(|_| EvalError::InvalidOperand {
        op: "count".to_string(),
        value: count.to_string(),
    })
}

fn range(start: i64, count: i64) -> ValueStream {
    stream::iter((0..count.max(0)).map(move |i| Ok(Value::Int(start + i)))).boxed()
}

/// A stream that fails once if `source` is not sequence-like.
fn stream_or_error(ctx: &OperatorContext, source: &Value) -> ValueStream {
    match ctx.to_stream(source) {
        Ok(s) => s,
        Err(e) => stream::iter(vec![Err(e.to_remote())]).boxed(),
    }
}

fn derived<F>(ctx: &OperatorContext, source: &Value, f: F) -> ValueStream
where
    F: FnOnce(ValueStream) -> ValueStream,
{
    match ctx.to_stream(source) {
        Ok(s) => f(s),
        Err(e) => stream::iter(vec![Err(e.to_remote())]).boxed(),
    }
}

fn select(
    ctx: OperatorContext,
    args: Vec<Value>,
) -> EvalResult<impl Fn() -> ValueStream + Send + Sync + 'static> {
    let (source, selector) = (arg(&args, 0)?.clone(), arg(&args, 1)?.clone());
    Ok(move || {
        let (ctx, selector) = (ctx.clone(), selector.clone());
        derived(&ctx.clone(), &source, move |s| {
            s.then(move |item| {
                let (ctx, selector) = (ctx.clone(), selector.clone());
                async move {
                    match item {
                        Ok(value) => ctx
                            .call(&selector, vec![value])
                            .await
                            .map_err(|e| e.to_remote()),
                        Err(e) => Err(e),
                    }
                }
            })
            .boxed()
        })
    })
}

fn filter(
    ctx: OperatorContext,
    args: Vec<Value>,
) -> EvalResult<impl Fn() -> ValueStream + Send + Sync + 'static> {
    let (source, predicate) = (arg(&args, 0)?.clone(), arg(&args, 1)?.clone());
    Ok(move || {
        let (ctx, predicate) = (ctx.clone(), predicate.clone());
        derived(&ctx.clone(), &source, move |s| {
            s.then(move |item| {
                let (ctx, predicate) = (ctx.clone(), predicate.clone());
                async move {
                    let value = match item {
                        Ok(value) => value,
                        Err(e) => return Some(Err(e)),
                    };
                    match ctx.call(&predicate, vec![value.clone()]).await {
                        Ok(Value::Bool(true)) => Some(Ok(value)),
                        Ok(Value::Bool(false)) => None,
                        Ok(other) => Some(Err(EvalError::mismatch(
                            well_known::BOOL,
                            other.type_name(),
                        )
                        .to_remote())),
                        Err(e) => Some(Err(e.to_remote())),
                    }
                }
            })
            .filter_map(ready)
            .boxed()
        })
    })
}
