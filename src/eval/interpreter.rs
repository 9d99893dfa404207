use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_recursion::async_recursion;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::{EvalError, EvalResult};
use crate::ast::{
    BinaryOp, CatchBlock, ElementInit, Expr, MemberBinding, NewArrayKind, Node, TypeBinaryOp,
    TypeDesc, UnaryOp, well_known,
};
use crate::duplex::{DuplexClient, DuplexError, DuplexKind};
use crate::error::{RemoteError, RemoteErrorKind};
use crate::provider::OperatorRegistry;
use crate::value::{HostValue, PropertyBag, Value, ValueStream};

type Slot = Arc<Mutex<Value>>;

/// Variables visible at one point of evaluation, keyed by parameter node
/// identity.
#[derive(Default)]
pub struct Scope {
    slots: HashMap<usize, Slot>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn child(parent: &Arc<Scope>, bindings: Vec<(&Node, Value)>) -> Arc<Self> {
        Arc::new(Self {
            slots: bindings
                .into_iter()
                .map(|(node, value)| (node.id(), Arc::new(Mutex::new(value))))
                .collect(),
            parent: Some(parent.clone()),
        })
    }

    fn lookup(&self, node: &Node) -> Option<Slot> {
        match self.slots.get(&node.id()) {
            Some(slot) => Some(slot.clone()),
            None => self.parent.as_ref().and_then(|p| p.lookup(node)),
        }
    }

    fn read(&self, node: &Node) -> EvalResult<Value> {
        let slot = self.lookup(node).ok_or_else(|| unbound(node))?;
        let value = slot.lock().map_err(|_| poisoned())?.clone();
        Ok(value)
    }

    fn write(&self, node: &Node, value: Value) -> EvalResult<()> {
        let slot = self.lookup(node).ok_or_else(|| unbound(node))?;
        *slot.lock().map_err(|_| poisoned())? = value;
        Ok(())
    }
}

fn unbound(node: &Node) -> EvalError {
    EvalError::UnboundParameter(node.parameter_name().unwrap_or("<unnamed>").to_string())
}

fn poisoned() -> EvalError {
    EvalError::Unsupported("variable slot poisoned".to_string())
}

/// Non-local exits while evaluating: a jump to a label or an error.
#[derive(Debug)]
enum Unwind {
    Jump { label: usize, value: Value },
    Error(EvalError),
}

impl From<EvalError> for Unwind {
    fn from(e: EvalError) -> Self {
        Unwind::Error(e)
    }
}

type Flow<T> = Result<T, Unwind>;

/// What operators get to work with besides their arguments.
#[derive(Clone, Default)]
pub struct OperatorContext {
    duplex: Option<DuplexClient>,
    cancel: CancellationToken,
}

impl OperatorContext {
    pub fn new(duplex: Option<DuplexClient>) -> Self {
        Self {
            duplex,
            cancel: CancellationToken::new(),
        }
    }

    /// Evaluation stops at the next loop iteration once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn duplex(&self) -> Option<&DuplexClient> {
        self.duplex.as_ref()
    }

    fn duplex_client(&self) -> EvalResult<&DuplexClient> {
        self.duplex
            .as_ref()
            .ok_or(EvalError::Duplex(DuplexError::NotInitialized))
    }

    /// Calls a function value, local or owned by the peer.
    pub async fn call(&self, function: &Value, arguments: Vec<Value>) -> EvalResult<Value> {
        match function {
            Value::Host(HostValue::Function(f)) => f(arguments).await.map_err(EvalError::Thrown),
            Value::Duplex(reference) if reference.kind == DuplexKind::Invoke => {
                Ok(self.duplex_client()?.invoke(reference, arguments).await?)
            }
            other => Err(EvalError::mismatch(well_known::FUNCTION, other.type_name())),
        }
    }

    /// Fails the way [`Self::to_stream`] would, without building a stream.
    pub fn check_streamable(&self, value: &Value) -> EvalResult<()> {
        match value {
            Value::List(_)
            | Value::Host(HostValue::Sequence(_))
            | Value::Host(HostValue::Stream(_)) => Ok(()),
            Value::Duplex(reference) if reference.kind != DuplexKind::Invoke => {
                self.duplex_client().map(|_| ())
            }
            other => Err(EvalError::mismatch(well_known::OBSERVABLE, other.type_name())),
        }
    }

    /// A fresh stream over any sequence-like value.
    pub fn to_stream(&self, value: &Value) -> EvalResult<ValueStream> {
        match value {
            Value::List(items) => Ok(stream::iter(items.clone().into_iter().map(Ok)).boxed()),
            Value::Host(HostValue::Sequence(factory)) | Value::Host(HostValue::Stream(factory)) => {
                Ok(factory())
            }
            Value::Duplex(reference) if reference.kind != DuplexKind::Invoke => Ok(self
                .duplex_client()?
                .stream(*reference)
                .map(|item| item.map_err(|e| e.to_remote()))
                .boxed()),
            other => Err(EvalError::mismatch(well_known::OBSERVABLE, other.type_name())),
        }
    }
}

/// Tree-walking evaluator for accepted plans.
#[derive(Clone)]
pub struct Interpreter {
    operators: Arc<OperatorRegistry>,
    context: OperatorContext,
}

impl Interpreter {
    pub fn new(operators: Arc<OperatorRegistry>, context: OperatorContext) -> Self {
        Self { operators, context }
    }

    pub fn context(&self) -> &OperatorContext {
        &self.context
    }

    #[instrument(level = "debug", skip_all, fields(kind = %plan.kind()))]
    pub async fn evaluate(&self, plan: &Node) -> EvalResult<Value> {
        self.evaluate_in(plan, Scope::root()).await
    }

    pub async fn evaluate_in(&self, plan: &Node, scope: Arc<Scope>) -> EvalResult<Value> {
        match self.eval(plan, scope).await {
            Ok(value) => Ok(value),
            Err(Unwind::Error(e)) => Err(e),
            Err(Unwind::Jump { .. }) => Err(EvalError::InvalidJump),
        }
    }

    async fn eval_all(&self, nodes: &[Node], scope: &Arc<Scope>) -> Flow<Vec<Value>> {
        let mut values = Vec::with_capacity(nodes.len());
        for node in nodes {
            values.push(self.eval(node, scope.clone()).await?);
        }
        Ok(values)
    }

    #[async_recursion]
    async fn eval(&self, node: &Node, scope: Arc<Scope>) -> Flow<Value> {
        trace!("eval {}", node.kind());
        match node.expr() {
            Expr::Constant(value) => Ok(value.clone()),
            Expr::Default => Ok(default_of(node.ty())),
            Expr::Parameter { .. } => Ok(scope.read(node)?),
            Expr::Binary {
                op,
                left,
                right,
                method,
            } => self.eval_binary(*op, left, right, method.as_ref(), scope).await,
            Expr::Unary {
                op,
                operand,
                method,
            } => self.eval_unary(*op, operand, method.as_ref(), node.ty(), scope).await,
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let test = self.eval(test, scope.clone()).await?;
                match test {
                    Value::Bool(true) => self.eval(if_true, scope).await,
                    Value::Bool(false) => self.eval(if_false, scope).await,
                    other => Err(EvalError::mismatch(well_known::BOOL, other.type_name()).into()),
                }
            }
            Expr::Block {
                variables,
                expressions,
            } => {
                let bindings = variables
                    .iter()
                    .map(|v| (v, default_of(v.ty())))
                    .collect();
                let inner = Scope::child(&scope, bindings);
                let last = self.eval_block(expressions, inner).await?;
                Ok(if node.ty().is_unit() { Value::Null } else { last })
            }
            Expr::Label { default_value, .. } => match default_value {
                Some(value) => self.eval(value, scope).await,
                None => Ok(Value::Null),
            },
            Expr::Goto { target, value, .. } => {
                let value = match value {
                    Some(v) => self.eval(v, scope).await?,
                    None => Value::Null,
                };
                Err(Unwind::Jump {
                    label: target.id(),
                    value,
                })
            }
            Expr::Loop {
                body,
                break_label,
                continue_label,
            } => {
                let break_id = break_label.as_ref().map(|l| l.id());
                let continue_id = continue_label.as_ref().map(|l| l.id());
                loop {
                    if self.context.is_cancelled() {
                        return Err(EvalError::Cancelled.into());
                    }
                    match self.eval(body, scope.clone()).await {
                        Ok(_) => {}
                        Err(Unwind::Jump { label, value }) if Some(label) == break_id => {
                            return Ok(value);
                        }
                        Err(Unwind::Jump { label, .. }) if Some(label) == continue_id => {}
                        Err(other) => return Err(other),
                    }
                    tokio::task::yield_now().await;
                }
            }
            Expr::Lambda { .. } => Ok(self.closure(node, scope)),
            Expr::Invocation { target, arguments } => {
                let function = self.eval(target, scope.clone()).await?;
                let arguments = self.eval_all(arguments, &scope).await?;
                Ok(self.context.call(&function, arguments).await?)
            }
            Expr::Call {
                object,
                method,
                arguments,
            } => {
                let mut values = Vec::with_capacity(arguments.len() + 1);
                if let Some(object) = object {
                    values.push(self.eval(object, scope.clone()).await?);
                }
                values.extend(self.eval_all(arguments, &scope).await?);
                Ok(self
                    .operators
                    .call(&method.key(), self.context.clone(), values)
                    .await?)
            }
            Expr::MemberAccess { object, member } => match object {
                Some(object) => {
                    let target = self.eval(object, scope).await?;
                    Ok(read_member(&target, member.name())?)
                }
                None => {
                    let key = member.key();
                    if !self.operators.contains(&key) {
                        return Err(EvalError::MissingMember(key).into());
                    }
                    Ok(self.operators.call(&key, self.context.clone(), vec![]).await?)
                }
            },
            Expr::Index {
                object, arguments, ..
            } => {
                let target = self.eval(object, scope.clone()).await?;
                let arguments = self.eval_all(arguments, &scope).await?;
                match arguments.as_slice() {
                    [key] => Ok(index(&target, key)?),
                    _ => Err(EvalError::Unsupported(format!(
                        "index with {} arguments",
                        arguments.len()
                    ))
                    .into()),
                }
            }
            Expr::New {
                constructor,
                arguments,
                members,
            } => {
                let arguments = self.eval_all(arguments, &scope).await?;
                if !members.is_empty() || node.ty().is_named(well_known::PROPERTY_BAG) {
                    return Ok(Value::Bag(
                        members
                            .iter()
                            .map(|m| m.name().to_string())
                            .zip(arguments)
                            .collect(),
                    ));
                }
                if node.ty().is_named(well_known::LIST) {
                    return Ok(match arguments.into_iter().next() {
                        Some(Value::List(items)) => Value::List(items),
                        _ => Value::List(vec![]),
                    });
                }
                match constructor {
                    Some(c) => {
                        let key = format!("{}..ctor", c.declaring.tag());
                        Ok(self.operators.call(&key, self.context.clone(), arguments).await?)
                    }
                    None => Ok(default_of(node.ty())),
                }
            }
            Expr::NewArray { kind, expressions } => {
                let values = self.eval_all(expressions, &scope).await?;
                match kind {
                    NewArrayKind::Init => Ok(Value::List(values)),
                    NewArrayKind::Bounds => {
                        let length = match values.first() {
                            Some(Value::Int(n)) if *n >= 0 => *n as usize,
                            Some(other) => {
                                return Err(EvalError::InvalidOperand {
                                    op: "array bound".to_string(),
                                    value: other.to_string(),
                                }
                                .into());
                            }
                            None => 0,
                        };
                        let element = node
                            .ty()
                            .element_type()
                            .map(default_of)
                            .unwrap_or(Value::Null);
                        Ok(Value::List(vec![element; length]))
                    }
                }
            }
            Expr::ListInit {
                new_expr,
                initializers,
            } => {
                let target = self.eval(new_expr, scope.clone()).await?;
                self.apply_initializers(target, initializers, &scope).await
            }
            Expr::MemberInit { new_expr, bindings } => {
                let target = self.eval(new_expr, scope.clone()).await?;
                self.apply_bindings(target, bindings, &scope).await
            }
            Expr::RuntimeVariables { variables } => Ok(Value::List(
                variables
                    .iter()
                    .map(|v| scope.read(v))
                    .collect::<EvalResult<Vec<_>>>()?,
            )),
            Expr::Switch {
                value,
                cases,
                default_body,
                comparison,
            } => {
                let value = self.eval(value, scope.clone()).await?;
                for case in cases {
                    for test in &case.test_values {
                        let candidate = self.eval(test, scope.clone()).await?;
                        let matched = match comparison {
                            Some(method) => {
                                let result = self
                                    .operators
                                    .call(
                                        &method.key(),
                                        self.context.clone(),
                                        vec![value.clone(), candidate],
                                    )
                                    .await?;
                                truthy(&result)?
                            }
                            None => values_equal(&value, &candidate),
                        };
                        if matched {
                            return self.eval(&case.body, scope).await;
                        }
                    }
                }
                match default_body {
                    Some(body) => self.eval(body, scope).await,
                    None => Ok(Value::Null),
                }
            }
            Expr::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                let mut result = self.eval(body, scope.clone()).await;
                if let Err(Unwind::Error(error)) = result {
                    result = match self.find_handler(handlers, &error, &scope).await? {
                        Some((handler, inner)) => self.eval(&handler.body, inner).await,
                        None => {
                            if let Some(fault) = fault {
                                self.eval(fault, scope.clone()).await?;
                            }
                            Err(Unwind::Error(error))
                        }
                    };
                }
                if let Some(finally) = finally {
                    self.eval(finally, scope).await?;
                }
                result
            }
            Expr::TypeBinary {
                op,
                operand,
                type_operand,
            } => {
                let value = self.eval(operand, scope).await?;
                Ok(Value::Bool(match op {
                    TypeBinaryOp::TypeIs => value.is_instance_of(type_operand),
                    TypeBinaryOp::TypeEqual => value.type_name() == type_operand.tag(),
                }))
            }
        }
    }

    /// Runs a block body. A jump to a label placed directly in the block
    /// resumes after that label.
    async fn eval_block(&self, expressions: &[Node], scope: Arc<Scope>) -> Flow<Value> {
        let mut last = Value::Null;
        let mut i = 0;
        while i < expressions.len() {
            match self.eval(&expressions[i], scope.clone()).await {
                Ok(value) => {
                    last = value;
                    i += 1;
                }
                Err(Unwind::Jump { label, value }) => {
                    let position = expressions.iter().position(|e| {
                        matches!(e.expr(), Expr::Label { target, .. } if target.id() == label)
                    });
                    match position {
                        Some(position) => {
                            last = value;
                            i = position + 1;
                        }
                        None => return Err(Unwind::Jump { label, value }),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(last)
    }

    async fn find_handler<'h>(
        &self,
        handlers: &'h [CatchBlock],
        error: &EvalError,
        scope: &Arc<Scope>,
    ) -> Flow<Option<(&'h CatchBlock, Arc<Scope>)>> {
        let remote = error.to_remote();
        for handler in handlers {
            if !catches(&handler.test, &remote) {
                continue;
            }
            let inner = match &handler.variable {
                Some(variable) => Scope::child(scope, vec![(variable, exception_value(&remote))]),
                None => scope.clone(),
            };
            if let Some(filter) = &handler.filter {
                let passed = self.eval(filter, inner.clone()).await?;
                if !truthy(&passed)? {
                    continue;
                }
            }
            debug!("Caught {} with handler for {}", remote.kind, handler.test);
            return Ok(Some((handler, inner)));
        }
        Ok(None)
    }

    async fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Node,
        right: &Node,
        method: Option<&crate::ast::MethodDesc>,
        scope: Arc<Scope>,
    ) -> Flow<Value> {
        if op.is_assignment() {
            let value = match op.compound_base() {
                Some(base) => {
                    let current = self.eval(left, scope.clone()).await?;
                    let operand = self.eval(right, scope.clone()).await?;
                    binary(base, &current, &operand)?
                }
                None => self.eval(right, scope.clone()).await?,
            };
            if !matches!(left.expr(), Expr::Parameter { .. }) {
                return Err(EvalError::Unsupported(format!("assignment to {}", left.kind())).into());
            }
            scope.write(left, value.clone())?;
            return Ok(value);
        }

        match op {
            BinaryOp::AndAlso | BinaryOp::OrElse => {
                let short = op == BinaryOp::OrElse;
                let l = self.eval(left, scope.clone()).await?;
                if truthy(&l)? == short {
                    return Ok(Value::Bool(short));
                }
                let r = self.eval(right, scope).await?;
                Ok(Value::Bool(truthy(&r)?))
            }
            BinaryOp::Coalesce => {
                let l = self.eval(left, scope.clone()).await?;
                if l.is_null() {
                    self.eval(right, scope).await
                } else {
                    Ok(l)
                }
            }
            _ => {
                let l = self.eval(left, scope.clone()).await?;
                let r = self.eval(right, scope).await?;
                match method {
                    Some(method) => Ok(self
                        .operators
                        .call(&method.key(), self.context.clone(), vec![l, r])
                        .await?),
                    None => Ok(binary(op, &l, &r)?),
                }
            }
        }
    }

    async fn eval_unary(
        &self,
        op: UnaryOp,
        operand: &Node,
        method: Option<&crate::ast::MethodDesc>,
        ty: &TypeDesc,
        scope: Arc<Scope>,
    ) -> Flow<Value> {
        if op == UnaryOp::Quote {
            return self.eval(operand, scope).await;
        }
        let value = self.eval(operand, scope).await?;
        if let Some(method) = method {
            return Ok(self
                .operators
                .call(&method.key(), self.context.clone(), vec![value])
                .await?);
        }
        let result = match op {
            UnaryOp::Negate => match value {
                Value::Int(i) => Value::Int(i.wrapping_neg()),
                Value::Float(f) => Value::Float(-f),
                other => return Err(invalid("Negate", &other).into()),
            },
            UnaryOp::UnaryPlus => match value {
                Value::Int(_) | Value::Float(_) => value,
                other => return Err(invalid("UnaryPlus", &other).into()),
            },
            UnaryOp::Not => match value {
                Value::Bool(b) => Value::Bool(!b),
                Value::Int(i) => Value::Int(!i),
                other => return Err(invalid("Not", &other).into()),
            },
            UnaryOp::OnesComplement => match value {
                Value::Int(i) => Value::Int(!i),
                other => return Err(invalid("OnesComplement", &other).into()),
            },
            UnaryOp::Increment | UnaryOp::Decrement => {
                let delta = if op == UnaryOp::Increment { 1 } else { -1 };
                match value {
                    Value::Int(i) => Value::Int(i.wrapping_add(delta)),
                    Value::Float(f) => Value::Float(f + delta as f64),
                    other => return Err(invalid(&op.to_string(), &other).into()),
                }
            }
            UnaryOp::IsTrue => Value::Bool(truthy(&value)?),
            UnaryOp::IsFalse => Value::Bool(!truthy(&value)?),
            UnaryOp::Convert | UnaryOp::ConvertChecked => {
                convert(value, ty, op == UnaryOp::ConvertChecked)?
            }
            UnaryOp::TypeAs => {
                if value.is_instance_of(ty) {
                    value
                } else {
                    Value::Null
                }
            }
            UnaryOp::ArrayLength => match value {
                Value::List(items) => Value::Int(items.len() as i64),
                other => return Err(invalid("ArrayLength", &other).into()),
            },
            UnaryOp::Throw => return Err(EvalError::Thrown(thrown(&value)).into()),
            UnaryOp::Quote => value,
        };
        Ok(result)
    }

    async fn apply_initializers(
        &self,
        target: Value,
        initializers: &[ElementInit],
        scope: &Arc<Scope>,
    ) -> Flow<Value> {
        let mut target = target;
        for init in initializers {
            let arguments = self.eval_all(&init.arguments, scope).await?;
            match (&mut target, arguments.as_slice()) {
                (Value::List(items), [item]) => items.push(item.clone()),
                (Value::Bag(bag), [Value::String(key), value]) => bag.insert(key.clone(), value.clone()),
                (other, _) => {
                    return Err(EvalError::Unsupported(format!(
                        "{} on {}",
                        init.add_method.key(),
                        other.type_name()
                    ))
                    .into());
                }
            }
        }
        Ok(target)
    }

    #[async_recursion]
    async fn apply_bindings(
        &self,
        target: Value,
        bindings: &[MemberBinding],
        scope: &Arc<Scope>,
    ) -> Flow<Value> {
        let Value::Bag(mut bag) = target else {
            return Err(EvalError::mismatch(well_known::PROPERTY_BAG, target.type_name()).into());
        };
        for binding in bindings {
            let name = binding.member().name().to_string();
            let value = match binding {
                MemberBinding::Assignment { expression, .. } => {
                    self.eval(expression, scope.clone()).await?
                }
                MemberBinding::List { initializers, .. } => {
                    let current = bag.get(&name).cloned().unwrap_or(Value::List(vec![]));
                    self.apply_initializers(current, initializers, scope).await?
                }
                MemberBinding::Member { bindings, .. } => {
                    let current = bag
                        .get(&name)
                        .cloned()
                        .unwrap_or(Value::Bag(PropertyBag::new()));
                    self.apply_bindings(current, bindings, scope).await?
                }
            };
            bag.insert(name, value);
        }
        Ok(Value::Bag(bag))
    }

    /// A lambda value capturing the scope it was created in.
    fn closure(&self, lambda: &Node, scope: Arc<Scope>) -> Value {
        let interpreter = self.clone();
        let lambda = lambda.clone();
        Value::Host(HostValue::function(move |arguments: Vec<Value>| {
            let interpreter = interpreter.clone();
            let lambda = lambda.clone();
            let scope = scope.clone();
            async move {
                let Expr::Lambda {
                    parameters, body, ..
                } = lambda.expr()
                else {
                    return Err(RemoteError::new(RemoteErrorKind::Stream, "not a lambda"));
                };
                if parameters.len() != arguments.len() {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Stream,
                        format!(
                            "expected {} arguments, got {}",
                            parameters.len(),
                            arguments.len()
                        ),
                    ));
                }
                let inner = Scope::child(&scope, parameters.iter().zip(arguments).collect());
                interpreter
                    .evaluate_in(body, inner)
                    .await
                    .map_err(|e| e.to_remote())
            }
        }))
    }
}

fn invalid(op: &str, value: &Value) -> EvalError {
    EvalError::InvalidOperand {
        op: op.to_string(),
        value: value.to_string(),
    }
}

fn truthy(value: &Value) -> EvalResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| EvalError::mismatch(well_known::BOOL, value.type_name()))
}

pub(crate) fn default_of(ty: &TypeDesc) -> Value {
    match ty.tag() {
        well_known::BOOL => Value::Bool(false),
        well_known::INT => Value::Int(0),
        well_known::FLOAT => Value::Float(0.0),
        _ => Value::Null,
    }
}

/// Equality with numeric promotion between ints and floats.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.as_float()?.partial_cmp(&right.as_float()?),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
    if op.is_comparison() {
        let result = match op {
            BinaryOp::Equal => values_equal(left, right),
            BinaryOp::NotEqual => !values_equal(left, right),
            _ => {
                let ordering = compare(left, right).ok_or_else(|| invalid(&op.to_string(), right))?;
                match op {
                    BinaryOp::LessThan => ordering == Ordering::Less,
                    BinaryOp::LessThanOrEqual => ordering != Ordering::Greater,
                    BinaryOp::GreaterThan => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
        };
        return Ok(Value::Bool(result));
    }

    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_op(op, *a, *b),
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinaryOp::And => Ok(Value::Bool(*a & *b)),
            BinaryOp::Or => Ok(Value::Bool(*a | *b)),
            BinaryOp::ExclusiveOr => Ok(Value::Bool(*a ^ *b)),
            _ => Err(invalid(&op.to_string(), left)),
        },
        (Value::String(_), _) | (_, Value::String(_)) if op == BinaryOp::Add => {
            Ok(Value::String(format!("{}{}", left, right)))
        }
        (Value::List(_), Value::Int(_)) if op == BinaryOp::ArrayIndex => index(left, right),
        _ => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => float_op(op, a, b),
            _ => Err(invalid(&op.to_string(), left)),
        },
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> EvalResult<Value> {
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Subtract => a.wrapping_sub(b),
        BinaryOp::Multiply => a.wrapping_mul(b),
        BinaryOp::Divide | BinaryOp::Modulo if b == 0 => return Err(EvalError::DivideByZero),
        BinaryOp::Divide => a.wrapping_div(b),
        BinaryOp::Modulo => a.wrapping_rem(b),
        BinaryOp::Power if b >= 0 => a.wrapping_pow(exponent(op, b)?),
        BinaryOp::Power => return Ok(Value::Float((a as f64).powf(b as f64))),
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::ExclusiveOr => a ^ b,
        BinaryOp::LeftShift => a.wrapping_shl(exponent(op, b)?),
        BinaryOp::RightShift => a.wrapping_shr(exponent(op, b)?),
        other => return Err(invalid(&other.to_string(), &Value::Int(a))),
    };
    Ok(Value::Int(value))
}

/// Exponents and shift counts must fit a `u32`.
fn exponent(op: BinaryOp, b: i64) -> EvalResult<u32> {
    u32::try_from(b).map_err(|_| invalid(&op.to_string(), &Value::Int(b)))
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> EvalResult<Value> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        BinaryOp::Power => a.powf(b),
        other => return Err(invalid(&other.to_string(), &Value::Float(a))),
    };
    Ok(Value::Float(value))
}

fn index(target: &Value, key: &Value) -> EvalResult<Value> {
    match (target, key) {
        (Value::List(items), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|at| items.get(at))
            .cloned()
            .ok_or(EvalError::IndexOutOfRange {
                index: *i,
                length: items.len(),
            }),
        (Value::Bag(bag), Value::String(name)) => bag
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::MissingMember(name.clone())),
        (target, _) => Err(invalid("Index", target)),
    }
}

fn read_member(target: &Value, name: &str) -> EvalResult<Value> {
    match (target, name) {
        (Value::Bag(bag), _) => bag
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::MissingMember(name.to_string())),
        (Value::List(items), "Count" | "Length") => Ok(Value::Int(items.len() as i64)),
        (Value::String(s), "Length") => Ok(Value::Int(s.chars().count() as i64)),
        (Value::Null, _) => Err(EvalError::MissingMember(format!("{} on null", name))),
        (other, _) => Err(EvalError::MissingMember(format!(
            "{}.{}",
            other.type_name(),
            name
        ))),
    }
}

fn convert(value: Value, ty: &TypeDesc, checked: bool) -> EvalResult<Value> {
    let converted = match (ty.tag(), value) {
        (well_known::INT, Value::Float(f)) => {
            if checked && (f.is_nan() || f < i64::MIN as f64 || f > i64::MAX as f64) {
                return Err(invalid("ConvertChecked", &Value::Float(f)));
            }
            Value::Int(f as i64)
        }
        (well_known::FLOAT, Value::Int(i)) => Value::Float(i as f64),
        (well_known::STRING, Value::Null) => Value::Null,
        (well_known::STRING, v) => Value::String(v.to_string()),
        (well_known::OBJECT, v) => v,
        (_, v) if v.is_null() || v.is_instance_of(ty) => v,
        (_, v) => return Err(EvalError::mismatch(ty.to_string(), v.type_name())),
    };
    Ok(converted)
}

/// Whether a catch clause for `test` handles `error`.
fn catches(test: &TypeDesc, error: &RemoteError) -> bool {
    match test.tag() {
        well_known::EXCEPTION | well_known::OBJECT => true,
        other => other == error.kind.to_string(),
    }
}

fn exception_value(error: &RemoteError) -> Value {
    Value::Bag(
        PropertyBag::new()
            .with("Kind", Value::String(error.kind.to_string()))
            .with("Message", Value::String(error.message.clone())),
    )
}

/// The error raised by a `Throw` of `value`.
fn thrown(value: &Value) -> RemoteError {
    match value {
        Value::Bag(bag) => match bag.get("Message").and_then(Value::as_str) {
            Some(message) => RemoteError::user(message),
            None => RemoteError::user(value.to_string()),
        },
        Value::Null => RemoteError::user("Exception"),
        other => RemoteError::user(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{LabelTarget, MethodDefinition, MethodDesc, build};
    use pretty_assertions::assert_eq;

    fn interpreter() -> Interpreter {
        Interpreter::new(
            Arc::new(OperatorRegistry::standard()),
            OperatorContext::default(),
        )
    }

    #[tokio::test]
    async fn test_arithmetic_and_promotion() {
        let plan = build::binary(
            BinaryOp::Multiply,
            build::add(build::int(2), build::int(3)),
            build::float(1.5),
        );
        assert_eq!(interpreter().evaluate(&plan).await, Ok(Value::Float(7.5)));

        let divide = build::binary(BinaryOp::Divide, build::int(1), build::int(0));
        assert_eq!(
            interpreter().evaluate(&divide).await,
            Err(EvalError::DivideByZero)
        );
    }

    #[tokio::test]
    async fn test_lambda_closure_and_invocation() {
        let x = build::parameter("x", TypeDesc::int());
        let add_one = build::lambda(vec![x.clone()], build::add(x, build::int(1)));
        let plan = build::invoke(add_one, vec![build::int(41)]);
        assert_eq!(interpreter().evaluate(&plan).await, Ok(Value::Int(42)));
    }

    #[tokio::test]
    async fn test_loop_with_break_and_assignment() {
        // i = 0; loop { if i >= 5 break i; i += 1 }
        let i = build::parameter("i", TypeDesc::int());
        let exit = LabelTarget::new(Some("exit"), TypeDesc::int());
        let body = build::conditional(
            build::binary(BinaryOp::GreaterThanOrEqual, i.clone(), build::int(5)),
            build::break_to(exit.clone(), Some(i.clone())),
            build::binary(BinaryOp::AddAssign, i.clone(), build::int(1)),
        );
        let plan = build::block(
            vec![i.clone()],
            vec![
                build::assign(i.clone(), build::int(0)),
                build::loop_with(body, Some(exit), None),
            ],
        );
        assert_eq!(interpreter().evaluate(&plan).await, Ok(Value::Int(5)));
    }

    #[tokio::test]
    async fn test_endless_loop_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let interpreter = Interpreter::new(
            Arc::new(OperatorRegistry::standard()),
            OperatorContext::default().with_cancel(cancel.clone()),
        );
        let plan = build::loop_with(build::int(0), None, None);
        let running = tokio::spawn(async move { interpreter.evaluate(&plan).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), running)
            .await
            .expect("loop kept running after cancellation")
            .unwrap();
        assert_eq!(result, Err(EvalError::Cancelled));
    }

    #[tokio::test]
    async fn test_oversized_shift_and_exponent_are_rejected() {
        let shift = build::binary(BinaryOp::LeftShift, build::int(1), build::int(1 << 32));
        assert!(matches!(
            interpreter().evaluate(&shift).await,
            Err(EvalError::InvalidOperand { .. })
        ));

        let negative = build::binary(BinaryOp::RightShift, build::int(8), build::int(-1));
        assert!(matches!(
            interpreter().evaluate(&negative).await,
            Err(EvalError::InvalidOperand { .. })
        ));

        let power = build::binary(BinaryOp::Power, build::int(1), build::int(u32::MAX as i64 + 1));
        assert!(matches!(
            interpreter().evaluate(&power).await,
            Err(EvalError::InvalidOperand { .. })
        ));

        let shift = build::binary(BinaryOp::LeftShift, build::int(1), build::int(4));
        assert_eq!(interpreter().evaluate(&shift).await, Ok(Value::Int(16)));
    }

    #[tokio::test]
    async fn test_return_label_in_block() {
        let ret = LabelTarget::new(Some("ret"), TypeDesc::int());
        let plan = build::block(
            vec![],
            vec![
                build::return_to(ret.clone(), Some(build::int(7))),
                build::int(100),
                build::label(ret, Some(build::int(0))),
            ],
        );
        assert_eq!(interpreter().evaluate(&plan).await, Ok(Value::Int(7)));
    }

    #[tokio::test]
    async fn test_try_catch_finally() {
        let counter = build::parameter("counter", TypeDesc::int());
        let e = build::parameter("e", TypeDesc::exception());
        let body = build::throw(build::string("boom"), TypeDesc::int());
        let handler = build::catch(
            TypeDesc::exception(),
            Some(e.clone()),
            build::property(e, "Message", TypeDesc::string()),
        );
        let plan = build::block(
            vec![counter.clone()],
            vec![
                build::try_full(
                    body,
                    vec![handler],
                    Some(build::binary(BinaryOp::AddAssign, counter.clone(), build::int(1))),
                    None,
                ),
                counter.clone(),
            ],
        );
        assert_eq!(interpreter().evaluate(&plan).await, Ok(Value::Int(1)));

        let uncaught = build::try_catch(
            build::throw(build::string("boom"), TypeDesc::int()),
            vec![build::catch(TypeDesc::named("Transport"), None, build::int(0))],
        );
        assert_eq!(
            interpreter().evaluate(&uncaught).await,
            Err(EvalError::Thrown(RemoteError::user("boom")))
        );
    }

    #[tokio::test]
    async fn test_switch_and_type_tests() {
        let plan = build::switch(
            build::int(2),
            vec![
                build::case(vec![build::int(1)], build::string("one")),
                build::case(vec![build::int(2), build::int(3)], build::string("few")),
            ],
            Some(build::string("many")),
        );
        assert_eq!(interpreter().evaluate(&plan).await, Ok(Value::from("few")));

        let is_string = build::type_is(build::string("x"), TypeDesc::string());
        assert_eq!(interpreter().evaluate(&is_string).await, Ok(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_unknown_operator() {
        let method = MethodDesc::simple(
            MethodDefinition::new(TypeDesc::named("Shell"), "Run", vec![], TypeDesc::int())
                .static_method(),
        );
        let plan = build::call(None, method, vec![]);
        assert_eq!(
            interpreter().evaluate(&plan).await,
            Err(EvalError::UnknownOperator("Shell.Run".to_string()))
        );
    }

    #[tokio::test]
    async fn test_escaping_jump_is_rejected() {
        let outside = LabelTarget::new(None, TypeDesc::unit());
        let plan = build::goto(crate::ast::GotoKind::Goto, outside, None);
        assert_eq!(
            interpreter().evaluate(&plan).await,
            Err(EvalError::InvalidJump)
        );
    }
}
