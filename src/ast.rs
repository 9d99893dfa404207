//! # Plan Node Model
//!
//! A plan is an immutable tree of [`Node`]s describing a composed query. Every
//! node carries a [`NodeKind`]-tagged [`Expr`] and the [`TypeDesc`] of the
//! value it produces.
//!
//! ## Identity
//!
//! Nodes are reference counted and identity matters: a lambda parameter is a
//! single `Parameter` node referenced from the lambda's parameter list and from
//! every use site in its body. Two structurally equal parameter nodes are *not*
//! the same parameter. [`Node::ptr_eq`] is the identity test, and the
//! serializer, deserializer and rewriting visitors all preserve it.
//!
//! ```text
//!   Lambda ──params──▶ Parameter(x) ◀──┐
//!     │                                │
//!     └──body──▶ Binary(Add) ──left────┘
//!                    └───────right──▶ Parameter(x)  (same node)
//! ```
//!
//! [`LabelTarget`]s are shared the same way between `Goto`, `Label` and
//! `Loop` nodes.
//!
//! ## Node kinds
//!
//! The set of kinds is closed. Four kinds ([`NodeKind::CatchBlock`],
//! [`NodeKind::SwitchCase`], [`NodeKind::MemberBinding`],
//! [`NodeKind::ElementInit`]) only exist embedded in a parent node and never
//! as a standalone [`Node`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};
use thiserror::Error;

use crate::value::Value;

pub mod build;
pub mod descriptor;
pub mod equality;
pub mod serializer;
pub mod wire;

pub use descriptor::{
    ConstructorDesc, FieldDesc, MemberDesc, MethodDefinition, MethodDesc, PropertyDesc, TypeDesc,
    well_known,
};
pub use equality::{
    EqualityOutcome, EquivalenceStrategy, PlanEqualityComparator, StructuralEquivalence,
    plan_equals,
};
pub use serializer::{
    PlanDeserializer, PlanLimits, PlanSerializer, from_wire, from_wire_with_limits, to_wire,
};
pub use wire::WirePlan;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("Unknown node kind tag: {0}")]
    UnknownKind(u8),
    #[error("Node kind {0} is only valid embedded in a parent node")]
    EmbeddedKind(NodeKind),
    #[error("Wire node {index} is tagged {tagged} but carries a {found} body")]
    KindMismatch {
        index: u32,
        tagged: NodeKind,
        found: NodeKind,
    },
    #[error("Node {parent} references node {child} which is not serialized before it")]
    ForwardReference { parent: u32, child: u32 },
    #[error("Reference to missing node {0}")]
    DanglingReference(u32),
    #[error("Reference to missing label {0}")]
    DanglingLabel(u32),
    #[error("Constant of type {0} has no remote representation")]
    UnrepresentableConstant(String),
    #[error("Generic method {method} expects {expected} type arguments, found {found}")]
    GenericArity {
        method: String,
        expected: usize,
        found: usize,
    },
    #[error("Plan has {count} nodes, the limit is {limit}")]
    TooManyNodes { count: usize, limit: usize },
    #[error("Plan nesting exceeds the depth limit of {limit}")]
    TooDeep { limit: usize },
}

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum NodeKind {
    Binary = 0,
    Block = 1,
    Conditional = 2,
    Constant = 3,
    Default = 4,
    Goto = 5,
    Index = 6,
    Invocation = 7,
    Label = 8,
    Lambda = 9,
    ListInit = 10,
    Loop = 11,
    MemberAccess = 12,
    MemberInit = 13,
    Call = 14,
    New = 15,
    NewArray = 16,
    Parameter = 17,
    RuntimeVariables = 18,
    Switch = 19,
    Try = 20,
    TypeBinary = 21,
    Unary = 22,
    CatchBlock = 23,
    SwitchCase = 24,
    MemberBinding = 25,
    ElementInit = 26,
}

impl NodeKind {
    /// Kinds that only appear inside a parent node.
    pub fn is_embedded(&self) -> bool {
        matches!(
            self,
            NodeKind::CatchBlock
                | NodeKind::SwitchCase
                | NodeKind::MemberBinding
                | NodeKind::ElementInit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    And,
    Or,
    ExclusiveOr,
    AndAlso,
    OrElse,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Coalesce,
    LeftShift,
    RightShift,
    ArrayIndex,
    Assign,
    AddAssign,
    SubtractAssign,
    MultiplyAssign,
    DivideAssign,
}

impl BinaryOp {
    pub fn is_assignment(&self) -> bool {
        matches!(
            self,
            BinaryOp::Assign
                | BinaryOp::AddAssign
                | BinaryOp::SubtractAssign
                | BinaryOp::MultiplyAssign
                | BinaryOp::DivideAssign
        )
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    /// The arithmetic operator behind a compound assignment.
    pub fn compound_base(&self) -> Option<BinaryOp> {
        match self {
            BinaryOp::AddAssign => Some(BinaryOp::Add),
            BinaryOp::SubtractAssign => Some(BinaryOp::Subtract),
            BinaryOp::MultiplyAssign => Some(BinaryOp::Multiply),
            BinaryOp::DivideAssign => Some(BinaryOp::Divide),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Not,
    OnesComplement,
    UnaryPlus,
    Increment,
    Decrement,
    IsTrue,
    IsFalse,
    Convert,
    ConvertChecked,
    TypeAs,
    ArrayLength,
    Quote,
    Throw,
}

impl UnaryOp {
    pub fn is_explicit_conversion(&self) -> bool {
        matches!(self, UnaryOp::Convert | UnaryOp::ConvertChecked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum GotoKind {
    Goto,
    Return,
    Break,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum TypeBinaryOp {
    TypeIs,
    TypeEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum NewArrayKind {
    Init,
    Bounds,
}

#[derive(Debug)]
pub struct LabelData {
    pub name: Option<String>,
    pub ty: TypeDesc,
}

/// Jump target shared by identity between `Goto`, `Label` and `Loop` nodes.
#[derive(Clone)]
pub struct LabelTarget(Arc<LabelData>);

impl LabelTarget {
    pub fn new(name: Option<&str>, ty: TypeDesc) -> Self {
        Self(Arc::new(LabelData {
            name: name.map(str::to_string),
            ty,
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn ty(&self) -> &TypeDesc {
        &self.0.ty
    }

    pub fn ptr_eq(a: &LabelTarget, b: &LabelTarget) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Address-based identity, stable while any clone is alive.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for LabelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({})", self.name().unwrap_or("<anon>"))
    }
}

#[derive(Debug, Clone)]
pub struct CatchBlock {
    pub test: TypeDesc,
    pub variable: Option<Node>,
    pub body: Node,
    pub filter: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub test_values: Vec<Node>,
    pub body: Node,
}

#[derive(Debug, Clone)]
pub struct ElementInit {
    pub add_method: MethodDesc,
    pub arguments: Vec<Node>,
}

#[derive(Debug, Clone)]
pub enum MemberBinding {
    Assignment {
        member: MemberDesc,
        expression: Node,
    },
    List {
        member: MemberDesc,
        initializers: Vec<ElementInit>,
    },
    Member {
        member: MemberDesc,
        bindings: Vec<MemberBinding>,
    },
}

impl MemberBinding {
    pub fn member(&self) -> &MemberDesc {
        match self {
            MemberBinding::Assignment { member, .. }
            | MemberBinding::List { member, .. }
            | MemberBinding::Member { member, .. } => member,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Binary {
        op: BinaryOp,
        left: Node,
        right: Node,
        method: Option<MethodDesc>,
    },
    Block {
        variables: Vec<Node>,
        expressions: Vec<Node>,
    },
    Conditional {
        test: Node,
        if_true: Node,
        if_false: Node,
    },
    Constant(Value),
    Default,
    Goto {
        kind: GotoKind,
        target: LabelTarget,
        value: Option<Node>,
    },
    Index {
        object: Node,
        indexer: Option<PropertyDesc>,
        arguments: Vec<Node>,
    },
    Invocation {
        target: Node,
        arguments: Vec<Node>,
    },
    Label {
        target: LabelTarget,
        default_value: Option<Node>,
    },
    Lambda {
        name: Option<String>,
        parameters: Vec<Node>,
        body: Node,
    },
    ListInit {
        new_expr: Node,
        initializers: Vec<ElementInit>,
    },
    Loop {
        body: Node,
        break_label: Option<LabelTarget>,
        continue_label: Option<LabelTarget>,
    },
    MemberAccess {
        object: Option<Node>,
        member: MemberDesc,
    },
    MemberInit {
        new_expr: Node,
        bindings: Vec<MemberBinding>,
    },
    Call {
        object: Option<Node>,
        method: MethodDesc,
        arguments: Vec<Node>,
    },
    New {
        constructor: Option<ConstructorDesc>,
        arguments: Vec<Node>,
        members: Vec<MemberDesc>,
    },
    NewArray {
        kind: NewArrayKind,
        expressions: Vec<Node>,
    },
    Parameter {
        name: String,
        by_ref: bool,
    },
    RuntimeVariables {
        variables: Vec<Node>,
    },
    Switch {
        value: Node,
        cases: Vec<SwitchCase>,
        default_body: Option<Node>,
        comparison: Option<MethodDesc>,
    },
    Try {
        body: Node,
        handlers: Vec<CatchBlock>,
        finally: Option<Node>,
        fault: Option<Node>,
    },
    TypeBinary {
        op: TypeBinaryOp,
        operand: Node,
        type_operand: TypeDesc,
    },
    Unary {
        op: UnaryOp,
        operand: Node,
        method: Option<MethodDesc>,
    },
}

impl Expr {
    pub fn children(&self) -> Vec<Node> {
        let mut out = Vec::new();
        fn push_inits(out: &mut Vec<Node>, inits: &[ElementInit]) {
            for init in inits {
                out.extend(init.arguments.iter().cloned());
            }
        }
        fn push_bindings(out: &mut Vec<Node>, bindings: &[MemberBinding]) {
            for binding in bindings {
                match binding {
                    MemberBinding::Assignment { expression, .. } => out.push(expression.clone()),
                    MemberBinding::List { initializers, .. } => push_inits(out, initializers),
                    MemberBinding::Member { bindings, .. } => push_bindings(out, bindings),
                }
            }
        }
        match self {
            Expr::Binary { left, right, .. } => {
                out.push(left.clone());
                out.push(right.clone());
            }
            Expr::Block {
                variables,
                expressions,
            } => {
                out.extend(variables.iter().cloned());
                out.extend(expressions.iter().cloned());
            }
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                out.push(test.clone());
                out.push(if_true.clone());
                out.push(if_false.clone());
            }
            Expr::Constant(_) | Expr::Default | Expr::Parameter { .. } => {}
            Expr::Goto { value, .. } => out.extend(value.iter().cloned()),
            Expr::Index {
                object, arguments, ..
            } => {
                out.push(object.clone());
                out.extend(arguments.iter().cloned());
            }
            Expr::Invocation { target, arguments } => {
                out.push(target.clone());
                out.extend(arguments.iter().cloned());
            }
            Expr::Label { default_value, .. } => out.extend(default_value.iter().cloned()),
            Expr::Lambda {
                parameters, body, ..
            } => {
                out.extend(parameters.iter().cloned());
                out.push(body.clone());
            }
            Expr::ListInit {
                new_expr,
                initializers,
            } => {
                out.push(new_expr.clone());
                push_inits(&mut out, initializers);
            }
            Expr::Loop { body, .. } => out.push(body.clone()),
            Expr::MemberAccess { object, .. } => out.extend(object.iter().cloned()),
            Expr::MemberInit { new_expr, bindings } => {
                out.push(new_expr.clone());
                push_bindings(&mut out, bindings);
            }
            Expr::Call {
                object, arguments, ..
            } => {
                out.extend(object.iter().cloned());
                out.extend(arguments.iter().cloned());
            }
            Expr::New { arguments, .. } => out.extend(arguments.iter().cloned()),
            Expr::NewArray { expressions, .. } => out.extend(expressions.iter().cloned()),
            Expr::RuntimeVariables { variables } => out.extend(variables.iter().cloned()),
            Expr::Switch {
                value,
                cases,
                default_body,
                ..
            } => {
                out.push(value.clone());
                for case in cases {
                    out.extend(case.test_values.iter().cloned());
                    out.push(case.body.clone());
                }
                out.extend(default_body.iter().cloned());
            }
            Expr::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                out.push(body.clone());
                for handler in handlers {
                    out.extend(handler.variable.iter().cloned());
                    out.extend(handler.filter.iter().cloned());
                    out.push(handler.body.clone());
                }
                out.extend(finally.iter().cloned());
                out.extend(fault.iter().cloned());
            }
            Expr::TypeBinary { operand, .. } | Expr::Unary { operand, .. } => {
                out.push(operand.clone())
            }
        }
        out
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Expr::Binary { .. } => NodeKind::Binary,
            Expr::Block { .. } => NodeKind::Block,
            Expr::Conditional { .. } => NodeKind::Conditional,
            Expr::Constant(_) => NodeKind::Constant,
            Expr::Default => NodeKind::Default,
            Expr::Goto { .. } => NodeKind::Goto,
            Expr::Index { .. } => NodeKind::Index,
            Expr::Invocation { .. } => NodeKind::Invocation,
            Expr::Label { .. } => NodeKind::Label,
            Expr::Lambda { .. } => NodeKind::Lambda,
            Expr::ListInit { .. } => NodeKind::ListInit,
            Expr::Loop { .. } => NodeKind::Loop,
            Expr::MemberAccess { .. } => NodeKind::MemberAccess,
            Expr::MemberInit { .. } => NodeKind::MemberInit,
            Expr::Call { .. } => NodeKind::Call,
            Expr::New { .. } => NodeKind::New,
            Expr::NewArray { .. } => NodeKind::NewArray,
            Expr::Parameter { .. } => NodeKind::Parameter,
            Expr::RuntimeVariables { .. } => NodeKind::RuntimeVariables,
            Expr::Switch { .. } => NodeKind::Switch,
            Expr::Try { .. } => NodeKind::Try,
            Expr::TypeBinary { .. } => NodeKind::TypeBinary,
            Expr::Unary { .. } => NodeKind::Unary,
        }
    }
}

#[derive(Debug)]
pub struct NodeData {
    ty: TypeDesc,
    expr: Expr,
}

// Deep chains are released with an explicit stack. Children that this node
// solely owns are detached and pushed instead of being dropped in place.
impl Drop for NodeData {
    fn drop(&mut self) {
        let mut pending = detach(&mut self.expr);
        while let Some(Node(node)) = pending.pop() {
            if let Some(mut data) = Arc::into_inner(node) {
                pending.extend(detach(&mut data.expr));
            }
        }
    }
}

fn detach(expr: &mut Expr) -> Vec<Node> {
    let children = expr.children();
    if !children.is_empty() {
        *expr = Expr::Default;
    }
    children
}

/// Immutable, shared plan node.
#[derive(Clone)]
pub struct Node(Arc<NodeData>);

impl Node {
    pub fn new(ty: TypeDesc, expr: Expr) -> Self {
        Self(Arc::new(NodeData { ty, expr }))
    }

    pub fn ty(&self) -> &TypeDesc {
        &self.0.ty
    }

    pub fn expr(&self) -> &Expr {
        &self.0.expr
    }

    pub fn kind(&self) -> NodeKind {
        self.0.expr.kind()
    }

    pub fn ptr_eq(a: &Node, b: &Node) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Address-based identity, stable while any clone is alive.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self.expr() {
            Expr::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn parameter_name(&self) -> Option<&str> {
        match self.expr() {
            Expr::Parameter { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Direct child nodes, including those held by embedded parts.
    pub fn children(&self) -> Vec<Node> {
        self.expr().children()
    }

    /// Rebuilds this node's expression with every direct child passed through
    /// `f`, together with the type expected at that position when one is
    /// implied by the parent (method parameters, lambda return type, ...).
    ///
    /// Returns `None` when `f` returned every child unchanged.
    pub fn try_map_children<E>(
        &self,
        f: &mut dyn FnMut(&Node, Option<&TypeDesc>) -> Result<Node, E>,
    ) -> Result<Option<Expr>, E> {
        let mut m = ChildMapper { f, changed: false };
        let expr = match self.expr() {
            Expr::Binary {
                op,
                left,
                right,
                method,
            } => Expr::Binary {
                op: *op,
                left: m.one(left, None)?,
                right: m.one(right, None)?,
                method: method.clone(),
            },
            Expr::Block {
                variables,
                expressions,
            } => Expr::Block {
                variables: m.all(variables, None)?,
                expressions: m.all(expressions, None)?,
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Expr::Conditional {
                test: m.one(test, Some(&TypeDesc::bool()))?,
                if_true: m.one(if_true, Some(self.ty()))?,
                if_false: m.one(if_false, Some(self.ty()))?,
            },
            Expr::Constant(_) | Expr::Default | Expr::Parameter { .. } => return Ok(None),
            Expr::Goto {
                kind,
                target,
                value,
            } => Expr::Goto {
                kind: *kind,
                target: target.clone(),
                value: m.opt(value.as_ref(), Some(target.ty()))?,
            },
            Expr::Index {
                object,
                indexer,
                arguments,
            } => Expr::Index {
                object: m.one(object, None)?,
                indexer: indexer.clone(),
                arguments: m.all(arguments, None)?,
            },
            Expr::Invocation { target, arguments } => {
                let params = match target.ty() {
                    TypeDesc::Function { params, .. } => params.clone(),
                    _ => Vec::new(),
                };
                Expr::Invocation {
                    target: m.one(target, None)?,
                    arguments: m.each(arguments, &params)?,
                }
            }
            Expr::Label {
                target,
                default_value,
            } => Expr::Label {
                target: target.clone(),
                default_value: m.opt(default_value.as_ref(), Some(target.ty()))?,
            },
            Expr::Lambda {
                name,
                parameters,
                body,
            } => Expr::Lambda {
                name: name.clone(),
                parameters: m.all(parameters, None)?,
                body: m.one(body, self.ty().return_type())?,
            },
            Expr::ListInit {
                new_expr,
                initializers,
            } => Expr::ListInit {
                new_expr: m.one(new_expr, Some(self.ty()))?,
                initializers: m.inits(initializers)?,
            },
            Expr::Loop {
                body,
                break_label,
                continue_label,
            } => Expr::Loop {
                body: m.one(body, None)?,
                break_label: break_label.clone(),
                continue_label: continue_label.clone(),
            },
            Expr::MemberAccess { object, member } => Expr::MemberAccess {
                object: m.opt(object.as_ref(), Some(member.declaring()))?,
                member: member.clone(),
            },
            Expr::MemberInit { new_expr, bindings } => Expr::MemberInit {
                new_expr: m.one(new_expr, Some(self.ty()))?,
                bindings: m.bindings(bindings)?,
            },
            Expr::Call {
                object,
                method,
                arguments,
            } => Expr::Call {
                object: m.opt(object.as_ref(), Some(method.declaring()))?,
                method: method.clone(),
                arguments: m.each(arguments, &method.parameter_types())?,
            },
            Expr::New {
                constructor,
                arguments,
                members,
            } => {
                let params = constructor
                    .as_ref()
                    .map(|c| c.params.clone())
                    .unwrap_or_default();
                Expr::New {
                    constructor: constructor.clone(),
                    arguments: m.each(arguments, &params)?,
                    members: members.clone(),
                }
            }
            Expr::NewArray { kind, expressions } => {
                let element = match kind {
                    NewArrayKind::Init => self.ty().element_type().cloned(),
                    NewArrayKind::Bounds => Some(TypeDesc::int()),
                };
                Expr::NewArray {
                    kind: *kind,
                    expressions: m.all(expressions, element.as_ref())?,
                }
            }
            Expr::RuntimeVariables { variables } => Expr::RuntimeVariables {
                variables: m.all(variables, None)?,
            },
            Expr::Switch {
                value,
                cases,
                default_body,
                comparison,
            } => Expr::Switch {
                value: m.one(value, None)?,
                cases: cases
                    .iter()
                    .map(|case| {
                        Ok(SwitchCase {
                            test_values: m.all(&case.test_values, Some(value.ty()))?,
                            body: m.one(&case.body, Some(self.ty()))?,
                        })
                    })
                    .collect::<Result<_, E>>()?,
                default_body: m.opt(default_body.as_ref(), Some(self.ty()))?,
                comparison: comparison.clone(),
            },
            Expr::Try {
                body,
                handlers,
                finally,
                fault,
            } => Expr::Try {
                body: m.one(body, Some(self.ty()))?,
                handlers: handlers
                    .iter()
                    .map(|h| {
                        Ok(CatchBlock {
                            test: h.test.clone(),
                            variable: m.opt(h.variable.as_ref(), None)?,
                            body: m.one(&h.body, Some(self.ty()))?,
                            filter: m.opt(h.filter.as_ref(), Some(&TypeDesc::bool()))?,
                        })
                    })
                    .collect::<Result<_, E>>()?,
                finally: m.opt(finally.as_ref(), None)?,
                fault: m.opt(fault.as_ref(), None)?,
            },
            Expr::TypeBinary {
                op,
                operand,
                type_operand,
            } => Expr::TypeBinary {
                op: *op,
                operand: m.one(operand, None)?,
                type_operand: type_operand.clone(),
            },
            Expr::Unary {
                op,
                operand,
                method,
            } => Expr::Unary {
                op: *op,
                operand: m.one(operand, None)?,
                method: method.clone(),
            },
        };
        Ok(if m.changed { Some(expr) } else { None })
    }
}

struct ChildMapper<'f, E> {
    f: &'f mut dyn FnMut(&Node, Option<&TypeDesc>) -> Result<Node, E>,
    changed: bool,
}

impl<E> ChildMapper<'_, E> {
    fn one(&mut self, node: &Node, hint: Option<&TypeDesc>) -> Result<Node, E> {
        let mapped = (self.f)(node, hint)?;
        if !Node::ptr_eq(&mapped, node) {
            self.changed = true;
        }
        Ok(mapped)
    }

    fn opt(&mut self, node: Option<&Node>, hint: Option<&TypeDesc>) -> Result<Option<Node>, E> {
        node.map(|n| self.one(n, hint)).transpose()
    }

    fn all(&mut self, nodes: &[Node], hint: Option<&TypeDesc>) -> Result<Vec<Node>, E> {
        nodes.iter().map(|n| self.one(n, hint)).collect()
    }

    fn each(&mut self, nodes: &[Node], hints: &[TypeDesc]) -> Result<Vec<Node>, E> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, n)| self.one(n, hints.get(i)))
            .collect()
    }

    fn inits(&mut self, inits: &[ElementInit]) -> Result<Vec<ElementInit>, E> {
        inits
            .iter()
            .map(|init| {
                Ok(ElementInit {
                    add_method: init.add_method.clone(),
                    arguments: self.each(&init.arguments, &init.add_method.parameter_types())?,
                })
            })
            .collect()
    }

    fn bindings(&mut self, bindings: &[MemberBinding]) -> Result<Vec<MemberBinding>, E> {
        bindings
            .iter()
            .map(|binding| {
                Ok(match binding {
                    MemberBinding::Assignment { member, expression } => {
                        MemberBinding::Assignment {
                            member: member.clone(),
                            expression: self.one(expression, Some(&member.value_type()))?,
                        }
                    }
                    MemberBinding::List {
                        member,
                        initializers,
                    } => MemberBinding::List {
                        member: member.clone(),
                        initializers: self.inits(initializers)?,
                    },
                    MemberBinding::Member { member, bindings } => MemberBinding::Member {
                        member: member.clone(),
                        bindings: self.bindings(bindings)?,
                    },
                })
            })
            .collect()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expr() {
            Expr::Parameter { name, .. } => write!(f, "Parameter({}: {})", name, self.ty()),
            Expr::Constant(v) => write!(f, "Constant({:?}: {})", v, self.ty()),
            expr => f
                .debug_struct("Node")
                .field("ty", self.ty())
                .field("expr", expr)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::build;
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_embedded_kinds() {
        let embedded: Vec<NodeKind> = NodeKind::iter().filter(|k| k.is_embedded()).collect();
        assert_eq!(
            embedded,
            vec![
                NodeKind::CatchBlock,
                NodeKind::SwitchCase,
                NodeKind::MemberBinding,
                NodeKind::ElementInit
            ]
        );
        assert_eq!(NodeKind::from_repr(14), Some(NodeKind::Call));
        assert_eq!(NodeKind::from_repr(27), None);
    }

    #[test]
    fn test_map_children_unchanged_returns_none() {
        let x = build::parameter("x", TypeDesc::int());
        let body = build::add(x.clone(), build::int(1));
        let mapped = body
            .try_map_children::<()>(&mut |n, _| Ok(n.clone()))
            .unwrap();
        assert!(mapped.is_none());
    }

    #[test]
    fn test_map_children_passes_parameter_hints() {
        let method = MethodDefinition::new(
            TypeDesc::named("Math"),
            "Abs",
            vec![TypeDesc::float()],
            TypeDesc::float(),
        )
        .static_method();
        let call = build::call(None, MethodDesc::simple(method), vec![build::float(1.0)]);
        let mut hints = Vec::new();
        call.try_map_children::<()>(&mut |n, hint| {
            hints.push(hint.cloned());
            Ok(n.clone())
        })
        .unwrap();
        assert_eq!(hints, vec![Some(TypeDesc::float())]);
    }

    #[test]
    fn test_children_include_embedded_parts() {
        let handler_body = build::int(0);
        let node = build::try_catch(
            build::int(1),
            vec![CatchBlock {
                test: TypeDesc::exception(),
                variable: None,
                body: handler_body.clone(),
                filter: None,
            }],
        );
        let children = node.children();
        assert_eq!(children.len(), 2);
        assert!(Node::ptr_eq(&children[1], &handler_body));
    }
}
