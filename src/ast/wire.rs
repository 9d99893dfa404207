//! Transmission form of a plan.
//!
//! A [`WirePlan`] is a flat arena. Every node refers to its children by
//! index, and children always precede their parents, so a plan is acyclic
//! by construction and a shared sub-node appears exactly once.

use serde::{Deserialize, Serialize};

use super::{
    BinaryOp, ConstructorDesc, FieldDesc, GotoKind, MethodDefinition, NewArrayKind, NodeKind,
    PropertyDesc, TypeBinaryOp, TypeDesc, UnaryOp,
};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelRef(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePlan {
    pub nodes: Vec<WireNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<WireLabel>,
    pub root: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNode {
    /// `NodeKind` tag, checked against the body on reconstruction.
    pub kind: u8,
    pub ty: TypeDesc,
    pub body: WireBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLabel {
    pub name: Option<String>,
    pub ty: TypeDesc,
}

/// Closed generic methods travel as open definition plus type arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMethod {
    pub definition: MethodDefinition,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_args: Vec<TypeDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMember {
    Field(FieldDesc),
    Property(PropertyDesc),
    Method(WireMethod),
    Constructor(ConstructorDesc),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCatch {
    pub test: TypeDesc,
    pub variable: Option<NodeRef>,
    pub body: NodeRef,
    pub filter: Option<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSwitchCase {
    pub test_values: Vec<NodeRef>,
    pub body: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireElementInit {
    pub add_method: WireMethod,
    pub arguments: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireBinding {
    Assignment {
        member: WireMember,
        expression: NodeRef,
    },
    List {
        member: WireMember,
        initializers: Vec<WireElementInit>,
    },
    Member {
        member: WireMember,
        bindings: Vec<WireBinding>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireBody {
    Binary {
        op: BinaryOp,
        left: NodeRef,
        right: NodeRef,
        method: Option<WireMethod>,
    },
    Block {
        variables: Vec<NodeRef>,
        expressions: Vec<NodeRef>,
    },
    Conditional {
        test: NodeRef,
        if_true: NodeRef,
        if_false: NodeRef,
    },
    Constant(Value),
    Default,
    Goto {
        kind: GotoKind,
        target: LabelRef,
        value: Option<NodeRef>,
    },
    Index {
        object: NodeRef,
        indexer: Option<PropertyDesc>,
        arguments: Vec<NodeRef>,
    },
    Invocation {
        target: NodeRef,
        arguments: Vec<NodeRef>,
    },
    Label {
        target: LabelRef,
        default_value: Option<NodeRef>,
    },
    Lambda {
        name: Option<String>,
        parameters: Vec<NodeRef>,
        body: NodeRef,
    },
    ListInit {
        new_expr: NodeRef,
        initializers: Vec<WireElementInit>,
    },
    Loop {
        body: NodeRef,
        break_label: Option<LabelRef>,
        continue_label: Option<LabelRef>,
    },
    MemberAccess {
        object: Option<NodeRef>,
        member: WireMember,
    },
    MemberInit {
        new_expr: NodeRef,
        bindings: Vec<WireBinding>,
    },
    Call {
        object: Option<NodeRef>,
        method: WireMethod,
        arguments: Vec<NodeRef>,
    },
    New {
        constructor: Option<ConstructorDesc>,
        arguments: Vec<NodeRef>,
        members: Vec<WireMember>,
    },
    NewArray {
        kind: NewArrayKind,
        expressions: Vec<NodeRef>,
    },
    Parameter {
        name: String,
        by_ref: bool,
    },
    RuntimeVariables {
        variables: Vec<NodeRef>,
    },
    Switch {
        value: NodeRef,
        cases: Vec<WireSwitchCase>,
        default_body: Option<NodeRef>,
        comparison: Option<WireMethod>,
    },
    Try {
        body: NodeRef,
        handlers: Vec<WireCatch>,
        finally: Option<NodeRef>,
        fault: Option<NodeRef>,
    },
    TypeBinary {
        op: TypeBinaryOp,
        operand: NodeRef,
        type_operand: TypeDesc,
    },
    Unary {
        op: UnaryOp,
        operand: NodeRef,
        method: Option<WireMethod>,
    },
}

impl WireBody {
    pub fn kind(&self) -> NodeKind {
        match self {
            WireBody::Binary { .. } => NodeKind::Binary,
            WireBody::Block { .. } => NodeKind::Block,
            WireBody::Conditional { .. } => NodeKind::Conditional,
            WireBody::Constant(_) => NodeKind::Constant,
            WireBody::Default => NodeKind::Default,
            WireBody::Goto { .. } => NodeKind::Goto,
            WireBody::Index { .. } => NodeKind::Index,
            WireBody::Invocation { .. } => NodeKind::Invocation,
            WireBody::Label { .. } => NodeKind::Label,
            WireBody::Lambda { .. } => NodeKind::Lambda,
            WireBody::ListInit { .. } => NodeKind::ListInit,
            WireBody::Loop { .. } => NodeKind::Loop,
            WireBody::MemberAccess { .. } => NodeKind::MemberAccess,
            WireBody::MemberInit { .. } => NodeKind::MemberInit,
            WireBody::Call { .. } => NodeKind::Call,
            WireBody::New { .. } => NodeKind::New,
            WireBody::NewArray { .. } => NodeKind::NewArray,
            WireBody::Parameter { .. } => NodeKind::Parameter,
            WireBody::RuntimeVariables { .. } => NodeKind::RuntimeVariables,
            WireBody::Switch { .. } => NodeKind::Switch,
            WireBody::Try { .. } => NodeKind::Try,
            WireBody::TypeBinary { .. } => NodeKind::TypeBinary,
            WireBody::Unary { .. } => NodeKind::Unary,
        }
    }

    /// Every node reference held by this body, embedded parts included.
    pub fn children(&self) -> Vec<NodeRef> {
        fn inits(out: &mut Vec<NodeRef>, inits: &[WireElementInit]) {
            for init in inits {
                out.extend(init.arguments.iter().copied());
            }
        }
        fn bindings(out: &mut Vec<NodeRef>, list: &[WireBinding]) {
            for binding in list {
                match binding {
                    WireBinding::Assignment { expression, .. } => out.push(*expression),
                    WireBinding::List { initializers, .. } => inits(out, initializers),
                    WireBinding::Member { bindings: nested, .. } => bindings(out, nested),
                }
            }
        }
        let mut out = Vec::new();
        match self {
            WireBody::Binary { left, right, .. } => out.extend([*left, *right]),
            WireBody::Block {
                variables,
                expressions,
            } => {
                out.extend(variables.iter().copied());
                out.extend(expressions.iter().copied());
            }
            WireBody::Conditional {
                test,
                if_true,
                if_false,
            } => out.extend([*test, *if_true, *if_false]),
            WireBody::Constant(_) | WireBody::Default | WireBody::Parameter { .. } => {}
            WireBody::Goto { value, .. } => out.extend(*value),
            WireBody::Index {
                object, arguments, ..
            } => {
                out.push(*object);
                out.extend(arguments.iter().copied());
            }
            WireBody::Invocation { target, arguments } => {
                out.push(*target);
                out.extend(arguments.iter().copied());
            }
            WireBody::Label { default_value, .. } => out.extend(*default_value),
            WireBody::Lambda {
                parameters, body, ..
            } => {
                out.extend(parameters.iter().copied());
                out.push(*body);
            }
            WireBody::ListInit {
                new_expr,
                initializers,
            } => {
                out.push(*new_expr);
                inits(&mut out, initializers);
            }
            WireBody::Loop { body, .. } => out.push(*body),
            WireBody::MemberAccess { object, .. } => out.extend(*object),
            WireBody::MemberInit {
                new_expr,
                bindings: list,
            } => {
                out.push(*new_expr);
                bindings(&mut out, list);
            }
            WireBody::Call {
                object, arguments, ..
            } => {
                out.extend(*object);
                out.extend(arguments.iter().copied());
            }
            WireBody::New { arguments, .. } => out.extend(arguments.iter().copied()),
            WireBody::NewArray { expressions, .. } => out.extend(expressions.iter().copied()),
            WireBody::RuntimeVariables { variables } => out.extend(variables.iter().copied()),
            WireBody::Switch {
                value,
                cases,
                default_body,
                ..
            } => {
                out.push(*value);
                for case in cases {
                    out.extend(case.test_values.iter().copied());
                    out.push(case.body);
                }
                out.extend(*default_body);
            }
            WireBody::Try {
                body,
                handlers,
                finally,
                fault,
            } => {
                out.push(*body);
                for handler in handlers {
                    out.extend(handler.variable);
                    out.push(handler.body);
                    out.extend(handler.filter);
                }
                out.extend(*finally);
                out.extend(*fault);
            }
            WireBody::TypeBinary { operand, .. } | WireBody::Unary { operand, .. } => {
                out.push(*operand)
            }
        }
        out
    }
}
