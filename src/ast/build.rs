//! Builders for plan nodes.
//!
//! Result types are derived from the operands where the node kind
//! determines them (comparisons produce `Bool`, calls produce the method's
//! return type, lambdas produce a function type, ...).

use crate::value::Value;

use super::{
    BinaryOp, CatchBlock, ConstructorDesc, ElementInit, Expr, GotoKind, LabelTarget,
    MemberBinding, MemberDesc, MethodDesc, NewArrayKind, Node, PropertyDesc, SwitchCase,
    TypeBinaryOp, TypeDesc, UnaryOp,
};

pub fn constant(value: Value, ty: TypeDesc) -> Node {
    Node::new(ty, Expr::Constant(value))
}

pub fn int(value: i64) -> Node {
    constant(Value::Int(value), TypeDesc::int())
}

pub fn float(value: f64) -> Node {
    constant(Value::Float(value), TypeDesc::float())
}

pub fn boolean(value: bool) -> Node {
    constant(Value::Bool(value), TypeDesc::bool())
}

pub fn string(value: &str) -> Node {
    constant(Value::from(value), TypeDesc::string())
}

pub fn null(ty: TypeDesc) -> Node {
    constant(Value::Null, ty)
}

pub fn default(ty: TypeDesc) -> Node {
    Node::new(ty, Expr::Default)
}

pub fn parameter(name: &str, ty: TypeDesc) -> Node {
    Node::new(
        ty,
        Expr::Parameter {
            name: name.to_string(),
            by_ref: false,
        },
    )
}

pub fn lambda(parameters: Vec<Node>, body: Node) -> Node {
    let ty = TypeDesc::function(
        parameters.iter().map(|p| p.ty().clone()).collect(),
        body.ty().clone(),
    );
    Node::new(
        ty,
        Expr::Lambda {
            name: None,
            parameters,
            body,
        },
    )
}

pub fn named_lambda(name: &str, parameters: Vec<Node>, body: Node) -> Node {
    let ty = TypeDesc::function(
        parameters.iter().map(|p| p.ty().clone()).collect(),
        body.ty().clone(),
    );
    Node::new(
        ty,
        Expr::Lambda {
            name: Some(name.to_string()),
            parameters,
            body,
        },
    )
}

pub fn binary(op: BinaryOp, left: Node, right: Node) -> Node {
    let ty = if op.is_comparison() || matches!(op, BinaryOp::AndAlso | BinaryOp::OrElse) {
        TypeDesc::bool()
    } else {
        left.ty().clone()
    };
    Node::new(
        ty,
        Expr::Binary {
            op,
            left,
            right,
            method: None,
        },
    )
}

pub fn add(left: Node, right: Node) -> Node {
    binary(BinaryOp::Add, left, right)
}

pub fn assign(target: Node, value: Node) -> Node {
    binary(BinaryOp::Assign, target, value)
}

pub fn unary(op: UnaryOp, operand: Node, ty: TypeDesc) -> Node {
    Node::new(
        ty,
        Expr::Unary {
            op,
            operand,
            method: None,
        },
    )
}

pub fn convert(operand: Node, ty: TypeDesc) -> Node {
    unary(UnaryOp::Convert, operand, ty)
}

pub fn throw(value: Node, ty: TypeDesc) -> Node {
    unary(UnaryOp::Throw, value, ty)
}

pub fn conditional(test: Node, if_true: Node, if_false: Node) -> Node {
    Node::new(
        if_true.ty().clone(),
        Expr::Conditional {
            test,
            if_true,
            if_false,
        },
    )
}

/// Block typed after its last expression, `Unit` when empty.
pub fn block(variables: Vec<Node>, expressions: Vec<Node>) -> Node {
    let ty = expressions
        .last()
        .map(|e| e.ty().clone())
        .unwrap_or_else(TypeDesc::unit);
    Node::new(
        ty,
        Expr::Block {
            variables,
            expressions,
        },
    )
}

pub fn call(object: Option<Node>, method: MethodDesc, arguments: Vec<Node>) -> Node {
    Node::new(
        method.return_type(),
        Expr::Call {
            object,
            method,
            arguments,
        },
    )
}

pub fn invoke(target: Node, arguments: Vec<Node>) -> Node {
    let ty = target
        .ty()
        .return_type()
        .cloned()
        .unwrap_or_else(TypeDesc::object);
    Node::new(ty, Expr::Invocation { target, arguments })
}

pub fn member(object: Option<Node>, member: MemberDesc) -> Node {
    Node::new(member.value_type(), Expr::MemberAccess { object, member })
}

pub fn property(object: Node, name: &str, ty: TypeDesc) -> Node {
    let declaring = object.ty().clone();
    member(
        Some(object),
        MemberDesc::Property(PropertyDesc::new(declaring, name, ty)),
    )
}

pub fn index(object: Node, arguments: Vec<Node>, ty: TypeDesc) -> Node {
    Node::new(
        ty,
        Expr::Index {
            object,
            indexer: None,
            arguments,
        },
    )
}

pub fn label(target: LabelTarget, default_value: Option<Node>) -> Node {
    Node::new(
        target.ty().clone(),
        Expr::Label {
            target,
            default_value,
        },
    )
}

pub fn goto(kind: GotoKind, target: LabelTarget, value: Option<Node>) -> Node {
    Node::new(
        TypeDesc::unit(),
        Expr::Goto {
            kind,
            target,
            value,
        },
    )
}

pub fn break_to(target: LabelTarget, value: Option<Node>) -> Node {
    goto(GotoKind::Break, target, value)
}

pub fn continue_to(target: LabelTarget) -> Node {
    goto(GotoKind::Continue, target, None)
}

pub fn return_to(target: LabelTarget, value: Option<Node>) -> Node {
    goto(GotoKind::Return, target, value)
}

pub fn loop_with(
    body: Node,
    break_label: Option<LabelTarget>,
    continue_label: Option<LabelTarget>,
) -> Node {
    let ty = break_label
        .as_ref()
        .map(|l| l.ty().clone())
        .unwrap_or_else(TypeDesc::unit);
    Node::new(
        ty,
        Expr::Loop {
            body,
            break_label,
            continue_label,
        },
    )
}

pub fn try_catch(body: Node, handlers: Vec<CatchBlock>) -> Node {
    try_full(body, handlers, None, None)
}

pub fn try_finally(body: Node, finally: Node) -> Node {
    try_full(body, Vec::new(), Some(finally), None)
}

pub fn try_full(
    body: Node,
    handlers: Vec<CatchBlock>,
    finally: Option<Node>,
    fault: Option<Node>,
) -> Node {
    Node::new(
        body.ty().clone(),
        Expr::Try {
            body,
            handlers,
            finally,
            fault,
        },
    )
}

pub fn catch(test: TypeDesc, variable: Option<Node>, body: Node) -> CatchBlock {
    CatchBlock {
        test,
        variable,
        body,
        filter: None,
    }
}

pub fn switch(value: Node, cases: Vec<SwitchCase>, default_body: Option<Node>) -> Node {
    let ty = cases
        .first()
        .map(|c| c.body.ty().clone())
        .or_else(|| default_body.as_ref().map(|d| d.ty().clone()))
        .unwrap_or_else(TypeDesc::unit);
    Node::new(
        ty,
        Expr::Switch {
            value,
            cases,
            default_body,
            comparison: None,
        },
    )
}

pub fn case(test_values: Vec<Node>, body: Node) -> SwitchCase {
    SwitchCase { test_values, body }
}

pub fn type_is(operand: Node, type_operand: TypeDesc) -> Node {
    Node::new(
        TypeDesc::bool(),
        Expr::TypeBinary {
            op: TypeBinaryOp::TypeIs,
            operand,
            type_operand,
        },
    )
}

pub fn new_object(ty: TypeDesc, constructor: Option<ConstructorDesc>, arguments: Vec<Node>) -> Node {
    Node::new(
        ty,
        Expr::New {
            constructor,
            arguments,
            members: Vec::new(),
        },
    )
}

pub fn new_array(element: TypeDesc, expressions: Vec<Node>) -> Node {
    Node::new(
        TypeDesc::array(element),
        Expr::NewArray {
            kind: NewArrayKind::Init,
            expressions,
        },
    )
}

pub fn new_array_bounds(element: TypeDesc, bounds: Vec<Node>) -> Node {
    Node::new(
        TypeDesc::array(element),
        Expr::NewArray {
            kind: NewArrayKind::Bounds,
            expressions: bounds,
        },
    )
}

pub fn list_init(new_expr: Node, initializers: Vec<ElementInit>) -> Node {
    Node::new(
        new_expr.ty().clone(),
        Expr::ListInit {
            new_expr,
            initializers,
        },
    )
}

pub fn member_init(new_expr: Node, bindings: Vec<MemberBinding>) -> Node {
    Node::new(
        new_expr.ty().clone(),
        Expr::MemberInit { new_expr, bindings },
    )
}

pub fn runtime_variables(variables: Vec<Node>) -> Node {
    Node::new(
        TypeDesc::list(TypeDesc::object()),
        Expr::RuntimeVariables { variables },
    )
}
