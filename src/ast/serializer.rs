//! Identity-preserving conversion between [`Node`] trees and [`WirePlan`]s.
//!
//! Outbound, [`PlanSerializer`] keeps an arena keyed by node identity: the
//! same node serialized twice yields the same [`NodeRef`]. It also holds a
//! clone of every visited node so an address cannot be reused while the
//! serializer is alive.
//!
//! Inbound, [`PlanDeserializer`] caches reconstructions by index, so every
//! reference to one wire node resolves to one shared [`Node`]. References
//! must point strictly backwards in the arena; anything else is rejected
//! before it can form a cycle.

use std::collections::HashMap;

use tracing::debug;

use super::wire::{
    LabelRef, NodeRef, WireBinding, WireBody, WireCatch, WireElementInit, WireLabel, WireMember,
    WireMethod, WireNode, WirePlan, WireSwitchCase,
};
use super::{
    CatchBlock, ElementInit, Expr, LabelTarget, MemberBinding, MemberDesc, MethodDesc, Node,
    NodeKind, PlanError, PlanResult, SwitchCase,
};

/// Serializes a whole tree.
pub fn to_wire(root: &Node) -> PlanResult<WirePlan> {
    let mut serializer = PlanSerializer::new();
    let root = serializer.serialize(root)?;
    Ok(serializer.finish(root))
}

/// Reconstructs the tree rooted at `plan.root`.
pub fn from_wire(plan: &WirePlan) -> PlanResult<Node> {
    PlanDeserializer::new(plan).root()
}

/// Reconstructs the tree rooted at `plan.root` after checking its size.
pub fn from_wire_with_limits(plan: &WirePlan, limits: &PlanLimits) -> PlanResult<Node> {
    limits.check(plan)?;
    from_wire(plan)
}

fn check_reference(plan: &WirePlan, parent: u32, child: NodeRef) -> PlanResult<()> {
    if child.0 as usize >= plan.nodes.len() {
        return Err(PlanError::DanglingReference(child.0));
    }
    if child.0 >= parent {
        return Err(PlanError::ForwardReference {
            parent,
            child: child.0,
        });
    }
    Ok(())
}

/// Upper bounds on the size of an inbound plan.
///
/// Evaluation, rewriting and equality walk plans recursively, so nesting
/// must be bounded before a plan from a peer is reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl PlanLimits {
    pub fn new(max_depth: usize, max_nodes: usize) -> Self {
        Self {
            max_depth,
            max_nodes,
        }
    }

    /// Checks node count and nesting depth over the whole arena without
    /// building anything. Malformed references are left for the
    /// deserializer to report.
    pub fn check(&self, plan: &WirePlan) -> PlanResult<()> {
        let count = plan.nodes.len();
        if count > self.max_nodes {
            return Err(PlanError::TooManyNodes {
                count,
                limit: self.max_nodes,
            });
        }
        let mut depths = Vec::with_capacity(count);
        for node in &plan.nodes {
            let depth = 1 + node
                .body
                .children()
                .into_iter()
                .filter_map(|child| depths.get(child.0 as usize).copied())
                .max()
                .unwrap_or(0);
            if depth > self.max_depth {
                return Err(PlanError::TooDeep {
                    limit: self.max_depth,
                });
            }
            depths.push(depth);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct PlanSerializer {
    nodes: Vec<WireNode>,
    labels: Vec<WireLabel>,
    node_index: HashMap<usize, NodeRef>,
    label_index: HashMap<usize, LabelRef>,
    retained: Vec<Node>,
    retained_labels: Vec<LabelTarget>,
}

impl PlanSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn serialize(&mut self, node: &Node) -> PlanResult<NodeRef> {
        if let Some(index) = self.node_index.get(&node.id()) {
            return Ok(*index);
        }
        let body = self.body(node)?;
        let index = NodeRef(self.nodes.len() as u32);
        self.nodes.push(WireNode {
            kind: node.kind() as u8,
            ty: node.ty().clone(),
            body,
        });
        self.node_index.insert(node.id(), index);
        self.retained.push(node.clone());
        Ok(index)
    }

    pub fn finish(self, root: NodeRef) -> WirePlan {
        debug!(
            "Serialized plan: {} nodes, {} labels",
            self.nodes.len(),
            self.labels.len()
        );
        WirePlan {
            nodes: self.nodes,
            labels: self.labels,
            root,
        }
    }

    fn label(&mut self, label: &LabelTarget) -> LabelRef {
        if let Some(index) = self.label_index.get(&label.id()) {
            return *index;
        }
        let index = LabelRef(self.labels.len() as u32);
        self.labels.push(WireLabel {
            name: label.name().map(str::to_string),
            ty: label.ty().clone(),
        });
        self.label_index.insert(label.id(), index);
        self.retained_labels.push(label.clone());
        index
    }

    fn all(&mut self, nodes: &[Node]) -> PlanResult<Vec<NodeRef>> {
        nodes.iter().map(|n| self.serialize(n)).collect()
    }

    fn opt(&mut self, node: Option<&Node>) -> PlanResult<Option<NodeRef>> {
        node.map(|n| self.serialize(n)).transpose()
    }

    fn inits(&mut self, inits: &[ElementInit]) -> PlanResult<Vec<WireElementInit>> {
        inits
            .iter()
            .map(|init| {
                Ok(WireElementInit {
                    add_method: method_to_wire(&init.add_method),
                    arguments: self.all(&init.arguments)?,
                })
            })
            .collect()
    }

    fn bindings(&mut self, bindings: &[MemberBinding]) -> PlanResult<Vec<WireBinding>> {
        bindings
            .iter()
            .map(|binding| {
                Ok(match binding {
                    MemberBinding::Assignment { member, expression } => WireBinding::Assignment {
                        member: member_to_wire(member),
                        expression: self.serialize(expression)?,
                    },
                    MemberBinding::List {
                        member,
                        initializers,
                    } => WireBinding::List {
                        member: member_to_wire(member),
                        initializers: self.inits(initializers)?,
                    },
                    MemberBinding::Member { member, bindings } => WireBinding::Member {
                        member: member_to_wire(member),
                        bindings: self.bindings(bindings)?,
                    },
                })
            })
            .collect()
    }

    fn body(&mut self, node: &Node) -> PlanResult<WireBody> {
        Ok(match node.expr() {
            Expr::Binary {
                op,
                left,
                right,
                method,
            } => WireBody::Binary {
                op: *op,
                left: self.serialize(left)?,
                right: self.serialize(right)?,
                method: method.as_ref().map(method_to_wire),
            },
            Expr::Block {
                variables,
                expressions,
            } => WireBody::Block {
                variables: self.all(variables)?,
                expressions: self.all(expressions)?,
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => WireBody::Conditional {
                test: self.serialize(test)?,
                if_true: self.serialize(if_true)?,
                if_false: self.serialize(if_false)?,
            },
            Expr::Constant(value) => {
                if !value.is_representable() {
                    return Err(PlanError::UnrepresentableConstant(value.type_name()));
                }
                WireBody::Constant(value.clone())
            }
            Expr::Default => WireBody::Default,
            Expr::Goto {
                kind,
                target,
                value,
            } => WireBody::Goto {
                kind: *kind,
                target: self.label(target),
                value: self.opt(value.as_ref())?,
            },
            Expr::Index {
                object,
                indexer,
                arguments,
            } => WireBody::Index {
                object: self.serialize(object)?,
                indexer: indexer.clone(),
                arguments: self.all(arguments)?,
            },
            Expr::Invocation { target, arguments } => WireBody::Invocation {
                target: self.serialize(target)?,
                arguments: self.all(arguments)?,
            },
            Expr::Label {
                target,
                default_value,
            } => WireBody::Label {
                target: self.label(target),
                default_value: self.opt(default_value.as_ref())?,
            },
            Expr::Lambda {
                name,
                parameters,
                body,
            } => WireBody::Lambda {
                name: name.clone(),
                parameters: self.all(parameters)?,
                body: self.serialize(body)?,
            },
            Expr::ListInit {
                new_expr,
                initializers,
            } => WireBody::ListInit {
                new_expr: self.serialize(new_expr)?,
                initializers: self.inits(initializers)?,
            },
            Expr::Loop {
                body,
                break_label,
                continue_label,
            } => WireBody::Loop {
                body: self.serialize(body)?,
                break_label: break_label.as_ref().map(|l| self.label(l)),
                continue_label: continue_label.as_ref().map(|l| self.label(l)),
            },
            Expr::MemberAccess { object, member } => WireBody::MemberAccess {
                object: self.opt(object.as_ref())?,
                member: member_to_wire(member),
            },
            Expr::MemberInit { new_expr, bindings } => WireBody::MemberInit {
                new_expr: self.serialize(new_expr)?,
                bindings: self.bindings(bindings)?,
            },
            Expr::Call {
                object,
                method,
                arguments,
            } => WireBody::Call {
                object: self.opt(object.as_ref())?,
                method: method_to_wire(method),
                arguments: self.all(arguments)?,
            },
            Expr::New {
                constructor,
                arguments,
                members,
            } => WireBody::New {
                constructor: constructor.clone(),
                arguments: self.all(arguments)?,
                members: members.iter().map(member_to_wire).collect(),
            },
            Expr::NewArray { kind, expressions } => WireBody::NewArray {
                kind: *kind,
                expressions: self.all(expressions)?,
            },
            Expr::Parameter { name, by_ref } => WireBody::Parameter {
                name: name.clone(),
                by_ref: *by_ref,
            },
            Expr::RuntimeVariables { variables } => WireBody::RuntimeVariables {
                variables: self.all(variables)?,
            },
            Expr::Switch {
                value,
                cases,
                default_body,
                comparison,
            } => WireBody::Switch {
                value: self.serialize(value)?,
                cases: cases
                    .iter()
                    .map(|case| {
                        Ok(WireSwitchCase {
                            test_values: self.all(&case.test_values)?,
                            body: self.serialize(&case.body)?,
                        })
                    })
                    .collect::<PlanResult<_>>()?,
                default_body: self.opt(default_body.as_ref())?,
                comparison: comparison.as_ref().map(method_to_wire),
            },
            Expr::Try {
                body,
                handlers,
                finally,
                fault,
            } => WireBody::Try {
                body: self.serialize(body)?,
                handlers: handlers
                    .iter()
                    .map(|h| {
                        Ok(WireCatch {
                            test: h.test.clone(),
                            variable: self.opt(h.variable.as_ref())?,
                            body: self.serialize(&h.body)?,
                            filter: self.opt(h.filter.as_ref())?,
                        })
                    })
                    .collect::<PlanResult<_>>()?,
                finally: self.opt(finally.as_ref())?,
                fault: self.opt(fault.as_ref())?,
            },
            Expr::TypeBinary {
                op,
                operand,
                type_operand,
            } => WireBody::TypeBinary {
                op: *op,
                operand: self.serialize(operand)?,
                type_operand: type_operand.clone(),
            },
            Expr::Unary {
                op,
                operand,
                method,
            } => WireBody::Unary {
                op: *op,
                operand: self.serialize(operand)?,
                method: method.as_ref().map(method_to_wire),
            },
        })
    }
}

fn method_to_wire(method: &MethodDesc) -> WireMethod {
    let (definition, type_args) = method.decompose();
    WireMethod {
        definition,
        type_args,
    }
}

fn method_from_wire(method: &WireMethod) -> PlanResult<MethodDesc> {
    method
        .definition
        .clone()
        .make_generic(method.type_args.clone())
}

fn member_to_wire(member: &MemberDesc) -> WireMember {
    match member {
        MemberDesc::Field(f) => WireMember::Field(f.clone()),
        MemberDesc::Property(p) => WireMember::Property(p.clone()),
        MemberDesc::Method(m) => WireMember::Method(method_to_wire(m)),
        MemberDesc::Constructor(c) => WireMember::Constructor(c.clone()),
    }
}

fn member_from_wire(member: &WireMember) -> PlanResult<MemberDesc> {
    Ok(match member {
        WireMember::Field(f) => MemberDesc::Field(f.clone()),
        WireMember::Property(p) => MemberDesc::Property(p.clone()),
        WireMember::Method(m) => MemberDesc::Method(method_from_wire(m)?),
        WireMember::Constructor(c) => MemberDesc::Constructor(c.clone()),
    })
}

pub struct PlanDeserializer<'a> {
    plan: &'a WirePlan,
    cache: Vec<Option<Node>>,
    labels: Vec<Option<LabelTarget>>,
}

impl<'a> PlanDeserializer<'a> {
    pub fn new(plan: &'a WirePlan) -> Self {
        Self {
            plan,
            cache: vec![None; plan.nodes.len()],
            labels: vec![None; plan.labels.len()],
        }
    }

    pub fn root(&mut self) -> PlanResult<Node> {
        self.node(self.plan.root)
    }

    /// Reconstructs the node at `index`, once.
    ///
    /// Children always precede their parents, so the nodes reachable from
    /// `index` are marked in one backwards sweep and then built in index
    /// order, each finding its children already cached.
    pub fn node(&mut self, index: NodeRef) -> PlanResult<Node> {
        let target = index.0 as usize;
        if let Some(Some(node)) = self.cache.get(target) {
            return Ok(node.clone());
        }
        if target >= self.plan.nodes.len() {
            return Err(PlanError::DanglingReference(index.0));
        }
        let mut reachable = vec![false; target + 1];
        reachable[target] = true;
        for i in (0..=target).rev() {
            if !reachable[i] || self.cache[i].is_some() {
                continue;
            }
            for child in self.plan.nodes[i].body.children() {
                check_reference(self.plan, i as u32, child)?;
                reachable[child.0 as usize] = true;
            }
        }
        for i in 0..=target {
            if reachable[i] && self.cache[i].is_none() {
                let node = self.build(i as u32)?;
                self.cache[i] = Some(node);
            }
        }
        self.cache[target]
            .clone()
            .ok_or(PlanError::DanglingReference(index.0))
    }

    fn build(&mut self, index: u32) -> PlanResult<Node> {
        let plan = self.plan;
        let wire = &plan.nodes[index as usize];
        let tagged = NodeKind::from_repr(wire.kind).ok_or(PlanError::UnknownKind(wire.kind))?;
        if tagged.is_embedded() {
            return Err(PlanError::EmbeddedKind(tagged));
        }
        let found = wire.body.kind();
        if found != tagged {
            return Err(PlanError::KindMismatch {
                index,
                tagged,
                found,
            });
        }
        let expr = self.expr(index, &wire.body)?;
        Ok(Node::new(wire.ty.clone(), expr))
    }

    fn child(&mut self, parent: u32, child: NodeRef) -> PlanResult<Node> {
        check_reference(self.plan, parent, child)?;
        self.cache[child.0 as usize]
            .clone()
            .ok_or(PlanError::DanglingReference(child.0))
    }

    fn all(&mut self, parent: u32, refs: &[NodeRef]) -> PlanResult<Vec<Node>> {
        refs.iter().map(|r| self.child(parent, *r)).collect()
    }

    fn opt(&mut self, parent: u32, r: Option<NodeRef>) -> PlanResult<Option<Node>> {
        r.map(|r| self.child(parent, r)).transpose()
    }

    fn label(&mut self, r: LabelRef) -> PlanResult<LabelTarget> {
        let i = r.0 as usize;
        if let Some(Some(label)) = self.labels.get(i) {
            return Ok(label.clone());
        }
        let wire = self
            .plan
            .labels
            .get(i)
            .ok_or(PlanError::DanglingLabel(r.0))?;
        let label = LabelTarget::new(wire.name.as_deref(), wire.ty.clone());
        self.labels[i] = Some(label.clone());
        Ok(label)
    }

    fn inits(&mut self, parent: u32, inits: &[WireElementInit]) -> PlanResult<Vec<ElementInit>> {
        inits
            .iter()
            .map(|init| {
                Ok(ElementInit {
                    add_method: method_from_wire(&init.add_method)?,
                    arguments: self.all(parent, &init.arguments)?,
                })
            })
            .collect()
    }

    fn bindings(&mut self, parent: u32, bindings: &[WireBinding]) -> PlanResult<Vec<MemberBinding>> {
        bindings
            .iter()
            .map(|binding| {
                Ok(match binding {
                    WireBinding::Assignment { member, expression } => MemberBinding::Assignment {
                        member: member_from_wire(member)?,
                        expression: self.child(parent, *expression)?,
                    },
                    WireBinding::List {
                        member,
                        initializers,
                    } => MemberBinding::List {
                        member: member_from_wire(member)?,
                        initializers: self.inits(parent, initializers)?,
                    },
                    WireBinding::Member { member, bindings } => MemberBinding::Member {
                        member: member_from_wire(member)?,
                        bindings: self.bindings(parent, bindings)?,
                    },
                })
            })
            .collect()
    }

    fn expr(&mut self, p: u32, body: &WireBody) -> PlanResult<Expr> {
        Ok(match body {
            WireBody::Binary {
                op,
                left,
                right,
                method,
            } => Expr::Binary {
                op: *op,
                left: self.child(p, *left)?,
                right: self.child(p, *right)?,
                method: method.as_ref().map(method_from_wire).transpose()?,
            },
            WireBody::Block {
                variables,
                expressions,
            } => Expr::Block {
                variables: self.all(p, variables)?,
                expressions: self.all(p, expressions)?,
            },
            WireBody::Conditional {
                test,
                if_true,
                if_false,
            } => Expr::Conditional {
                test: self.child(p, *test)?,
                if_true: self.child(p, *if_true)?,
                if_false: self.child(p, *if_false)?,
            },
            WireBody::Constant(value) => Expr::Constant(value.clone()),
            WireBody::Default => Expr::Default,
            WireBody::Goto {
                kind,
                target,
                value,
            } => Expr::Goto {
                kind: *kind,
                target: self.label(*target)?,
                value: self.opt(p, *value)?,
            },
            WireBody::Index {
                object,
                indexer,
                arguments,
            } => Expr::Index {
                object: self.child(p, *object)?,
                indexer: indexer.clone(),
                arguments: self.all(p, arguments)?,
            },
            WireBody::Invocation { target, arguments } => Expr::Invocation {
                target: self.child(p, *target)?,
                arguments: self.all(p, arguments)?,
            },
            WireBody::Label {
                target,
                default_value,
            } => Expr::Label {
                target: self.label(*target)?,
                default_value: self.opt(p, *default_value)?,
            },
            WireBody::Lambda {
                name,
                parameters,
                body,
            } => Expr::Lambda {
                name: name.clone(),
                parameters: self.all(p, parameters)?,
                body: self.child(p, *body)?,
            },
            WireBody::ListInit {
                new_expr,
                initializers,
            } => Expr::ListInit {
                new_expr: self.child(p, *new_expr)?,
                initializers: self.inits(p, initializers)?,
            },
            WireBody::Loop {
                body,
                break_label,
                continue_label,
            } => Expr::Loop {
                body: self.child(p, *body)?,
                break_label: break_label.map(|l| self.label(l)).transpose()?,
                continue_label: continue_label.map(|l| self.label(l)).transpose()?,
            },
            WireBody::MemberAccess { object, member } => Expr::MemberAccess {
                object: self.opt(p, *object)?,
                member: member_from_wire(member)?,
            },
            WireBody::MemberInit { new_expr, bindings } => Expr::MemberInit {
                new_expr: self.child(p, *new_expr)?,
                bindings: self.bindings(p, bindings)?,
            },
            WireBody::Call {
                object,
                method,
                arguments,
            } => Expr::Call {
                object: self.opt(p, *object)?,
                method: method_from_wire(method)?,
                arguments: self.all(p, arguments)?,
            },
            WireBody::New {
                constructor,
                arguments,
                members,
            } => Expr::New {
                constructor: constructor.clone(),
                arguments: self.all(p, arguments)?,
                members: members
                    .iter()
                    .map(member_from_wire)
                    .collect::<PlanResult<_>>()?,
            },
            WireBody::NewArray { kind, expressions } => Expr::NewArray {
                kind: *kind,
                expressions: self.all(p, expressions)?,
            },
            WireBody::Parameter { name, by_ref } => Expr::Parameter {
                name: name.clone(),
                by_ref: *by_ref,
            },
            WireBody::RuntimeVariables { variables } => Expr::RuntimeVariables {
                variables: self.all(p, variables)?,
            },
            WireBody::Switch {
                value,
                cases,
                default_body,
                comparison,
            } => Expr::Switch {
                value: self.child(p, *value)?,
                cases: cases
                    .iter()
                    .map(|case| {
                        Ok(SwitchCase {
                            test_values: self.all(p, &case.test_values)?,
                            body: self.child(p, case.body)?,
                        })
                    })
                    .collect::<PlanResult<_>>()?,
                default_body: self.opt(p, *default_body)?,
                comparison: comparison.as_ref().map(method_from_wire).transpose()?,
            },
            WireBody::Try {
                body,
                handlers,
                finally,
                fault,
            } => Expr::Try {
                body: self.child(p, *body)?,
                handlers: handlers
                    .iter()
                    .map(|h| {
                        Ok(CatchBlock {
                            test: h.test.clone(),
                            variable: self.opt(p, h.variable)?,
                            body: self.child(p, h.body)?,
                            filter: self.opt(p, h.filter)?,
                        })
                    })
                    .collect::<PlanResult<_>>()?,
                finally: self.opt(p, *finally)?,
                fault: self.opt(p, *fault)?,
            },
            WireBody::TypeBinary {
                op,
                operand,
                type_operand,
            } => Expr::TypeBinary {
                op: *op,
                operand: self.child(p, *operand)?,
                type_operand: type_operand.clone(),
            },
            WireBody::Unary {
                op,
                operand,
                method,
            } => Expr::Unary {
                op: *op,
                operand: self.child(p, *operand)?,
                method: method.as_ref().map(method_from_wire).transpose()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::ast::{TypeDesc, plan_equals};
    use crate::value::{HostValue, Value};
    use pretty_assertions::assert_eq;

    fn lambda_with_shared_parameter() -> Node {
        let x = build::parameter("x", TypeDesc::int());
        build::lambda(vec![x.clone()], build::add(x.clone(), x))
    }

    #[test]
    fn test_serializer_memoizes_by_identity() {
        let node = build::int(4);
        let mut serializer = PlanSerializer::new();
        let first = serializer.serialize(&node).unwrap();
        let second = serializer.serialize(&node).unwrap();
        assert_eq!(first, second);
        assert_eq!(serializer.len(), 1);

        // Equal but distinct nodes get distinct entries.
        serializer.serialize(&build::int(4)).unwrap();
        assert_eq!(serializer.len(), 2);
    }

    #[test]
    fn test_shared_parameter_round_trip() {
        let lambda = lambda_with_shared_parameter();
        let wire = to_wire(&lambda).unwrap();
        // parameter, add, lambda
        assert_eq!(wire.nodes.len(), 3);

        let back = from_wire(&wire).unwrap();
        let Expr::Lambda {
            parameters, body, ..
        } = back.expr()
        else {
            panic!("expected lambda, got {:?}", back);
        };
        let Expr::Binary { left, right, .. } = body.expr() else {
            panic!("expected binary");
        };
        assert!(Node::ptr_eq(&parameters[0], left));
        assert!(Node::ptr_eq(left, right));
        assert!(plan_equals(&lambda, &back));
    }

    #[test]
    fn test_deserializer_caches_by_index() {
        let wire = to_wire(&lambda_with_shared_parameter()).unwrap();
        let mut deserializer = PlanDeserializer::new(&wire);
        let a = deserializer.node(NodeRef(2)).unwrap();
        let b = deserializer.node(NodeRef(2)).unwrap();
        assert!(Node::ptr_eq(&a, &b));
    }

    #[test]
    fn test_shared_label_round_trip() {
        let exit = LabelTarget::new(Some("exit"), TypeDesc::int());
        let plan = build::loop_with(
            build::break_to(exit.clone(), Some(build::int(1))),
            Some(exit),
            None,
        );
        let back = from_wire(&to_wire(&plan).unwrap()).unwrap();
        let Expr::Loop {
            body, break_label, ..
        } = back.expr()
        else {
            panic!("expected loop");
        };
        let Expr::Goto { target, .. } = body.expr() else {
            panic!("expected goto");
        };
        assert!(LabelTarget::ptr_eq(target, break_label.as_ref().unwrap()));
    }

    #[test]
    fn test_host_constant_is_rejected() {
        let f = HostValue::function(|_| async { Ok(Value::Null) });
        let node = build::constant(Value::Host(f), TypeDesc::function(vec![], TypeDesc::int()));
        assert_eq!(
            to_wire(&node).unwrap_err(),
            PlanError::UnrepresentableConstant("Function".to_string())
        );
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let mut wire = to_wire(&build::add(build::int(1), build::int(2))).unwrap();
        // Make the root point at itself.
        wire.nodes[2].body = WireBody::Binary {
            op: crate::ast::BinaryOp::Add,
            left: NodeRef(2),
            right: NodeRef(1),
            method: None,
        };
        assert_eq!(
            from_wire(&wire).unwrap_err(),
            PlanError::ForwardReference {
                parent: 2,
                child: 2
            }
        );
    }

    #[test]
    fn test_bad_kind_tags() {
        let mut wire = to_wire(&build::int(1)).unwrap();
        wire.nodes[0].kind = 200;
        assert_eq!(from_wire(&wire).unwrap_err(), PlanError::UnknownKind(200));

        wire.nodes[0].kind = NodeKind::CatchBlock as u8;
        assert_eq!(
            from_wire(&wire).unwrap_err(),
            PlanError::EmbeddedKind(NodeKind::CatchBlock)
        );

        wire.nodes[0].kind = NodeKind::Default as u8;
        assert!(matches!(
            from_wire(&wire).unwrap_err(),
            PlanError::KindMismatch { .. }
        ));
    }

    #[test]
    fn test_dangling_root() {
        let mut wire = to_wire(&build::int(1)).unwrap();
        wire.root = NodeRef(9);
        assert_eq!(from_wire(&wire).unwrap_err(), PlanError::DanglingReference(9));
    }

    /// `Negate(Negate(...(1)))` written straight into the arena.
    fn negation_chain(depth: usize) -> WirePlan {
        let mut nodes = vec![WireNode {
            kind: NodeKind::Constant as u8,
            ty: TypeDesc::int(),
            body: WireBody::Constant(Value::Int(1)),
        }];
        for i in 1..depth {
            nodes.push(WireNode {
                kind: NodeKind::Unary as u8,
                ty: TypeDesc::int(),
                body: WireBody::Unary {
                    op: crate::ast::UnaryOp::Negate,
                    operand: NodeRef(i as u32 - 1),
                    method: None,
                },
            });
        }
        WirePlan {
            root: NodeRef(depth as u32 - 1),
            nodes,
            labels: vec![],
        }
    }

    #[test]
    fn test_deep_chain_rebuilds_and_drops() {
        let wire = negation_chain(50_000);
        let root = from_wire(&wire).unwrap();
        assert_eq!(root.kind(), NodeKind::Unary);
        let mut node = root.clone();
        let mut depth = 1;
        while let Expr::Unary { operand, .. } = node.expr() {
            let next = operand.clone();
            node = next;
            depth += 1;
        }
        assert_eq!(depth, 50_000);
        drop(node);
        drop(root);
    }

    #[test]
    fn test_plan_limits() {
        let wire = negation_chain(10);
        assert_eq!(PlanLimits::new(10, 10).check(&wire), Ok(()));
        assert_eq!(
            from_wire_with_limits(&wire, &PlanLimits::new(9, 100)).unwrap_err(),
            PlanError::TooDeep { limit: 9 }
        );
        assert_eq!(
            from_wire_with_limits(&wire, &PlanLimits::new(100, 9)).unwrap_err(),
            PlanError::TooManyNodes {
                count: 10,
                limit: 9
            }
        );

        // A shared child counts once toward depth.
        let x = build::parameter("x", TypeDesc::int());
        let wire = to_wire(&build::add(x.clone(), x)).unwrap();
        assert_eq!(PlanLimits::new(2, 2).check(&wire), Ok(()));
    }

    #[test]
    fn test_unreachable_nodes_are_not_rebuilt() {
        let mut wire = negation_chain(3);
        wire.nodes.push(WireNode {
            kind: 200,
            ty: TypeDesc::int(),
            body: WireBody::Default,
        });
        // The root is still node 2; the junk entry after it is never visited.
        assert!(from_wire(&wire).is_ok());
    }
}
