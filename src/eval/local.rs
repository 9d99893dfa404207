use std::collections::HashMap;

use tracing::{debug, trace};

use super::known_types::KnownTypeRegistry;
use super::{EvalError, EvalResult};
use crate::ast::{Expr, MemberBinding, MemberDesc, Node, TypeDesc, build, well_known};
use crate::duplex::{CallbackRegistrar, DuplexKind};
use crate::value::{HostValue, Value};

/// A local implementation of a member the remote side does not know.
#[derive(Debug, Clone)]
pub enum HostMember {
    /// Read locally once; the plan carries the value.
    Value(Value),
    /// Called back over duplex each time the plan uses it. A receiver, if
    /// any, is passed as the first argument.
    Function(HostValue),
}

/// Host implementations keyed by `Type.Member`.
#[derive(Debug, Clone, Default)]
pub struct HostBindings {
    members: HashMap<String, HostMember>,
}

impl HostBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_value<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.members.insert(key.into(), HostMember::Value(value));
        self
    }

    pub fn bind_function<S: Into<String>>(mut self, key: S, function: HostValue) -> Self {
        self.members.insert(key.into(), HostMember::Function(function));
        self
    }

    pub fn get(&self, key: &str) -> Option<&HostMember> {
        self.members.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Rewrites an outbound plan so everything in it is meaningful remotely.
///
/// - Host-only constants become duplex references of the matching pattern.
/// - Members with a host binding are evaluated locally (values) or turned
///   into duplex invocations (functions).
/// - Compiler-generated types become the property-bag substitute, together
///   with the constructions and member accesses that mention them.
///
/// Rewrites are memoized by node identity, so a node shared by several
/// parents is rewritten once and stays shared.
pub struct LocalEvaluationVisitor<'a> {
    registry: &'a KnownTypeRegistry,
    bindings: &'a HostBindings,
    registrar: Option<&'a dyn CallbackRegistrar>,
    // Holds the original next to its rewrite so the id cannot be reused
    // while the visitor is alive.
    memo: HashMap<usize, (Node, Node)>,
}

impl<'a> LocalEvaluationVisitor<'a> {
    pub fn new(registry: &'a KnownTypeRegistry, bindings: &'a HostBindings) -> Self {
        Self {
            registry,
            bindings,
            registrar: None,
            memo: HashMap::new(),
        }
    }

    pub fn with_registrar(mut self, registrar: &'a dyn CallbackRegistrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn rewrite(&mut self, node: &Node) -> EvalResult<Node> {
        let rewritten = self.visit(node, None)?;
        debug!("Local evaluation rewrote {} nodes", self.memo.len());
        Ok(rewritten)
    }

    /// Replaces host-only parts of a value (the client argument, a bound
    /// member value) with duplex references.
    pub fn rewrite_value(&self, value: &Value) -> EvalResult<Value> {
        if value.is_representable() {
            return Ok(value.clone());
        }
        let Some(registrar) = self.registrar else {
            return Err(EvalError::Unrepresentable(value.type_name()));
        };
        value.map_host(&mut |host| {
            registrar
                .register(host)
                .map(Value::Duplex)
                .map_err(|e| EvalError::Registration(e.to_string()))
        })
    }

    fn visit(&mut self, node: &Node, expected: Option<&TypeDesc>) -> EvalResult<Node> {
        if let Some((_, done)) = self.memo.get(&node.id()) {
            return Ok(done.clone());
        }
        let rewritten = match node.expr() {
            Expr::Constant(value) => self.visit_constant(node, value, expected)?,
            // Known members pass through even when a binding exists.
            Expr::MemberAccess { object, member } => match self.bindings.get(&member.key()).cloned() {
                Some(binding) if !self.registry.is_known_member(member) => {
                    self.bind_member(node, object.as_ref(), binding, Vec::new())?
                }
                _ => self.rebuild(node)?,
            },
            Expr::Call {
                object,
                method,
                arguments,
            } => match self.bindings.get(&method.key()).cloned() {
                Some(binding) if !self.registry.is_known_method(method) => {
                    let arguments = arguments
                        .iter()
                        .zip(method.parameter_types().iter().map(Some).chain(std::iter::repeat(None)))
                        .map(|(a, hint)| self.visit(a, hint))
                        .collect::<EvalResult<Vec<_>>>()?;
                    self.bind_member(node, object.as_ref(), binding, arguments)?
                }
                _ => self.rebuild(node)?,
            },
            _ => self.rebuild(node)?,
        };
        if !Node::ptr_eq(&rewritten, node) {
            trace!("Rewrote {} node", node.kind());
        }
        self.memo
            .insert(node.id(), (node.clone(), rewritten.clone()));
        Ok(rewritten)
    }

    fn visit_constant(
        &mut self,
        node: &Node,
        value: &Value,
        expected: Option<&TypeDesc>,
    ) -> EvalResult<Node> {
        let value_changed = !value.is_representable();
        let value = self.rewrite_value(value)?;

        let declared = node.ty();
        let ty = if declared.is_named(well_known::OBJECT) {
            // An untyped slot takes the type of the position it fills.
            match (expected, &value) {
                (Some(expected), _) => expected.replace_generated(),
                (None, Value::Duplex(r)) => TypeDesc::named(r.kind.type_name()),
                (None, _) => declared.clone(),
            }
        } else {
            declared.replace_generated()
        };

        if !value_changed && &ty == declared {
            return Ok(node.clone());
        }
        Ok(build::constant(value, ty))
    }

    /// Applies a host binding to a member access or call node.
    fn bind_member(
        &mut self,
        node: &Node,
        object: Option<&Node>,
        binding: HostMember,
        arguments: Vec<Node>,
    ) -> EvalResult<Node> {
        let ty = node.ty().replace_generated();
        match binding {
            HostMember::Value(value) => {
                let value = self.rewrite_value(&value)?;
                debug!("Evaluated bound member locally: {:?}", value);
                Ok(build::constant(value, ty))
            }
            HostMember::Function(function) => {
                let registrar = self
                    .registrar
                    .ok_or_else(|| EvalError::Unrepresentable(function.type_name()))?;
                let reference = registrar
                    .register(&function)
                    .map_err(|e| EvalError::Registration(e.to_string()))?;
                if reference.kind != DuplexKind::Invoke {
                    return Err(EvalError::mismatch(
                        well_known::FUNCTION,
                        reference.kind.type_name(),
                    ));
                }

                let mut all_arguments = Vec::with_capacity(arguments.len() + 1);
                if let Some(object) = object {
                    all_arguments.push(self.visit(object, None)?);
                }
                all_arguments.extend(arguments);

                let function_ty = TypeDesc::function(
                    all_arguments.iter().map(|a| a.ty().clone()).collect(),
                    ty.clone(),
                );
                let target = build::constant(Value::Duplex(reference), function_ty);
                Ok(Node::new(
                    ty,
                    Expr::Invocation {
                        target,
                        arguments: all_arguments,
                    },
                ))
            }
        }
    }

    /// Rewrites children and replaces generated types in this node.
    fn rebuild(&mut self, node: &Node) -> EvalResult<Node> {
        let mapped = node.try_map_children(&mut |child, hint| self.visit(child, hint))?;
        let generated = node.ty().contains_generated() || mentions_generated(node.expr());
        if mapped.is_none() && !generated {
            return Ok(node.clone());
        }
        let expr = mapped.unwrap_or_else(|| node.expr().clone());
        let expr = if generated { retarget(expr) } else { expr };
        Ok(Node::new(node.ty().replace_generated(), expr))
    }
}

/// Whether the node's own descriptors (not its children) mention a
/// generated type.
fn mentions_generated(expr: &Expr) -> bool {
    match expr {
        Expr::MemberAccess { member, .. } => member.declaring().contains_generated(),
        Expr::New {
            constructor,
            members,
            ..
        } => {
            constructor
                .as_ref()
                .is_some_and(|c| c.declaring.contains_generated())
                || members.iter().any(|m| m.declaring().contains_generated())
        }
        Expr::MemberInit { bindings, .. } => bindings
            .iter()
            .any(|b| b.member().declaring().contains_generated()),
        Expr::TypeBinary { type_operand, .. } => type_operand.contains_generated(),
        _ => false,
    }
}

fn retarget_member(member: &MemberDesc) -> MemberDesc {
    if member.declaring().contains_generated() {
        member.retarget_to_bag()
    } else {
        member.clone()
    }
}

fn retarget_bindings(bindings: Vec<MemberBinding>) -> Vec<MemberBinding> {
    bindings
        .into_iter()
        .map(|binding| match binding {
            MemberBinding::Assignment { member, expression } => MemberBinding::Assignment {
                member: retarget_member(&member),
                expression,
            },
            MemberBinding::List {
                member,
                initializers,
            } => MemberBinding::List {
                member: retarget_member(&member),
                initializers,
            },
            MemberBinding::Member { member, bindings } => MemberBinding::Member {
                member: retarget_member(&member),
                bindings: retarget_bindings(bindings),
            },
        })
        .collect()
}

/// Points generated-type descriptors at the property-bag substitute.
fn retarget(expr: Expr) -> Expr {
    match expr {
        Expr::MemberAccess { object, member } => Expr::MemberAccess {
            object,
            member: retarget_member(&member),
        },
        Expr::New {
            constructor,
            arguments,
            members,
        } => {
            let generated = constructor
                .as_ref()
                .is_some_and(|c| c.declaring.contains_generated());
            Expr::New {
                // A bag is built from its members, not by a constructor.
                constructor: if generated { None } else { constructor },
                arguments,
                members: members.iter().map(retarget_member).collect(),
            }
        }
        Expr::MemberInit { new_expr, bindings } => Expr::MemberInit {
            new_expr,
            bindings: retarget_bindings(bindings),
        },
        Expr::TypeBinary {
            op,
            operand,
            type_operand,
        } => Expr::TypeBinary {
            op,
            operand,
            type_operand: type_operand.replace_generated(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ConstructorDesc, FieldDesc, MethodDefinition, MethodDesc, PropertyDesc};
    use crate::duplex::{DuplexRef, MockCallbackRegistrar};
    use futures::stream;
    use pretty_assertions::assert_eq;

    fn anonymous() -> TypeDesc {
        TypeDesc::Generated {
            name: "<>f__AnonymousType0".to_string(),
            fields: vec![("Name".to_string(), TypeDesc::string())],
        }
    }

    fn registrar() -> MockCallbackRegistrar {
        let mut registrar = MockCallbackRegistrar::new();
        let mut next = 0;
        registrar.expect_register().returning(move |value| {
            next += 1;
            Ok(DuplexRef {
                id: next,
                kind: value.duplex_kind().unwrap_or(DuplexKind::Invoke),
            })
        });
        registrar
    }

    #[test]
    fn test_known_plan_is_untouched() {
        let registry = KnownTypeRegistry::new();
        let bindings = HostBindings::new();
        let x = build::parameter("x", TypeDesc::int());
        let plan = build::lambda(vec![x.clone()], build::add(x.clone(), build::int(1)));
        let rewritten = LocalEvaluationVisitor::new(&registry, &bindings)
            .rewrite(&plan)
            .unwrap();
        assert!(Node::ptr_eq(&rewritten, &plan));
    }

    #[test]
    fn test_host_stream_becomes_observable_reference() {
        let registry = KnownTypeRegistry::new();
        let bindings = HostBindings::new();
        let registrar = registrar();
        let source = HostValue::stream(|| Box::pin(stream::empty()));
        let plan = build::constant(Value::Host(source), TypeDesc::object());

        let rewritten = LocalEvaluationVisitor::new(&registry, &bindings)
            .with_registrar(&registrar)
            .rewrite(&plan)
            .unwrap();
        assert_eq!(
            rewritten.as_constant(),
            Some(&Value::Duplex(DuplexRef {
                id: 1,
                kind: DuplexKind::Observable
            }))
        );
        assert_eq!(rewritten.ty(), &TypeDesc::named(well_known::OBSERVABLE));
    }

    #[test]
    fn test_host_value_without_registrar_fails() {
        let registry = KnownTypeRegistry::new();
        let bindings = HostBindings::new();
        let f = HostValue::function(|_| async { Ok(Value::Null) });
        let plan = build::constant(Value::Host(f), TypeDesc::object());
        assert!(matches!(
            LocalEvaluationVisitor::new(&registry, &bindings).rewrite(&plan),
            Err(EvalError::Unrepresentable(_))
        ));
    }

    #[test]
    fn test_generated_types_become_property_bags() {
        let registry = KnownTypeRegistry::new();
        let bindings = HostBindings::new();
        let row = build::parameter("row", anonymous());
        let name = build::member(
            Some(row.clone()),
            MemberDesc::Field(FieldDesc {
                declaring: anonymous(),
                name: "Name".to_string(),
                ty: TypeDesc::string(),
            }),
        );
        let plan = build::lambda(vec![row.clone()], name);

        let rewritten = LocalEvaluationVisitor::new(&registry, &bindings)
            .rewrite(&plan)
            .unwrap();
        assert_eq!(
            rewritten.ty(),
            &TypeDesc::function(vec![TypeDesc::property_bag()], TypeDesc::string())
        );
        let Expr::Lambda {
            parameters, body, ..
        } = rewritten.expr()
        else {
            panic!("expected lambda");
        };
        let Expr::MemberAccess { object, member } = body.expr() else {
            panic!("expected member access");
        };
        // The parameter stays shared between the lambda and its use.
        assert!(Node::ptr_eq(&parameters[0], object.as_ref().unwrap()));
        assert_eq!(
            member,
            &MemberDesc::Property(PropertyDesc::new(
                TypeDesc::property_bag(),
                "Name",
                TypeDesc::string()
            ))
        );
    }

    #[test]
    fn test_generated_construction_drops_constructor() {
        let registry = KnownTypeRegistry::new();
        let bindings = HostBindings::new();
        let plan = Node::new(
            anonymous(),
            Expr::New {
                constructor: Some(ConstructorDesc {
                    declaring: anonymous(),
                    params: vec![TypeDesc::string()],
                }),
                arguments: vec![build::string("a")],
                members: vec![MemberDesc::Property(PropertyDesc::new(
                    anonymous(),
                    "Name",
                    TypeDesc::string(),
                ))],
            },
        );
        let rewritten = LocalEvaluationVisitor::new(&registry, &bindings)
            .rewrite(&plan)
            .unwrap();
        assert_eq!(rewritten.ty(), &TypeDesc::property_bag());
        let Expr::New {
            constructor,
            members,
            ..
        } = rewritten.expr()
        else {
            panic!("expected new");
        };
        assert!(constructor.is_none());
        assert_eq!(members[0].declaring(), &TypeDesc::property_bag());
    }

    #[test]
    fn test_bound_members() {
        let registry = KnownTypeRegistry::new();
        let registrar = registrar();
        let bindings = HostBindings::new()
            .bind_value("Settings.Threshold", Value::Int(10))
            .bind_function(
                "Pricing.Quote",
                HostValue::function(|args| async move { Ok(args[0].clone()) }),
            );

        let threshold = build::member(
            None,
            MemberDesc::Property(PropertyDesc::new(
                TypeDesc::named("Settings"),
                "Threshold",
                TypeDesc::int(),
            )),
        );
        let quote = MethodDesc::simple(
            MethodDefinition::new(
                TypeDesc::named("Pricing"),
                "Quote",
                vec![TypeDesc::string()],
                TypeDesc::float(),
            )
            .static_method(),
        );
        let plan = build::block(
            vec![],
            vec![threshold, build::call(None, quote, vec![build::string("ACME")])],
        );

        let rewritten = LocalEvaluationVisitor::new(&registry, &bindings)
            .with_registrar(&registrar)
            .rewrite(&plan)
            .unwrap();
        let Expr::Block { expressions, .. } = rewritten.expr() else {
            panic!("expected block");
        };
        assert_eq!(expressions[0].as_constant(), Some(&Value::Int(10)));
        let Expr::Invocation { target, arguments } = expressions[1].expr() else {
            panic!("expected invocation");
        };
        assert_eq!(
            target.as_constant(),
            Some(&Value::Duplex(DuplexRef {
                id: 1,
                kind: DuplexKind::Invoke
            }))
        );
        assert_eq!(arguments.len(), 1);
        assert_eq!(expressions[1].ty(), &TypeDesc::float());
    }
}
