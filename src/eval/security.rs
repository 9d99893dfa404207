use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::{debug, instrument};

use super::known_types::KnownTypeRegistry;
use crate::ast::{Expr, MemberBinding, MemberDesc, Node, NodeKind, TypeDesc, UnaryOp};

/// Capability toggles checked on the server. Everything is allowed by
/// default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityOptions {
    #[serde(default = "default_true")]
    pub allow_block: bool,
    #[serde(default = "default_true")]
    pub allow_loop: bool,
    #[serde(default = "default_true")]
    pub allow_goto: bool,
    #[serde(default = "default_true")]
    pub allow_try: bool,
    #[serde(default = "default_true")]
    pub allow_catch: bool,
    #[serde(default = "default_true")]
    pub allow_assignment: bool,
    #[serde(default = "default_true")]
    pub allow_new_array: bool,
    #[serde(default = "default_true")]
    pub allow_constructor: bool,
    #[serde(default = "default_true")]
    pub allow_type_test: bool,
    #[serde(default = "default_true")]
    pub allow_explicit_conversion: bool,
    #[serde(default = "default_true")]
    pub allow_void_call: bool,
    #[serde(default = "default_true")]
    pub allow_extension_methods: bool,
    /// Reject constants, constructions and calls on types outside the
    /// known-type registry.
    #[serde(default = "default_true")]
    pub restrict_types: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            allow_block: true,
            allow_loop: true,
            allow_goto: true,
            allow_try: true,
            allow_catch: true,
            allow_assignment: true,
            allow_new_array: true,
            allow_constructor: true,
            allow_type_test: true,
            allow_explicit_conversion: true,
            allow_void_call: true,
            allow_extension_methods: true,
            restrict_types: true,
        }
    }
}

impl SecurityOptions {
    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Block => self.allow_block,
            Capability::Loop => self.allow_loop,
            Capability::Goto => self.allow_goto,
            Capability::Try => self.allow_try,
            Capability::Catch => self.allow_catch,
            Capability::Assignment => self.allow_assignment,
            Capability::NewArray => self.allow_new_array,
            Capability::Constructor => self.allow_constructor,
            Capability::TypeTest => self.allow_type_test,
            Capability::ExplicitConversion => self.allow_explicit_conversion,
            Capability::VoidCall => self.allow_void_call,
            Capability::ExtensionMethod => self.allow_extension_methods,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Capability {
    Block,
    Loop,
    Goto,
    Try,
    Catch,
    Assignment,
    NewArray,
    Constructor,
    TypeTest,
    ExplicitConversion,
    VoidCall,
    ExtensionMethod,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityViolation {
    #[error("{capability} is not allowed ({kind} node)")]
    Disallowed {
        capability: Capability,
        kind: NodeKind,
    },
    #[error("Type {0} is not allowed")]
    UnknownType(String),
    #[error("Member {0} is not allowed")]
    UnknownMember(String),
}

/// Pass/fail check of a plan against [`SecurityOptions`] and the known-type
/// allowlist. Nodes are checked in pre-order and the first violation wins.
pub struct SecurityVisitor {
    options: SecurityOptions,
    registry: Arc<KnownTypeRegistry>,
}

impl SecurityVisitor {
    pub fn new(options: SecurityOptions, registry: Arc<KnownTypeRegistry>) -> Self {
        Self { options, registry }
    }

    #[instrument(level = "debug", skip_all)]
    pub fn check(&self, root: &Node) -> Result<(), SecurityViolation> {
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.id()) {
                continue;
            }
            self.check_node(&node)?;
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
        }
        debug!("Plan passed security check ({} nodes)", visited.len());
        Ok(())
    }

    fn require(&self, capability: Capability, node: &Node) -> Result<(), SecurityViolation> {
        if self.options.allows(capability) {
            Ok(())
        } else {
            Err(SecurityViolation::Disallowed {
                capability,
                kind: node.kind(),
            })
        }
    }

    fn require_type(&self, ty: &TypeDesc) -> Result<(), SecurityViolation> {
        if self.options.restrict_types && !self.registry.is_known_type(ty) {
            return Err(SecurityViolation::UnknownType(ty.to_string()));
        }
        Ok(())
    }

    fn require_member(&self, member: &MemberDesc) -> Result<(), SecurityViolation> {
        if self.options.restrict_types && !self.registry.is_known_member(member) {
            return Err(SecurityViolation::UnknownMember(member.to_string()));
        }
        Ok(())
    }

    fn require_bindings(&self, bindings: &[MemberBinding]) -> Result<(), SecurityViolation> {
        for binding in bindings {
            self.require_member(binding.member())?;
            if let MemberBinding::Member { bindings, .. } = binding {
                self.require_bindings(bindings)?;
            }
        }
        Ok(())
    }

    fn check_node(&self, node: &Node) -> Result<(), SecurityViolation> {
        match node.expr() {
            Expr::Block { .. } => self.require(Capability::Block, node),
            Expr::Loop { .. } => self.require(Capability::Loop, node),
            Expr::Goto { .. } => self.require(Capability::Goto, node),
            Expr::Try { handlers, .. } => {
                self.require(Capability::Try, node)?;
                if !handlers.is_empty() {
                    self.require(Capability::Catch, node)?;
                }
                for handler in handlers {
                    self.require_type(&handler.test)?;
                }
                Ok(())
            }
            Expr::Binary { op, .. } if op.is_assignment() => {
                self.require(Capability::Assignment, node)
            }
            Expr::NewArray { .. } => {
                self.require(Capability::NewArray, node)?;
                self.require_type(node.ty())
            }
            Expr::New {
                constructor,
                members,
                ..
            } => {
                if constructor.is_some() {
                    self.require(Capability::Constructor, node)?;
                }
                for member in members {
                    self.require_member(member)?;
                }
                self.require_type(node.ty())
            }
            Expr::TypeBinary { type_operand, .. } => {
                self.require(Capability::TypeTest, node)?;
                self.require_type(type_operand)
            }
            Expr::Unary { op, .. } => match op {
                UnaryOp::TypeAs => {
                    self.require(Capability::TypeTest, node)?;
                    self.require_type(node.ty())
                }
                op if op.is_explicit_conversion() => {
                    self.require(Capability::ExplicitConversion, node)?;
                    self.require_type(node.ty())
                }
                _ => Ok(()),
            },
            Expr::Call { method, .. } => {
                if method.return_type().is_unit() {
                    self.require(Capability::VoidCall, node)?;
                }
                if method.is_extension() {
                    self.require(Capability::ExtensionMethod, node)?;
                }
                if self.options.restrict_types && !self.registry.is_known_method(method) {
                    return Err(SecurityViolation::UnknownMember(method.key()));
                }
                Ok(())
            }
            Expr::Constant(_) => self.require_type(node.ty()),
            Expr::MemberAccess { member, .. } => self.require_member(member),
            Expr::MemberInit { bindings, .. } => self.require_bindings(bindings),
            Expr::ListInit { initializers, .. } => {
                for init in initializers {
                    if self.options.restrict_types && !self.registry.is_known_method(&init.add_method)
                    {
                        return Err(SecurityViolation::UnknownMember(init.add_method.key()));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{LabelTarget, MethodDefinition, MethodDesc, build};
    use pretty_assertions::assert_eq;

    fn visitor(options: SecurityOptions) -> SecurityVisitor {
        SecurityVisitor::new(options, Arc::new(KnownTypeRegistry::new()))
    }

    fn counting_loop() -> Node {
        let exit = LabelTarget::new(Some("exit"), TypeDesc::unit());
        build::loop_with(build::break_to(exit.clone(), None), Some(exit), None)
    }

    #[test]
    fn test_default_options_allow_everything_known() {
        let x = build::parameter("x", TypeDesc::int());
        let plan = build::lambda(
            vec![x.clone()],
            build::block(vec![], vec![counting_loop(), build::add(x.clone(), build::int(1))]),
        );
        assert_eq!(visitor(SecurityOptions::default()).check(&plan), Ok(()));
    }

    #[test]
    fn test_each_toggle_is_independent() {
        let plan = build::block(vec![], vec![counting_loop()]);
        let no_loop = SecurityOptions {
            allow_loop: false,
            ..SecurityOptions::default()
        };
        assert_eq!(
            visitor(no_loop).check(&plan),
            Err(SecurityViolation::Disallowed {
                capability: Capability::Loop,
                kind: NodeKind::Loop
            })
        );

        // Blocks are checked first in pre-order.
        let no_block_no_loop = SecurityOptions {
            allow_block: false,
            allow_loop: false,
            ..SecurityOptions::default()
        };
        assert_eq!(
            visitor(no_block_no_loop).check(&plan),
            Err(SecurityViolation::Disallowed {
                capability: Capability::Block,
                kind: NodeKind::Block
            })
        );
    }

    #[test]
    fn test_assignment_and_conversion() {
        let v = build::parameter("v", TypeDesc::int());
        let assign = build::assign(v.clone(), build::int(3));
        let options = SecurityOptions {
            allow_assignment: false,
            ..SecurityOptions::default()
        };
        assert!(matches!(
            visitor(options).check(&assign),
            Err(SecurityViolation::Disallowed {
                capability: Capability::Assignment,
                ..
            })
        ));

        let convert = build::convert(build::int(1), TypeDesc::float());
        let options = SecurityOptions {
            allow_explicit_conversion: false,
            ..SecurityOptions::default()
        };
        assert!(visitor(options).check(&convert).is_err());
    }

    #[test]
    fn test_unknown_types_and_members() {
        let customer = TypeDesc::named("Customer");
        let constant = build::null(customer.clone());
        assert_eq!(
            visitor(SecurityOptions::default()).check(&constant),
            Err(SecurityViolation::UnknownType("Customer".to_string()))
        );

        let relaxed = SecurityOptions {
            restrict_types: false,
            ..SecurityOptions::default()
        };
        assert_eq!(visitor(relaxed).check(&constant), Ok(()));

        let registry = KnownTypeRegistry::new().with_type("Customer");
        let visitor = SecurityVisitor::new(SecurityOptions::default(), Arc::new(registry));
        let method = MethodDesc::simple(
            MethodDefinition::new(TypeDesc::named("Shell"), "Run", vec![], TypeDesc::int())
                .static_method(),
        );
        assert_eq!(
            visitor.check(&build::call(None, method, vec![])),
            Err(SecurityViolation::UnknownMember("Shell.Run".to_string()))
        );
    }

    #[test]
    fn test_void_and_extension_calls() {
        let registry = KnownTypeRegistry::new().with_type("Log");
        let write = MethodDesc::simple(
            MethodDefinition::new(TypeDesc::named("Log"), "Write", vec![TypeDesc::string()], TypeDesc::unit())
                .static_method(),
        );
        let plan = build::call(None, write, vec![build::string("hi")]);
        let options = SecurityOptions {
            allow_void_call: false,
            ..SecurityOptions::default()
        };
        let visitor = SecurityVisitor::new(options, Arc::new(registry));
        assert!(matches!(
            visitor.check(&plan),
            Err(SecurityViolation::Disallowed {
                capability: Capability::VoidCall,
                kind: NodeKind::Call
            })
        ));
    }
}
