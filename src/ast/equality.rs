//! # Plan Equality
//!
//! [`PlanEqualityComparator`] walks two plans in lock-step. The left tree is
//! visited recursively; the matching right-hand node is kept on an explicit
//! `others` stack and popped by each handler, so one comparator instance
//! drives both trees.
//!
//! For every node pair the comparator:
//!
//! 1. asks [`EquivalenceStrategy::short_circuit`] (wildcards in tests),
//! 2. compares the shallow shape (kind and result type),
//! 3. compares node-specific metadata (operators, members, constants),
//! 4. recurses pairwise into children.
//!
//! The first mismatch freezes the result; the offending pair is available
//! from [`EqualityOutcome::mismatch`] and all later work is skipped.
//!
//! Parameters are compared by binding: two parameter uses are equal when
//! they are bound at the same position of corresponding lambdas, blocks or
//! catch blocks. Free parameters compare by name and type. Labels are paired
//! at first occurrence and must stay paired for the rest of the walk.
//!
//! Catch handlers are compared by the sequence of their declared exception
//! types only; handler bodies are not visited.

use crate::value::Value;

use super::{
    ElementInit, Expr, LabelTarget, MemberBinding, MemberDesc, MethodDesc, Node, TypeDesc,
};

/// Pluggable equivalence used by [`PlanEqualityComparator`].
pub trait EquivalenceStrategy {
    /// Decides a pair outright before any structural comparison.
    fn short_circuit(&self, _left: &Node, _right: &Node) -> Option<bool> {
        None
    }

    fn shallow(&self, left: &Node, right: &Node) -> bool {
        left.kind() == right.kind() && self.types(left.ty(), right.ty())
    }

    fn types(&self, left: &TypeDesc, right: &TypeDesc) -> bool {
        left == right
    }

    fn members(&self, left: &MemberDesc, right: &MemberDesc) -> bool {
        left == right
    }

    fn methods(&self, left: &MethodDesc, right: &MethodDesc) -> bool {
        left == right
    }

    fn values(&self, left: &Value, right: &Value) -> bool {
        left == right
    }
}

/// Exact structural equivalence.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralEquivalence;

impl EquivalenceStrategy for StructuralEquivalence {}

#[derive(Debug, Clone)]
pub struct EqualityOutcome {
    pub equal: bool,
    /// First diverging `(left, right)` pair.
    pub mismatch: Option<(Node, Node)>,
}

pub fn plan_equals(left: &Node, right: &Node) -> bool {
    PlanEqualityComparator::new(StructuralEquivalence)
        .compare(left, right)
        .equal
}

pub struct PlanEqualityComparator<S: EquivalenceStrategy = StructuralEquivalence> {
    strategy: S,
    others: Vec<Node>,
    scopes: Vec<(Vec<Node>, Vec<Node>)>,
    labels: Vec<(LabelTarget, LabelTarget)>,
    equal: bool,
    mismatch: Option<(Node, Node)>,
}

impl<S: EquivalenceStrategy> PlanEqualityComparator<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            others: Vec::new(),
            scopes: Vec::new(),
            labels: Vec::new(),
            equal: true,
            mismatch: None,
        }
    }

    pub fn compare(&mut self, left: &Node, right: &Node) -> EqualityOutcome {
        self.others.clear();
        self.scopes.clear();
        self.labels.clear();
        self.equal = true;
        self.mismatch = None;

        self.pair(left, right);

        EqualityOutcome {
            equal: self.equal,
            mismatch: self.mismatch.take(),
        }
    }

    fn fail(&mut self, left: &Node, right: &Node) {
        if self.equal {
            self.equal = false;
            self.mismatch = Some((left.clone(), right.clone()));
        }
    }

    fn check(&mut self, ok: bool, left: &Node, right: &Node) -> bool {
        if !ok {
            self.fail(left, right);
        }
        self.equal
    }

    fn pair(&mut self, left: &Node, right: &Node) {
        if !self.equal {
            return;
        }
        self.others.push(right.clone());
        self.visit(left);
    }

    fn all(&mut self, at: (&Node, &Node), left: &[Node], right: &[Node]) {
        if !self.check(left.len() == right.len(), at.0, at.1) {
            return;
        }
        for (l, r) in left.iter().zip(right) {
            self.pair(l, r);
        }
    }

    fn opt(&mut self, at: (&Node, &Node), left: Option<&Node>, right: Option<&Node>) {
        match (left, right) {
            (Some(l), Some(r)) => self.pair(l, r),
            (None, None) => {}
            _ => self.fail(at.0, at.1),
        }
    }

    fn opt_method(&self, left: Option<&MethodDesc>, right: Option<&MethodDesc>) -> bool {
        match (left, right) {
            (Some(l), Some(r)) => self.strategy.methods(l, r),
            (None, None) => true,
            _ => false,
        }
    }

    fn label(&mut self, left: &LabelTarget, right: &LabelTarget) -> bool {
        for (l, r) in &self.labels {
            let left_seen = LabelTarget::ptr_eq(l, left);
            let right_seen = LabelTarget::ptr_eq(r, right);
            if left_seen || right_seen {
                return left_seen && right_seen;
            }
        }
        if left.name() != right.name() || !self.strategy.types(left.ty(), right.ty()) {
            return false;
        }
        self.labels.push((left.clone(), right.clone()));
        true
    }

    fn opt_label(&mut self, left: Option<&LabelTarget>, right: Option<&LabelTarget>) -> bool {
        match (left, right) {
            (Some(l), Some(r)) => self.label(l, r),
            (None, None) => true,
            _ => false,
        }
    }

    fn binding(&self, left: &Node, right: &Node) -> bool {
        let position = |scopes: &[(Vec<Node>, Vec<Node>)], node: &Node, left_side: bool| {
            scopes.iter().enumerate().rev().find_map(|(depth, (l, r))| {
                let side = if left_side { l } else { r };
                side.iter()
                    .position(|p| Node::ptr_eq(p, node))
                    .map(|index| (depth, index))
            })
        };
        match (
            position(&self.scopes, left, true),
            position(&self.scopes, right, false),
        ) {
            (Some(l), Some(r)) => l == r,
            (None, None) => match (left.expr(), right.expr()) {
                (
                    Expr::Parameter {
                        name: ln,
                        by_ref: lr,
                    },
                    Expr::Parameter {
                        name: rn,
                        by_ref: rr,
                    },
                ) => ln == rn && lr == rr,
                _ => false,
            },
            _ => false,
        }
    }

    fn with_scope(&mut self, left: &[Node], right: &[Node], f: impl FnOnce(&mut Self)) {
        self.scopes.push((left.to_vec(), right.to_vec()));
        f(self);
        self.scopes.pop();
    }

    fn inits(&mut self, at: (&Node, &Node), left: &[ElementInit], right: &[ElementInit]) {
        if !self.check(left.len() == right.len(), at.0, at.1) {
            return;
        }
        for (l, r) in left.iter().zip(right) {
            let same = self.strategy.methods(&l.add_method, &r.add_method);
            if !self.check(same, at.0, at.1) {
                return;
            }
            self.all(at, &l.arguments, &r.arguments);
        }
    }

    fn bindings(&mut self, at: (&Node, &Node), left: &[MemberBinding], right: &[MemberBinding]) {
        if !self.check(left.len() == right.len(), at.0, at.1) {
            return;
        }
        for (l, r) in left.iter().zip(right) {
            if !self.check(self.strategy.members(l.member(), r.member()), at.0, at.1) {
                return;
            }
            match (l, r) {
                (
                    MemberBinding::Assignment { expression: le, .. },
                    MemberBinding::Assignment { expression: re, .. },
                ) => self.pair(le, re),
                (
                    MemberBinding::List {
                        initializers: li, ..
                    },
                    MemberBinding::List {
                        initializers: ri, ..
                    },
                ) => self.inits(at, li, ri),
                (
                    MemberBinding::Member { bindings: lb, .. },
                    MemberBinding::Member { bindings: rb, .. },
                ) => self.bindings(at, lb, rb),
                _ => self.fail(at.0, at.1),
            }
        }
    }

    fn visit(&mut self, left: &Node) {
        let Some(right) = self.others.pop() else {
            return;
        };
        if !self.equal {
            return;
        }
        if let Some(decided) = self.strategy.short_circuit(left, &right) {
            self.check(decided, left, &right);
            return;
        }
        if !self.check(self.strategy.shallow(left, &right), left, &right) {
            return;
        }

        let at = (left, &right);
        match (left.expr(), right.expr()) {
            (
                Expr::Binary {
                    op: lo,
                    left: ll,
                    right: lr,
                    method: lm,
                },
                Expr::Binary {
                    op: ro,
                    left: rl,
                    right: rr,
                    method: rm,
                },
            ) => {
                let same = lo == ro && self.opt_method(lm.as_ref(), rm.as_ref());
                if self.check(same, at.0, at.1) {
                    self.pair(ll, rl);
                    self.pair(lr, rr);
                }
            }
            (
                Expr::Block {
                    variables: lv,
                    expressions: le,
                },
                Expr::Block {
                    variables: rv,
                    expressions: re,
                },
            ) => {
                if self.check(lv.len() == rv.len(), at.0, at.1) {
                    self.with_scope(lv, rv, |this| {
                        this.all(at, lv, rv);
                        this.all(at, le, re);
                    });
                }
            }
            (
                Expr::Conditional {
                    test: lt,
                    if_true: la,
                    if_false: lb,
                },
                Expr::Conditional {
                    test: rt,
                    if_true: ra,
                    if_false: rb,
                },
            ) => {
                self.pair(lt, rt);
                self.pair(la, ra);
                self.pair(lb, rb);
            }
            (Expr::Constant(lv), Expr::Constant(rv)) => {
                let same = self.strategy.values(lv, rv);
                self.check(same, at.0, at.1);
            }
            (Expr::Default, Expr::Default) => {}
            (
                Expr::Goto {
                    kind: lk,
                    target: lt,
                    value: lv,
                },
                Expr::Goto {
                    kind: rk,
                    target: rt,
                    value: rv,
                },
            ) => {
                let same = lk == rk && self.label(lt, rt);
                if self.check(same, at.0, at.1) {
                    self.opt(at, lv.as_ref(), rv.as_ref());
                }
            }
            (
                Expr::Index {
                    object: lo,
                    indexer: li,
                    arguments: la,
                },
                Expr::Index {
                    object: ro,
                    indexer: ri,
                    arguments: ra,
                },
            ) => {
                if self.check(li == ri, at.0, at.1) {
                    self.pair(lo, ro);
                    self.all(at, la, ra);
                }
            }
            (
                Expr::Invocation {
                    target: lt,
                    arguments: la,
                },
                Expr::Invocation {
                    target: rt,
                    arguments: ra,
                },
            ) => {
                self.pair(lt, rt);
                self.all(at, la, ra);
            }
            (
                Expr::Label {
                    target: lt,
                    default_value: lv,
                },
                Expr::Label {
                    target: rt,
                    default_value: rv,
                },
            ) => {
                let same = self.label(lt, rt);
                if self.check(same, at.0, at.1) {
                    self.opt(at, lv.as_ref(), rv.as_ref());
                }
            }
            (
                Expr::Lambda {
                    name: ln,
                    parameters: lp,
                    body: lb,
                },
                Expr::Lambda {
                    name: rn,
                    parameters: rp,
                    body: rb,
                },
            ) => {
                if self.check(ln == rn && lp.len() == rp.len(), at.0, at.1) {
                    self.with_scope(lp, rp, |this| {
                        this.all(at, lp, rp);
                        this.pair(lb, rb);
                    });
                }
            }
            (
                Expr::ListInit {
                    new_expr: ln,
                    initializers: li,
                },
                Expr::ListInit {
                    new_expr: rn,
                    initializers: ri,
                },
            ) => {
                self.pair(ln, rn);
                self.inits(at, li, ri);
            }
            (
                Expr::Loop {
                    body: lb,
                    break_label: lbr,
                    continue_label: lc,
                },
                Expr::Loop {
                    body: rb,
                    break_label: rbr,
                    continue_label: rc,
                },
            ) => {
                let same = self.opt_label(lbr.as_ref(), rbr.as_ref())
                    && self.opt_label(lc.as_ref(), rc.as_ref());
                if self.check(same, at.0, at.1) {
                    self.pair(lb, rb);
                }
            }
            (
                Expr::MemberAccess {
                    object: lo,
                    member: lm,
                },
                Expr::MemberAccess {
                    object: ro,
                    member: rm,
                },
            ) => {
                if self.check(self.strategy.members(lm, rm), at.0, at.1) {
                    self.opt(at, lo.as_ref(), ro.as_ref());
                }
            }
            (
                Expr::MemberInit {
                    new_expr: ln,
                    bindings: lb,
                },
                Expr::MemberInit {
                    new_expr: rn,
                    bindings: rb,
                },
            ) => {
                self.pair(ln, rn);
                self.bindings(at, lb, rb);
            }
            (
                Expr::Call {
                    object: lo,
                    method: lm,
                    arguments: la,
                },
                Expr::Call {
                    object: ro,
                    method: rm,
                    arguments: ra,
                },
            ) => {
                if self.check(self.strategy.methods(lm, rm), at.0, at.1) {
                    self.opt(at, lo.as_ref(), ro.as_ref());
                    self.all(at, la, ra);
                }
            }
            (
                Expr::New {
                    constructor: lc,
                    arguments: la,
                    members: lm,
                },
                Expr::New {
                    constructor: rc,
                    arguments: ra,
                    members: rm,
                },
            ) => {
                let same = lc == rc
                    && lm.len() == rm.len()
                    && lm
                        .iter()
                        .zip(rm)
                        .all(|(l, r)| self.strategy.members(l, r));
                if self.check(same, at.0, at.1) {
                    self.all(at, la, ra);
                }
            }
            (
                Expr::NewArray {
                    kind: lk,
                    expressions: le,
                },
                Expr::NewArray {
                    kind: rk,
                    expressions: re,
                },
            ) => {
                if self.check(lk == rk, at.0, at.1) {
                    self.all(at, le, re);
                }
            }
            (Expr::Parameter { .. }, Expr::Parameter { .. }) => {
                let same = self.binding(left, &right);
                self.check(same, at.0, at.1);
            }
            (
                Expr::RuntimeVariables { variables: lv },
                Expr::RuntimeVariables { variables: rv },
            ) => self.all(at, lv, rv),
            (
                Expr::Switch {
                    value: lv,
                    cases: lc,
                    default_body: ld,
                    comparison: lm,
                },
                Expr::Switch {
                    value: rv,
                    cases: rc,
                    default_body: rd,
                    comparison: rm,
                },
            ) => {
                let same = lc.len() == rc.len() && self.opt_method(lm.as_ref(), rm.as_ref());
                if self.check(same, at.0, at.1) {
                    self.pair(lv, rv);
                    for (l, r) in lc.iter().zip(rc) {
                        self.all(at, &l.test_values, &r.test_values);
                        self.pair(&l.body, &r.body);
                    }
                    self.opt(at, ld.as_ref(), rd.as_ref());
                }
            }
            (
                Expr::Try {
                    body: lb,
                    handlers: lh,
                    finally: lf,
                    fault: lt,
                },
                Expr::Try {
                    body: rb,
                    handlers: rh,
                    finally: rf,
                    fault: rt,
                },
            ) => {
                let same = lh.len() == rh.len()
                    && lh
                        .iter()
                        .zip(rh)
                        .all(|(l, r)| self.strategy.types(&l.test, &r.test));
                if self.check(same, at.0, at.1) {
                    self.pair(lb, rb);
                    self.opt(at, lf.as_ref(), rf.as_ref());
                    self.opt(at, lt.as_ref(), rt.as_ref());
                }
            }
            (
                Expr::TypeBinary {
                    op: lo,
                    operand: lv,
                    type_operand: lt,
                },
                Expr::TypeBinary {
                    op: ro,
                    operand: rv,
                    type_operand: rt,
                },
            ) => {
                let same = lo == ro && self.strategy.types(lt, rt);
                if self.check(same, at.0, at.1) {
                    self.pair(lv, rv);
                }
            }
            (
                Expr::Unary {
                    op: lo,
                    operand: lv,
                    method: lm,
                },
                Expr::Unary {
                    op: ro,
                    operand: rv,
                    method: rm,
                },
            ) => {
                let same = lo == ro && self.opt_method(lm.as_ref(), rm.as_ref());
                if self.check(same, at.0, at.1) {
                    self.pair(lv, rv);
                }
            }
            _ => self.fail(at.0, at.1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::ast::{BinaryOp, NodeKind};
    use proptest::prelude::*;

    fn int_params() -> (Node, Node) {
        (
            build::parameter("x", TypeDesc::int()),
            build::parameter("y", TypeDesc::int()),
        )
    }

    #[test]
    fn test_first_mismatch_is_the_differing_leaf() {
        let (x, _) = int_params();
        let left = build::lambda(
            vec![x.clone()],
            build::add(x.clone(), build::add(build::int(1), build::int(2))),
        );
        let (x2, _) = int_params();
        let right = build::lambda(
            vec![x2.clone()],
            build::add(x2.clone(), build::add(build::int(1), build::int(3))),
        );

        let outcome = PlanEqualityComparator::new(StructuralEquivalence).compare(&left, &right);
        assert!(!outcome.equal);
        let (l, r) = outcome.mismatch.unwrap();
        assert_eq!(l.as_constant(), Some(&Value::Int(2)));
        assert_eq!(r.as_constant(), Some(&Value::Int(3)));
    }

    #[test]
    fn test_parameters_compare_by_binding() {
        let (x, y) = int_params();
        // (x, y) => x + y  vs  (y, x) => y + x : alpha-equivalent.
        let a = build::lambda(vec![x.clone(), y.clone()], build::add(x.clone(), y.clone()));
        let b = build::lambda(vec![y.clone(), x.clone()], build::add(y.clone(), x.clone()));
        assert!(plan_equals(&a, &b));

        // (x, y) => x + y  vs  (x, y) => y + x : not equivalent.
        let c = build::lambda(vec![x.clone(), y.clone()], build::add(y, x));
        assert!(!plan_equals(&a, &c));
    }

    #[test]
    fn test_length_mismatch_reports_parent() {
        let (x, y) = int_params();
        let a = build::lambda(vec![x.clone()], x.clone());
        let b = build::lambda(vec![x.clone(), y], x);
        let outcome = PlanEqualityComparator::new(StructuralEquivalence).compare(&a, &b);
        // Types differ already (fn(Int) vs fn(Int, Int)).
        let (l, _) = outcome.mismatch.unwrap();
        assert_eq!(l.kind(), NodeKind::Lambda);
    }

    #[test]
    fn test_catch_blocks_compare_by_test_type() {
        let a = build::try_catch(
            build::int(1),
            vec![build::catch(TypeDesc::exception(), None, build::int(0))],
        );
        let b = build::try_catch(
            build::int(1),
            vec![build::catch(TypeDesc::exception(), None, build::int(5))],
        );
        let c = build::try_catch(
            build::int(1),
            vec![build::catch(TypeDesc::named("IoError"), None, build::int(0))],
        );
        assert!(plan_equals(&a, &b));
        assert!(!plan_equals(&a, &c));
    }

    struct ConstantWildcard;

    impl EquivalenceStrategy for ConstantWildcard {
        fn short_circuit(&self, left: &Node, right: &Node) -> Option<bool> {
            (left.as_constant().is_some() && right.as_constant().is_some()).then_some(true)
        }
    }

    #[test]
    fn test_short_circuit_wildcard() {
        let a = build::add(build::int(1), build::int(2));
        let b = build::add(build::int(7), build::int(9));
        assert!(!plan_equals(&a, &b));
        assert!(
            PlanEqualityComparator::new(ConstantWildcard)
                .compare(&a, &b)
                .equal
        );
    }

    fn arb_plan() -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            (0i64..4).prop_map(build::int),
            Just(build::parameter("p", TypeDesc::int())),
        ];
        leaf.prop_recursive(4, 32, 2, |inner| {
            (
                prop_oneof![
                    Just(BinaryOp::Add),
                    Just(BinaryOp::Subtract),
                    Just(BinaryOp::Multiply)
                ],
                inner.clone(),
                inner,
            )
                .prop_map(|(op, l, r)| build::binary(op, l, r))
        })
    }

    proptest! {
        #[test]
        fn test_equality_is_reflexive(a in arb_plan()) {
            prop_assert!(plan_equals(&a, &a));
        }

        #[test]
        fn test_equality_is_symmetric(a in arb_plan(), b in arb_plan()) {
            prop_assert_eq!(plan_equals(&a, &b), plan_equals(&b, &a));
        }
    }
}
