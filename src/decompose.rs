//! Taylor decomposition of an ODE system.
//!
//! The right-hand sides are rewritten into a straight-line program over
//! `u`-variables: `u_0..u_{m-1}` are the state variables, followed by one
//! elementary assignment per distinct non-leaf node, followed by one
//! trailing alias per state identifying `dot x_i` with the final node of
//! its RHS (or with a literal/parameter for constant derivatives).
//!
//! Common subexpressions are eliminated through a content-addressed table
//! keyed by structural hash and equality, so structurally equal nodes end
//! up at the same `u` index no matter which RHS discovers them first. This
//! is what the N-body builder exploits when it shares `G*m_j*r^-3` factors
//! between body pairs.
//!
//! Functions may intern partner nodes next to themselves (sine interns its
//! cosine, tangent its own square); the partner index map travels with the
//! decomposition for the code generator's recurrences.

use std::collections::HashMap;

use itertools::Itertools;

use crate::errors::Error;
use crate::expr::{BinaryOp, ExprNode, Expression};
use crate::func::PartnerSpec;

/// The name of the `k`-th `u`-variable.
pub(crate) fn uname(k: u32) -> String {
    format!("u_{k}")
}

/// Parses a `u`-variable reference back into its index.
pub(crate) fn uidx(e: &Expression) -> Option<u32> {
    match e.node() {
        ExprNode::Var(name) => name.strip_prefix("u_")?.parse().ok(),
        _ => None,
    }
}

fn uref(k: u32) -> Expression {
    crate::expr::var(uname(k))
}

/// An operand of an elementary `u`-assignment, as the code generator sees
/// it: an earlier `u` column, an exact literal, or a runtime parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum UArg {
    U(u32),
    Num(f64),
    Par(u32),
}

pub(crate) fn uarg(e: &Expression) -> UArg {
    if let Some(k) = uidx(e) {
        return UArg::U(k);
    }
    match e.node() {
        ExprNode::Num(n) => UArg::Num(n.value()),
        ExprNode::Par(p) => UArg::Par(*p),
        _ => unreachable!("decomposition operands are elementary"),
    }
}

/// The ordered `u`-program of a system, plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct TaylorDecomposition {
    // [state variables | inner assignments | per-state aliases]
    u_defs: Vec<Expression>,
    n_state: usize,
    partner: HashMap<u32, u32>,
    n_pars: u32,
    state_names: Vec<String>,
}

struct DecomposeCtx {
    table: HashMap<Expression, u32>,
    u_defs: Vec<Expression>,
    partner: HashMap<u32, u32>,
    state_index: HashMap<String, u32>,
}

impl DecomposeCtx {
    fn intern_node(&mut self, e: Expression) -> u32 {
        if let Some(&idx) = self.table.get(&e) {
            return idx;
        }
        let idx = self.u_defs.len() as u32;
        self.u_defs.push(e.clone());
        self.table.insert(e, idx);
        idx
    }

    // Rewrites `e` into an elementary reference: leaves stay, state
    // variables become `u`-references, everything else is interned.
    fn decompose(&mut self, e: &Expression) -> Result<Expression, Error> {
        match e.node() {
            ExprNode::Num(_) | ExprNode::Par(_) => Ok(e.clone()),
            ExprNode::Var(name) => match self.state_index.get(name) {
                Some(&i) => Ok(uref(i)),
                None => Err(Error::CyclicSystem(format!(
                    "The variable '{name}' appearing in the system cannot be resolved to a state variable"
                ))),
            },
            ExprNode::Binary(op, l, r) => {
                let dl = self.decompose(l)?;
                let dr = self.decompose(r)?;
                let rebuilt = Expression::binary(*op, dl, dr);
                // A construction identity may collapse the node to a leaf.
                if matches!(rebuilt.node(), ExprNode::Binary(..)) {
                    Ok(uref(self.intern_node(rebuilt)))
                } else {
                    Ok(rebuilt)
                }
            }
            ExprNode::Func(f) => {
                let mut g = f.clone();
                for a in g.args_mut() {
                    *a = self.decompose(&a.clone())?;
                }
                let partner = g.taylor_partner();
                let node = Expression::from(g.clone());
                match partner {
                    PartnerSpec::None => Ok(uref(self.intern_node(node))),
                    PartnerSpec::Before(make) => {
                        let p = self.decompose(&make(g.args()[0].clone()))?;
                        let p_idx = uidx(&p).expect("partner chains end in a u node");
                        let idx = self.intern_node(node);
                        self.partner.insert(idx, p_idx);
                        Ok(uref(idx))
                    }
                    PartnerSpec::Mutual(make) => {
                        // The sibling's arguments are already in u form, so
                        // it is interned directly, without re-entering the
                        // partner hooks.
                        let sibling = make(g.args()[0].clone());
                        let sib_idx = self.intern_node(sibling);
                        let idx = self.intern_node(node);
                        self.partner.insert(idx, sib_idx);
                        self.partner.insert(sib_idx, idx);
                        Ok(uref(idx))
                    }
                    PartnerSpec::AfterSelfSquare => {
                        let idx = self.intern_node(node);
                        let q = self.decompose(&crate::math::square(uref(idx)))?;
                        let q_idx = uidx(&q).expect("square of a u node is a u node");
                        self.partner.insert(idx, q_idx);
                        Ok(uref(idx))
                    }
                }
            }
        }
    }
}

/// Decomposes an ordered list of `(state variable, rhs)` pairs.
///
/// Fails with [`Error::InvalidArg`] on an empty system, a non-variable LHS
/// or duplicate state names, and with [`Error::CyclicSystem`] when an RHS
/// references a variable that is not part of the state.
pub fn taylor_decompose(sys: &[(Expression, Expression)]) -> Result<TaylorDecomposition, Error> {
    if sys.is_empty() {
        return Err(Error::InvalidArg(
            "Cannot decompose a system of zero equations".to_string(),
        ));
    }

    let mut state_index = HashMap::new();
    let mut state_names = Vec::with_capacity(sys.len());
    for (i, (lhs, _)) in sys.iter().enumerate() {
        let name = match lhs.node() {
            ExprNode::Var(name) => name.clone(),
            _ => {
                return Err(Error::InvalidArg(format!(
                    "The left-hand side of equation {i} is not a variable: {lhs}"
                )))
            }
        };
        if state_index.insert(name.clone(), i as u32).is_some() {
            return Err(Error::InvalidArg(format!(
                "The state variable '{name}' appears twice on the left-hand side of the system"
            )));
        }
        state_names.push(name);
    }

    let mut ctx = DecomposeCtx {
        table: HashMap::new(),
        u_defs: sys.iter().map(|(lhs, _)| lhs.clone()).collect(),
        partner: HashMap::new(),
        state_index,
    };

    let mut aliases = Vec::with_capacity(sys.len());
    for (_, rhs) in sys {
        aliases.push(ctx.decompose(rhs)?);
    }
    ctx.u_defs.extend(aliases);

    let n_pars = max_par_index(&ctx.u_defs).map_or(0, |p| p + 1);

    Ok(TaylorDecomposition {
        u_defs: ctx.u_defs,
        n_state: sys.len(),
        partner: ctx.partner,
        n_pars,
        state_names,
    })
}

fn max_par_index(defs: &[Expression]) -> Option<u32> {
    fn walk(e: &Expression, max: &mut Option<u32>) {
        match e.node() {
            ExprNode::Par(p) => *max = Some(max.map_or(*p, |m| m.max(*p))),
            ExprNode::Binary(_, l, r) => {
                walk(l, max);
                walk(r, max);
            }
            ExprNode::Func(f) => {
                for a in f.args() {
                    walk(a, max);
                }
            }
            _ => {}
        }
    }
    let mut max = None;
    for d in defs {
        walk(d, &mut max);
    }
    max
}

/// The shape of an inner node, for grouping compatible entries into the
/// contiguous runs compact mode loops over.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Shape {
    /// A binary operation with at least one `u` operand; the flags record
    /// which operand classes appear (`u`, literal, parameter).
    Binary(BinaryOp, ArgClass, ArgClass),
    /// A function of one `u` argument, keyed by display name.
    Func(String),
    /// A node with no `u` operands: every coefficient above order zero
    /// vanishes.
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ArgClass {
    U,
    Num,
    Par,
}

impl BinaryOp {
    fn rank(self) -> u8 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
        }
    }
}

impl PartialOrd for BinaryOp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinaryOp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

fn arg_class(a: UArg) -> ArgClass {
    match a {
        UArg::U(_) => ArgClass::U,
        UArg::Num(_) => ArgClass::Num,
        UArg::Par(_) => ArgClass::Par,
    }
}

pub(crate) fn shape_of(def: &Expression) -> Shape {
    match def.node() {
        ExprNode::Binary(op, l, r) => {
            let cl = arg_class(uarg(l));
            let cr = arg_class(uarg(r));
            if cl != ArgClass::U && cr != ArgClass::U {
                Shape::Constant
            } else {
                Shape::Binary(*op, cl, cr)
            }
        }
        ExprNode::Func(f) => {
            // A nullary function (time) is not constant over the orders.
            let all_const = !f.args().is_empty()
                && f.args().iter().all(|a| !matches!(uarg(a), UArg::U(_)));
            if all_const {
                Shape::Constant
            } else {
                Shape::Func(f.display_name().to_string())
            }
        }
        _ => unreachable!("inner nodes are binary operations or functions"),
    }
}

impl TaylorDecomposition {
    /// Number of state variables (`m`).
    pub fn n_state(&self) -> usize {
        self.n_state
    }

    /// Total length of the `u`-program (`N`), aliases included.
    pub fn len(&self) -> usize {
        self.u_defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.u_defs.is_empty()
    }

    /// Number of runtime parameters the system reads.
    pub fn n_pars(&self) -> u32 {
        self.n_pars
    }

    pub fn u_defs(&self) -> &[Expression] {
        &self.u_defs
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    /// Indices of the inner (non-state, non-alias) assignments.
    pub(crate) fn inner_range(&self) -> std::ops::Range<usize> {
        self.n_state..self.u_defs.len() - self.n_state
    }

    /// The alias entry identifying `dot x_i`.
    pub(crate) fn alias(&self, i: usize) -> &Expression {
        &self.u_defs[self.u_defs.len() - self.n_state + i]
    }

    pub(crate) fn partner_of(&self, k: u32) -> Option<u32> {
        self.partner.get(&k).copied()
    }

    // Dependency level of each u entry: state variables sit at level zero,
    // an inner node one above its deepest u operand. Nodes of equal level
    // are mutually independent within an order row.
    fn levels(&self) -> Vec<u32> {
        let mut levels = vec![0u32; self.u_defs.len()];
        for k in self.inner_range() {
            let mut level = 1;
            let mut visit = |e: &Expression| {
                if let UArg::U(j) = uarg(e) {
                    level = level.max(levels[j as usize] + 1);
                }
            };
            match self.u_defs[k].node() {
                ExprNode::Binary(_, l, r) => {
                    visit(l);
                    visit(r);
                }
                ExprNode::Func(f) => {
                    for a in f.args() {
                        visit(a);
                    }
                }
                _ => unreachable!("inner nodes are binary operations or functions"),
            }
            levels[k] = level;
        }
        levels
    }

    /// Reorders the inner assignments into contiguous `(level, shape)` runs
    /// so that compact mode can drive each shape with one loop, remapping
    /// every reference and the partner map. State entries and aliases keep
    /// their positions.
    pub(crate) fn sorted_for_compact(&self) -> TaylorDecomposition {
        let levels = self.levels();
        let inner = self.inner_range();

        let order: Vec<usize> = inner
            .clone()
            .sorted_by_key(|&k| (levels[k], shape_of(&self.u_defs[k])))
            .collect();

        // old index -> new index
        let mut remap: Vec<u32> = (0..self.u_defs.len() as u32).collect();
        for (pos, &old) in order.iter().enumerate() {
            remap[old] = (inner.start + pos) as u32;
        }

        let rewrite_leaf = |e: &Expression| -> Expression {
            match uidx(e) {
                Some(k) => uref(remap[k as usize]),
                None => e.clone(),
            }
        };
        let rewrite = |e: &Expression| -> Expression {
            match e.node() {
                ExprNode::Binary(op, l, r) => {
                    Expression::binary(*op, rewrite_leaf(l), rewrite_leaf(r))
                }
                ExprNode::Func(f) => {
                    let mut g = f.clone();
                    for a in g.args_mut() {
                        *a = rewrite_leaf(&a.clone());
                    }
                    Expression::from(g)
                }
                _ => rewrite_leaf(e),
            }
        };

        let mut u_defs = Vec::with_capacity(self.u_defs.len());
        u_defs.extend_from_slice(&self.u_defs[..inner.start]);
        for &old in &order {
            u_defs.push(rewrite(&self.u_defs[old]));
        }
        for alias in &self.u_defs[inner.end..] {
            u_defs.push(rewrite(alias));
        }

        let partner = self
            .partner
            .iter()
            .map(|(&k, &p)| (remap[k as usize], remap[p as usize]))
            .collect();

        TaylorDecomposition {
            u_defs,
            n_state: self.n_state,
            partner,
            n_pars: self.n_pars,
            state_names: self.state_names.clone(),
        }
    }
}

impl std::fmt::Display for TaylorDecomposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (k, def) in self.u_defs.iter().enumerate() {
            writeln!(f, "u_{k} = {def}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{num, par, var};
    use crate::math::{cos, sin, square, tan};
    use std::collections::HashMap as Map;

    fn decompose_pairs(pairs: Vec<(Expression, Expression)>) -> TaylorDecomposition {
        taylor_decompose(&pairs).unwrap()
    }

    // Substitutes u definitions bottom-up until only state names remain.
    fn reconstruct(dc: &TaylorDecomposition, e: &Expression) -> Expression {
        match uidx(e) {
            Some(k) if (k as usize) < dc.n_state() => var(dc.state_names()[k as usize].clone()),
            Some(k) => {
                let def = &dc.u_defs()[k as usize];
                match def.node() {
                    ExprNode::Binary(op, l, r) => {
                        Expression::binary(*op, reconstruct(dc, l), reconstruct(dc, r))
                    }
                    ExprNode::Func(f) => {
                        let mut g = f.clone();
                        for a in g.args_mut() {
                            *a = reconstruct(dc, &a.clone());
                        }
                        Expression::from(g)
                    }
                    _ => def.clone(),
                }
            }
            None => e.clone(),
        }
    }

    #[test]
    fn topological_ordering_holds() {
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (x.clone(), sin(y.clone()) * (x.clone() + y.clone())),
            (y.clone(), x.clone() * y.clone() + square(x.clone())),
        ];
        let dc = decompose_pairs(sys);
        for k in dc.inner_range() {
            let def = &dc.u_defs()[k];
            let check = |e: &Expression| {
                if let Some(j) = uidx(e) {
                    assert!((j as usize) < k, "u_{j} referenced before definition in u_{k}");
                }
            };
            match def.node() {
                ExprNode::Binary(_, l, r) => {
                    check(l);
                    check(r);
                }
                ExprNode::Func(f) => f.args().iter().for_each(check),
                _ => panic!("unexpected inner node"),
            }
        }
    }

    #[test]
    fn reconstruction_matches_the_original_rhs() {
        let x = var("x");
        let y = var("y");
        let rhs0 = sin(y.clone()) * (x.clone() + y.clone()) / (num(1.0) + square(x.clone()));
        let rhs1 = x.clone() * y.clone() + par(0) * square(x.clone());
        let sys = vec![(x.clone(), rhs0.clone()), (y.clone(), rhs1.clone())];
        let dc = decompose_pairs(sys);

        let mut vars = Map::new();
        vars.insert("x".to_string(), 0.7);
        vars.insert("y".to_string(), -0.3);
        let pars = [2.5];

        for (i, rhs) in [rhs0, rhs1].iter().enumerate() {
            let rebuilt = reconstruct(&dc, dc.alias(i));
            let a = rebuilt.eval(&vars, &pars, 0.0).unwrap();
            let b = rhs.eval(&vars, &pars, 0.0).unwrap();
            assert!((a - b).abs() <= 1e-15 * (1.0 + b.abs()), "{a} vs {b}");
        }
    }

    #[test]
    fn cse_shares_nodes_across_equations() {
        let x = var("x");
        let y = var("y");
        // The same product appears in both equations and in a subexpression.
        let shared = x.clone() * y.clone();
        let sys = vec![
            (x.clone(), shared.clone() + num(1.0)),
            (y.clone(), shared.clone() * num(2.0)),
        ];
        let dc = decompose_pairs(sys);
        let occurrences = dc
            .u_defs()
            .iter()
            .filter(|d| {
                matches!(d.node(), ExprNode::Binary(BinaryOp::Mul, l, r)
                    if uidx(l) == Some(0) && uidx(r) == Some(1))
            })
            .count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn constant_rhs_aliases_to_a_literal() {
        let x = var("x");
        let y = var("y");
        // 2*3 folds at construction; the alias is the literal itself.
        let sys = vec![
            (x.clone(), num(2.0) * num(3.0)),
            (y.clone(), x.clone() + y.clone()),
        ];
        let dc = decompose_pairs(sys);
        assert_eq!(dc.alias(0), &num(6.0));
        assert_eq!(uidx(dc.alias(1)), Some(2));
        assert_eq!(dc.len(), 5);
    }

    #[test]
    fn unknown_variable_is_a_cyclic_system() {
        let sys = vec![(var("x"), var("x") + var("w"))];
        let err = taylor_decompose(&sys).unwrap_err();
        assert!(matches!(err, Error::CyclicSystem(_)));
        assert!(err.to_string().contains("'w'"));
    }

    #[test]
    fn duplicate_states_are_rejected() {
        let sys = vec![(var("x"), num(1.0)), (var("x"), num(2.0))];
        assert!(matches!(
            taylor_decompose(&sys).unwrap_err(),
            Error::InvalidArg(_)
        ));
    }

    #[test]
    fn partners_are_registered() {
        let x = var("x");
        let sys = vec![(x.clone(), sin(x.clone()) + tan(x.clone()))];
        let dc = decompose_pairs(sys);

        let find = |name: &str| {
            dc.u_defs()
                .iter()
                .position(|d| matches!(d.node(), ExprNode::Func(f) if f.display_name() == name))
                .unwrap() as u32
        };
        let s = find("sin");
        let c = find("cos");
        let t = find("tan");
        let q = find("square");
        assert_eq!(dc.partner_of(s), Some(c));
        assert_eq!(dc.partner_of(c), Some(s));
        assert_eq!(dc.partner_of(t), Some(q));
        // tan's square partner squares tan itself.
        match dc.u_defs()[q as usize].node() {
            ExprNode::Func(f) => assert_eq!(uidx(&f.args()[0]), Some(t)),
            _ => panic!("square partner missing"),
        }
    }

    #[test]
    fn cos_alone_still_gets_a_sine_partner() {
        let x = var("x");
        let sys = vec![(x.clone(), cos(x.clone()))];
        let dc = decompose_pairs(sys);
        let find = |name: &str| {
            dc.u_defs()
                .iter()
                .position(|d| matches!(d.node(), ExprNode::Func(f) if f.display_name() == name))
                .unwrap() as u32
        };
        assert_eq!(dc.partner_of(find("cos")), Some(find("sin")));
    }

    #[test]
    fn compact_sort_groups_shapes_and_preserves_references() {
        let x = var("x");
        let y = var("y");
        let sys = vec![
            (
                x.clone(),
                sin(x.clone()) + sin(y.clone()) + x.clone() * y.clone(),
            ),
            (y.clone(), y.clone() * x.clone() + cos(x.clone())),
        ];
        let dc = decompose_pairs(sys);
        let sorted = dc.sorted_for_compact();

        // Same multiset of definitions up to renaming: compare reconstructed
        // alias values numerically.
        let mut vars = Map::new();
        vars.insert("x".to_string(), 0.4);
        vars.insert("y".to_string(), 1.3);
        for i in 0..2 {
            let a = reconstruct(&dc, dc.alias(i)).eval(&vars, &[], 0.0).unwrap();
            let b = reconstruct(&sorted, sorted.alias(i))
                .eval(&vars, &[], 0.0)
                .unwrap();
            assert!((a - b).abs() < 1e-15);
        }

        // Shapes form contiguous runs per level.
        let levels = sorted.levels();
        let keys: Vec<_> = sorted
            .inner_range()
            .map(|k| (levels[k], shape_of(&sorted.u_defs()[k])))
            .collect();
        let mut seen = keys.clone();
        seen.dedup();
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(seen.len(), unique.len(), "shape runs are not contiguous");

        // Topological ordering still holds after the sort.
        for k in sorted.inner_range() {
            let def = &sorted.u_defs()[k];
            let check = |e: &Expression| {
                if let Some(j) = uidx(e) {
                    assert!((j as usize) < k);
                }
            };
            match def.node() {
                ExprNode::Binary(_, l, r) => {
                    check(l);
                    check(r);
                }
                ExprNode::Func(f) => f.args().iter().for_each(check),
                _ => {}
            }
        }
    }
}
