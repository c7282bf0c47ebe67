//! Expression trees for representing ODE right-hand sides.
//!
//! [`Expression`] is a cheap-to-clone handle over an immutable, reference-
//! counted node. Nodes are never mutated after construction, so structurally
//! equal expressions can share subtrees freely and the whole algebra forms a
//! DAG by construction. The node kinds are:
//!
//! - numeric literals ([`Number`])
//! - variables (by name)
//! - runtime parameters (by index into a parameter array)
//! - the four binary operators
//! - named function invocations ([`Func`])
//!
//! Binary construction performs constant folding when both operands are
//! numbers and short-circuits the identities `x + 0`, `x * 1`, `x * 0`,
//! `x - x`, `1 * x` and `0 / x`. Division by a zero literal is *not* folded:
//! it stays a symbolic division, per the massless-body policy of the N-body
//! builders.
//!
//! Structural equality and hashing are consistent (`a == b` implies equal
//! hashes), which is what the decomposer's interning table relies on.

use std::collections::HashMap;
use std::rc::Rc;

use crate::errors::Error;
use crate::func::Func;
use crate::number::Number;
use crate::sum::pairwise_reduce;

/// The four elementary binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// One expression node. Obtained from an [`Expression`] via [`Expression::node`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprNode {
    /// A numeric literal.
    Num(Number),
    /// A named variable.
    Var(String),
    /// A runtime parameter, indexed into the parameter array.
    Par(u32),
    /// A binary operation on two subexpressions.
    Binary(BinaryOp, Expression, Expression),
    /// A named function invocation.
    Func(Func),
}

/// A shared, immutable expression.
#[derive(Debug, Clone)]
pub struct Expression {
    node: Rc<ExprNode>,
}

/// Creates a numeric literal expression.
pub fn num(value: f64) -> Expression {
    Expression::from_node(ExprNode::Num(Number::new(value)))
}

/// Creates a variable expression.
pub fn var(name: impl Into<String>) -> Expression {
    Expression::from_node(ExprNode::Var(name.into()))
}

/// Creates a parameter expression referring to `pars[index]` at runtime.
pub fn par(index: u32) -> Expression {
    Expression::from_node(ExprNode::Par(index))
}

impl Expression {
    pub(crate) fn from_node(node: ExprNode) -> Self {
        Expression {
            node: Rc::new(node),
        }
    }

    pub fn node(&self) -> &ExprNode {
        &self.node
    }

    /// True if this is the literal zero.
    pub fn is_zero(&self) -> bool {
        matches!(self.node(), ExprNode::Num(n) if n.is_zero())
    }

    pub(crate) fn as_number(&self) -> Option<Number> {
        match self.node() {
            ExprNode::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Builds a binary operation, folding constants and applying the
    /// construction-time identities.
    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Expression {
        if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
            // Division by a zero literal stays symbolic.
            if !(op == BinaryOp::Div && b.is_zero()) {
                let folded = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                };
                return Expression::from_node(ExprNode::Num(folded));
            }
        }

        match op {
            BinaryOp::Add => {
                if rhs.is_zero() {
                    return lhs;
                }
                if lhs.is_zero() {
                    return rhs;
                }
            }
            BinaryOp::Sub => {
                if lhs == rhs {
                    return num(0.0);
                }
            }
            BinaryOp::Mul => {
                if lhs.is_zero() || rhs.is_zero() {
                    return num(0.0);
                }
                if matches!(rhs.as_number(), Some(n) if n.is_one()) {
                    return lhs;
                }
                if matches!(lhs.as_number(), Some(n) if n.is_one()) {
                    return rhs;
                }
            }
            BinaryOp::Div => {
                if lhs.is_zero() {
                    return num(0.0);
                }
            }
        }

        Expression::from_node(ExprNode::Binary(op, lhs, rhs))
    }

    /// Collects the names of all variables in the expression, sorted and
    /// deduplicated.
    pub fn variables(&self) -> Vec<String> {
        fn walk(e: &Expression, out: &mut Vec<String>) {
            match e.node() {
                ExprNode::Num(_) | ExprNode::Par(_) => {}
                ExprNode::Var(name) => out.push(name.clone()),
                ExprNode::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                ExprNode::Func(f) => {
                    for a in f.args() {
                        walk(a, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out.sort();
        out.dedup();
        out
    }

    /// Replaces every variable whose name appears in `map` with the mapped
    /// expression, rebuilding the tree (construction identities reapply).
    pub fn subs(&self, map: &HashMap<String, Expression>) -> Expression {
        match self.node() {
            ExprNode::Num(_) | ExprNode::Par(_) => self.clone(),
            ExprNode::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            ExprNode::Binary(op, l, r) => Expression::binary(*op, l.subs(map), r.subs(map)),
            ExprNode::Func(f) => {
                let mut g = f.clone();
                for a in g.args_mut() {
                    *a = a.subs(map);
                }
                Expression::from_node(ExprNode::Func(g))
            }
        }
    }

    /// Computes the symbolic derivative with respect to `wrt`.
    ///
    /// Functions delegate to their behavior's derivative capability; a
    /// function without one fails with [`Error::NotImplemented`].
    pub fn diff(&self, wrt: &str) -> Result<Expression, Error> {
        match self.node() {
            ExprNode::Num(_) | ExprNode::Par(_) => Ok(num(0.0)),
            ExprNode::Var(name) => Ok(if name == wrt { num(1.0) } else { num(0.0) }),
            ExprNode::Binary(op, l, r) => {
                let dl = l.diff(wrt)?;
                let dr = r.diff(wrt)?;
                Ok(match op {
                    BinaryOp::Add => dl + dr,
                    BinaryOp::Sub => dl - dr,
                    // d(f*g) = f*dg + g*df
                    BinaryOp::Mul => l.clone() * dr + r.clone() * dl,
                    // d(f/g) = (g*df - f*dg) / g^2
                    BinaryOp::Div => {
                        (r.clone() * dl - l.clone() * dr) / (r.clone() * r.clone())
                    }
                })
            }
            ExprNode::Func(f) => f.diff(wrt),
        }
    }

    /// Evaluates the expression numerically at double precision.
    ///
    /// `vars` supplies variable values, `pars` the parameter array and
    /// `time` the current time (consumed by the `time` function). Unknown
    /// variables and out-of-range parameters fail with
    /// [`Error::InvalidArg`].
    pub fn eval(&self, vars: &HashMap<String, f64>, pars: &[f64], time: f64) -> Result<f64, Error> {
        match self.node() {
            ExprNode::Num(n) => Ok(n.value()),
            ExprNode::Var(name) => vars.get(name).copied().ok_or_else(|| {
                Error::InvalidArg(format!(
                    "Cannot evaluate the expression: the variable '{name}' is missing from the evaluation map"
                ))
            }),
            ExprNode::Par(idx) => pars.get(*idx as usize).copied().ok_or_else(|| {
                Error::InvalidArg(format!(
                    "Cannot evaluate the expression: the parameter index {idx} is out of range for a parameter array of size {}",
                    pars.len()
                ))
            }),
            ExprNode::Binary(op, l, r) => {
                let a = l.eval(vars, pars, time)?;
                let b = r.eval(vars, pars, time)?;
                Ok(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                })
            }
            ExprNode::Func(f) => {
                let mut vals = Vec::with_capacity(f.args().len());
                for a in f.args() {
                    vals.push(a.eval(vars, pars, time)?);
                }
                f.eval_num(&vals, time)
            }
        }
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node) || self.node == other.node
    }
}

impl Eq for Expression {}

impl std::hash::Hash for Expression {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node.hash(state);
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.node() {
            ExprNode::Num(n) => write!(f, "{n}"),
            ExprNode::Var(name) => write!(f, "{name}"),
            ExprNode::Par(idx) => write!(f, "par[{idx}]"),
            ExprNode::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
            ExprNode::Func(func) => {
                write!(f, "{}(", func.display_name())?;
                for (i, a) in func.args().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Func> for Expression {
    fn from(f: Func) -> Self {
        Expression::from_node(ExprNode::Func(f))
    }
}

impl From<f64> for Expression {
    fn from(value: f64) -> Self {
        num(value)
    }
}

macro_rules! impl_binary_operators {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait for Expression {
            type Output = Expression;
            fn $method(self, rhs: Expression) -> Expression {
                Expression::binary($op, self, rhs)
            }
        }

        impl std::ops::$trait<f64> for Expression {
            type Output = Expression;
            fn $method(self, rhs: f64) -> Expression {
                Expression::binary($op, self, num(rhs))
            }
        }

        impl std::ops::$trait<Expression> for f64 {
            type Output = Expression;
            fn $method(self, rhs: Expression) -> Expression {
                Expression::binary($op, num(self), rhs)
            }
        }
    };
}

impl_binary_operators!(Add, add, BinaryOp::Add);
impl_binary_operators!(Sub, sub, BinaryOp::Sub);
impl_binary_operators!(Mul, mul, BinaryOp::Mul);
impl_binary_operators!(Div, div, BinaryOp::Div);

impl std::ops::Neg for Expression {
    type Output = Expression;
    fn neg(self) -> Expression {
        Expression::binary(BinaryOp::Mul, num(-1.0), self)
    }
}

/// Sums `terms` as a balanced binary tree of additions.
///
/// An empty input is an error; a single term is returned unchanged. The tree
/// shape matches the reduction the jet codegen emits for multi-term sums.
pub fn pairwise_sum(terms: Vec<Expression>) -> Result<Expression, Error> {
    if terms.is_empty() {
        return Err(Error::InvalidArg(
            "Cannot compute the pairwise sum of an empty vector of expressions".to_string(),
        ));
    }
    if u32::try_from(terms.len()).is_err() {
        return Err(Error::OverflowInSum(format!(
            "The number of terms in a pairwise sum, {}, exceeds the maximum representable size",
            terms.len()
        )));
    }
    Ok(pairwise_reduce(terms, |a, b| a + b).unwrap())
}
