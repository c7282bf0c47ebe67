//! Polymorphic function invocations.
//!
//! A [`Func`] couples a display name and argument expressions with a shared
//! behavior object ([`FuncImpl`]) describing how the function is
//! differentiated, evaluated, compiled and propagated through the Taylor
//! recurrences. The behavior surface is a capability set: every capability
//! may be absent, and invoking an absent capability fails with
//! [`Error::NotImplemented`] carrying the function's display name.
//!
//! Argument-count and order/batch validation happen here, at the edge,
//! before dispatching to the behavior.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::Expression;
use crate::jit::{CodegenCtx, Lanes};
use crate::types::Precision;

/// How the order-n coefficient of a function node is computed from lower
/// orders. Interpreted by the jet codegen in both unrolled and compact mode.
///
/// Throughout, `a` are the argument's coefficients, `b` the node's own and
/// `p` the partner column registered during decomposition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recurrence {
    /// `b_n = [a_n +] sigma/n * sum_{j=1..n} j*a_j*P_{n-j}` where `P` is
    /// selected by `source`. Covers exp, sin/cos, sinh/cosh, tan/tanh,
    /// erf and sigmoid.
    Forward {
        source: ConvSource,
        sigma: f64,
        add_arg: bool,
    },
    /// `b_n = (sigma*n*a_n - sum_{j=1..n-1} (n-j)*p_j*b_{n-j}) / (n*p_0)`.
    /// Covers the inverse trigonometric and hyperbolic functions.
    Solve { sigma: f64 },
    /// `b_n = (a_n - 1/n * sum_{j=1..n-1} j*b_j*a_{n-j}) / a_0`.
    Log,
    /// `b_n = (a_n - sum_{j=1..n-1} b_j*b_{n-j}) / (2*b_0)`.
    Sqrt,
    /// `b_n = (sum_{j=1..n} (alpha*j - (n-j))*a_j*b_{n-j}) / (n*a_0)`.
    Pow { alpha: f64 },
    /// Parity-split self-convolution of the argument.
    Square,
    /// `b_1 = 1`, `b_n = 0` for `n >= 2`.
    Time,
}

/// The column the `Forward` convolution multiplies against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvSource {
    /// The node's own coefficients (exp).
    SelfCoeffs,
    /// The partner column (sin reads cos, tan reads its square, ...).
    Partner,
    /// `self - partner` (sigmoid reads `b - b^2`).
    SelfMinusPartner,
}

/// Partner nodes a function requires next to itself in the decomposition.
#[derive(Clone, Copy)]
pub enum PartnerSpec {
    /// No partner.
    None,
    /// A sibling invocation on the same argument; each node is the other's
    /// partner (sin/cos, sinh/cosh). The constructor builds the sibling
    /// from the decomposed argument.
    Mutual(fn(Expression) -> Expression),
    /// An expression of the decomposed argument, interned before self
    /// (asin's `sqrt(1 - square(a))`, erf's `exp(-square(a))`, ...).
    Before(fn(Expression) -> Expression),
    /// `square(self)`, interned after self (tan, tanh, sigmoid).
    AfterSelfSquare,
}

/// Behavior of a named function: a narrow, stable capability set.
///
/// Every method has a "not provided" default; concrete functions override
/// what they support. Capabilities are dispatched through [`Func`], which
/// validates inputs and turns absent capabilities into
/// [`Error::NotImplemented`].
pub trait FuncImpl {
    /// Symbolic derivative of the invocation with respect to `wrt`.
    fn diff(&self, _args: &[Expression], _wrt: &str) -> Option<Expression> {
        None
    }

    /// Scalar numerical evaluation at double precision.
    fn eval_num(&self, _vals: &[f64], _time: f64) -> Option<f64> {
        None
    }

    /// Batch numerical evaluation at double precision. `vals` holds one
    /// slice per argument; the default maps the scalar evaluator.
    fn eval_batch(&self, out: &mut [f64], vals: &[&[f64]], time: &[f64]) -> Option<()> {
        let mut buf = vec![0.0; vals.len()];
        for i in 0..out.len() {
            for (slot, col) in buf.iter_mut().zip(vals) {
                *slot = col[i];
            }
            out[i] = self.eval_num(&buf, time[i])?;
        }
        Some(())
    }

    /// Emits IR computing the function from argument lanes at the context's
    /// precision.
    fn codegen(&self, _ctx: &mut CodegenCtx, _args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        None
    }

    /// Order-0 kernel. Defaults to plain codegen on order-0 argument values.
    fn taylor_init(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        self.codegen(ctx, args)
    }

    /// The order-n Taylor recurrence, if the function supports one for the
    /// given arguments.
    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        None
    }

    /// Partner nodes the decomposer must intern alongside this function.
    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::None
    }
}

/// A named function invocation with shared behavior.
#[derive(Clone)]
pub struct Func {
    name: String,
    args: Vec<Expression>,
    behavior: Rc<dyn FuncImpl>,
}

impl Func {
    /// Creates a function invocation.
    ///
    /// Fails with [`Error::InvalidArg`] if the display name is empty.
    pub fn new(
        name: impl Into<String>,
        args: Vec<Expression>,
        behavior: Rc<dyn FuncImpl>,
    ) -> Result<Func, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArg(
                "Cannot create a function with no display name".to_string(),
            ));
        }
        Ok(Func {
            name,
            args,
            behavior,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Expression] {
        &self.args
    }

    /// Mutable access to the arguments.
    ///
    /// Only sound on a freshly-built value that has not been published as an
    /// [`Expression`] yet; the decomposer uses this to rewrite arguments
    /// into `u`-references before interning.
    pub(crate) fn args_mut(&mut self) -> &mut [Expression] {
        &mut self.args
    }

    fn check_arity(&self, provided: usize, what: &str) -> Result<(), Error> {
        if provided != self.args.len() {
            return Err(Error::InvalidArg(format!(
                "Inconsistent number of arguments supplied to {} of the function '{}': {} arguments were expected, but {} arguments were provided instead",
                what,
                self.name,
                self.args.len(),
                provided
            )));
        }
        Ok(())
    }

    /// Symbolic derivative with respect to `wrt`.
    pub fn diff(&self, wrt: &str) -> Result<Expression, Error> {
        self.behavior
            .diff(&self.args, wrt)
            .ok_or_else(|| Error::not_implemented("the derivative", &self.name))
    }

    /// Scalar numerical evaluation from positional argument values.
    pub fn eval_num(&self, vals: &[f64], time: f64) -> Result<f64, Error> {
        self.check_arity(vals.len(), "the numerical evaluation")?;
        self.behavior
            .eval_num(vals, time)
            .ok_or_else(|| Error::not_implemented("double numerical eval", &self.name))
    }

    /// Batch numerical evaluation. Each entry of `vals` is one argument's
    /// values across the batch; all slices must have `out`'s length.
    pub fn eval_batch(&self, out: &mut [f64], vals: &[&[f64]], time: &[f64]) -> Result<(), Error> {
        self.check_arity(vals.len(), "the batch evaluation")?;
        if vals.iter().any(|v| v.len() != out.len()) || time.len() != out.len() {
            return Err(Error::InvalidArg(format!(
                "Inconsistent batch sizes supplied to the batch evaluation of the function '{}'",
                self.name
            )));
        }
        self.behavior
            .eval_batch(out, vals, time)
            .ok_or_else(|| Error::not_implemented("double batch eval", &self.name))
    }

    /// Emits IR computing the function from argument lanes.
    pub(crate) fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Result<Lanes, Error> {
        self.check_arity(args.len(), "the codegen")?;
        let prec = ctx.prec();
        self.behavior
            .codegen(ctx, args)
            .ok_or_else(|| Error::not_implemented(&format!("{prec} codegen"), &self.name))?
    }

    /// Emits IR for the order-0 Taylor coefficient.
    pub(crate) fn taylor_init(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Result<Lanes, Error> {
        self.check_arity(args.len(), "the Taylor initialization")?;
        let prec = ctx.prec();
        self.behavior
            .taylor_init(ctx, args)
            .ok_or_else(|| Error::not_implemented(&format!("{prec} Taylor u init"), &self.name))?
    }

    /// The order-n Taylor recurrence, validated for the requested order,
    /// batch size and precision.
    ///
    /// `compact` selects the wording of the capability-missing error; the
    /// recurrence itself drives both emission flavors.
    pub fn taylor_recurrence(
        &self,
        order: u32,
        batch: u32,
        prec: Precision,
        compact: bool,
    ) -> Result<Recurrence, Error> {
        if batch == 0 {
            return Err(Error::InvalidArg(format!(
                "Zero batch size detected in the Taylor derivative of the function '{}'",
                self.name
            )));
        }
        if order == 0 {
            return Err(Error::InvalidArg(format!(
                "Cannot compute a derivative of order zero for the function '{}'",
                self.name
            )));
        }
        self.behavior.taylor_recurrence(&self.args).ok_or_else(|| {
            let what = if compact {
                format!("{prec} Taylor diff in compact mode")
            } else {
                format!("{prec} Taylor diff")
            };
            Error::not_implemented(&what, &self.name)
        })
    }

    /// Partner nodes to intern alongside this function.
    pub(crate) fn taylor_partner(&self) -> PartnerSpec {
        self.behavior.taylor_partner()
    }
}

impl std::fmt::Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Func")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.args == other.args
    }
}

impl Eq for Func {}

impl std::hash::Hash for Func {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.args.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::var;

    // A behavior providing no capabilities at all.
    struct Bare;
    impl FuncImpl for Bare {}

    fn bare(name: &str) -> Result<Func, Error> {
        Func::new(name, vec![var("x"), var("y")], Rc::new(Bare))
    }

    #[test]
    fn empty_display_name_is_rejected() {
        let err = bare("").unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert_eq!(
            err.to_string(),
            "Cannot create a function with no display name"
        );
    }

    #[test]
    fn wrong_arity_is_invalid_arg() {
        let f = bare("f").unwrap();
        let err = f.eval_num(&[1.0], 0.0).unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert!(err.to_string().contains("2 arguments were expected"));
        assert!(err.to_string().contains("1 arguments were provided"));
    }

    #[test]
    fn missing_capabilities_carry_the_display_name() {
        let f = bare("f").unwrap();

        let err = f.diff("x").unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
        assert_eq!(
            err.to_string(),
            "the derivative is not implemented for the function 'f'"
        );

        let err = f.eval_num(&[1.0, 2.0], 0.0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "double numerical eval is not implemented for the function 'f'"
        );

        let err = f
            .taylor_recurrence(2, 1, Precision::Double, false)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "double Taylor diff is not implemented for the function 'f'"
        );

        let err = f
            .taylor_recurrence(2, 1, Precision::Double, true)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "double Taylor diff in compact mode is not implemented for the function 'f'"
        );
    }

    #[test]
    fn taylor_diff_validates_order_and_batch() {
        let f = bare("f").unwrap();

        let err = f
            .taylor_recurrence(2, 0, Precision::Double, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert!(err.to_string().contains("Zero batch size"));

        let err = f
            .taylor_recurrence(0, 2, Precision::Double, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert!(err.to_string().contains("order zero"));
    }

    #[test]
    fn structural_identity_ignores_behavior() {
        let a = bare("f").unwrap();
        let b = Func::new("f", vec![var("x"), var("y")], Rc::new(Bare)).unwrap();
        assert_eq!(a, b);
    }
}
