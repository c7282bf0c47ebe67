//! Inverse trigonometric functions.
//!
//! All three share the solve-form recurrence `p * b' = sigma * a'` where the
//! partner `p` is interned ahead of the node during decomposition:
//! `sqrt(1 - square(a))` for asin/acos and `1 + square(a)` for atan.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{FuncImpl, PartnerSpec, Recurrence};
use crate::jit::{CodegenCtx, Lanes};
use crate::math::sqrt::sqrt;
use crate::math::square::square;

fn asin_partner(a: Expression) -> Expression {
    sqrt(num(1.0) - square(a))
}

fn atan_partner(a: Expression) -> Expression {
    num(1.0) + square(a)
}

#[derive(Debug)]
struct Asin;

impl FuncImpl for Asin {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(asin(f)) = df/dx / sqrt(1 - f^2)
        let da = args[0].diff(wrt).ok()?;
        Some(da / asin_partner(args[0].clone()))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].asin())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("asin", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Solve { sigma: 1.0 })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(asin_partner)
    }
}

#[derive(Debug)]
struct Acos;

impl FuncImpl for Acos {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(acos(f)) = -df/dx / sqrt(1 - f^2)
        let da = args[0].diff(wrt).ok()?;
        Some(-(da / asin_partner(args[0].clone())))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].acos())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("acos", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Solve { sigma: -1.0 })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(asin_partner)
    }
}

#[derive(Debug)]
struct Atan;

impl FuncImpl for Atan {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(atan(f)) = df/dx / (1 + f^2)
        let da = args[0].diff(wrt).ok()?;
        Some(da / atan_partner(args[0].clone()))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].atan())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("atan", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Solve { sigma: 1.0 })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(atan_partner)
    }
}

/// Creates an `asin(e)` invocation.
pub fn asin(e: Expression) -> Expression {
    super::invoke("asin", vec![e], Rc::new(Asin))
}

/// Creates an `acos(e)` invocation.
pub fn acos(e: Expression) -> Expression {
    super::invoke("acos", vec![e], Rc::new(Acos))
}

/// Creates an `atan(e)` invocation.
pub fn atan(e: Expression) -> Expression {
    super::invoke("atan", vec![e], Rc::new(Atan))
}
