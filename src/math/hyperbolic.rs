//! Hyperbolic functions and their inverses.
//!
//! `sinh`/`cosh` mirror the sine/cosine mutual-partner scheme without the
//! sign flip; `tanh` carries its own square; the inverses use the solve-form
//! recurrence against partners `sqrt(1 + square(a))`, `sqrt(square(a) - 1)`
//! and `1 - square(a)`.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{ConvSource, FuncImpl, PartnerSpec, Recurrence};
use crate::jit::{CodegenCtx, Lanes};
use crate::math::sqrt::sqrt;
use crate::math::square::square;

fn asinh_partner(a: Expression) -> Expression {
    sqrt(num(1.0) + square(a))
}

fn acosh_partner(a: Expression) -> Expression {
    sqrt(square(a) - num(1.0))
}

fn atanh_partner(a: Expression) -> Expression {
    num(1.0) - square(a)
}

#[derive(Debug)]
struct Sinh;

impl FuncImpl for Sinh {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        let da = args[0].diff(wrt).ok()?;
        Some(cosh(args[0].clone()) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].sinh())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("sinh", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: 1.0,
            add_arg: false,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Mutual(cosh)
    }
}

#[derive(Debug)]
struct Cosh;

impl FuncImpl for Cosh {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        let da = args[0].diff(wrt).ok()?;
        Some(sinh(args[0].clone()) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].cosh())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("cosh", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: 1.0,
            add_arg: false,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Mutual(sinh)
    }
}

#[derive(Debug)]
struct Tanh;

impl FuncImpl for Tanh {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(tanh(f)) = (1 - tanh(f)^2) * df/dx
        let da = args[0].diff(wrt).ok()?;
        Some((num(1.0) - square(tanh(args[0].clone()))) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].tanh())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("tanh", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: -1.0,
            add_arg: true,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::AfterSelfSquare
    }
}

#[derive(Debug)]
struct Asinh;

impl FuncImpl for Asinh {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        let da = args[0].diff(wrt).ok()?;
        Some(da / asinh_partner(args[0].clone()))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].asinh())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("asinh", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Solve { sigma: 1.0 })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(asinh_partner)
    }
}

#[derive(Debug)]
struct Acosh;

impl FuncImpl for Acosh {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        let da = args[0].diff(wrt).ok()?;
        Some(da / acosh_partner(args[0].clone()))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].acosh())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("acosh", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Solve { sigma: 1.0 })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(acosh_partner)
    }
}

#[derive(Debug)]
struct Atanh;

impl FuncImpl for Atanh {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        let da = args[0].diff(wrt).ok()?;
        Some(da / atanh_partner(args[0].clone()))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].atanh())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("atanh", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Solve { sigma: 1.0 })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(atanh_partner)
    }
}

/// Creates a `sinh(e)` invocation.
pub fn sinh(e: Expression) -> Expression {
    super::invoke("sinh", vec![e], Rc::new(Sinh))
}

/// Creates a `cosh(e)` invocation.
pub fn cosh(e: Expression) -> Expression {
    super::invoke("cosh", vec![e], Rc::new(Cosh))
}

/// Creates a `tanh(e)` invocation.
pub fn tanh(e: Expression) -> Expression {
    super::invoke("tanh", vec![e], Rc::new(Tanh))
}

/// Creates an `asinh(e)` invocation.
pub fn asinh(e: Expression) -> Expression {
    super::invoke("asinh", vec![e], Rc::new(Asinh))
}

/// Creates an `acosh(e)` invocation.
pub fn acosh(e: Expression) -> Expression {
    super::invoke("acosh", vec![e], Rc::new(Acosh))
}

/// Creates an `atanh(e)` invocation.
pub fn atanh(e: Expression) -> Expression {
    super::invoke("atanh", vec![e], Rc::new(Atanh))
}
