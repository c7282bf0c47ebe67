//! Trigonometric functions: sine, cosine, tangent.
//!
//! Sine and cosine are each other's Taylor partners: decomposing either one
//! interns its sibling on the same argument, and the order-n recurrence of
//! each reads the other's column. Tangent instead carries its own square as
//! a partner, from `tan' = 1 + tan^2`.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{ConvSource, FuncImpl, PartnerSpec, Recurrence};
use crate::jit::{CodegenCtx, Lanes};
use crate::math::square::square;

#[derive(Debug)]
struct Sin;

impl FuncImpl for Sin {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(sin(f)) = cos(f) * df/dx
        let da = args[0].diff(wrt).ok()?;
        Some(cos(args[0].clone()) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].sin())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("sin", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: 1.0,
            add_arg: false,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Mutual(cos)
    }
}

#[derive(Debug)]
struct Cos;

impl FuncImpl for Cos {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(cos(f)) = -sin(f) * df/dx
        let da = args[0].diff(wrt).ok()?;
        Some(-(sin(args[0].clone()) * da))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].cos())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("cos", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: -1.0,
            add_arg: false,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Mutual(sin)
    }
}

#[derive(Debug)]
struct Tan;

impl FuncImpl for Tan {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(tan(f)) = (1 + tan(f)^2) * df/dx
        let da = args[0].diff(wrt).ok()?;
        Some((num(1.0) + square(tan(args[0].clone()))) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].tan())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("tan", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: 1.0,
            add_arg: true,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::AfterSelfSquare
    }
}

/// Creates a `sin(e)` invocation.
pub fn sin(e: Expression) -> Expression {
    super::invoke("sin", vec![e], Rc::new(Sin))
}

/// Creates a `cos(e)` invocation.
pub fn cos(e: Expression) -> Expression {
    super::invoke("cos", vec![e], Rc::new(Cos))
}

/// Creates a `tan(e)` invocation.
pub fn tan(e: Expression) -> Expression {
    super::invoke("tan", vec![e], Rc::new(Tan))
}
