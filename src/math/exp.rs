//! The exponential function.
//!
//! `exp` is the simplest of the transcendental recurrences: the order-n
//! coefficient is a weighted convolution of the argument's coefficients
//! with the node's own lower-order coefficients, so no partner node is
//! needed.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::Expression;
use crate::func::{ConvSource, FuncImpl, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Exp;

impl FuncImpl for Exp {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(e^f) = e^f * df/dx
        let da = args[0].diff(wrt).ok()?;
        Some(exp(args[0].clone()) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].exp())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("exp", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::SelfCoeffs,
            sigma: 1.0,
            add_arg: false,
        })
    }
}

/// Creates an `exp(e)` invocation.
pub fn exp(e: Expression) -> Expression {
    super::invoke("exp", vec![e], Rc::new(Exp))
}
