//! Squaring, as a dedicated node.
//!
//! `square(e)` is cheaper than `e * e` through the Taylor recurrences: the
//! self-convolution only needs half the products, doubling the symmetric
//! terms. The N-body builders use it for the interbody distances.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{FuncImpl, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Square;

impl FuncImpl for Square {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(f^2) = 2*f*df/dx
        let da = args[0].diff(wrt).ok()?;
        Some(num(2.0) * args[0].clone() * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0] * vals[0])
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(Ok(ctx.fmul(&args[0], &args[0])))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Square)
    }
}

/// Creates a `square(e)` invocation.
pub fn square(e: Expression) -> Expression {
    super::invoke("square", vec![e], Rc::new(Square))
}
