//! The square root.
//!
//! Codegen uses the backend's native `sqrt` instruction (the platform
//! intrinsic at every precision) rather than a libm call.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{FuncImpl, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Sqrt;

impl FuncImpl for Sqrt {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(sqrt(f)) = df/dx / (2*sqrt(f))
        let da = args[0].diff(wrt).ok()?;
        Some(da / (num(2.0) * sqrt(args[0].clone())))
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].sqrt())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(Ok(ctx.fsqrt(&args[0])))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Sqrt)
    }
}

/// Creates a `sqrt(e)` invocation.
pub fn sqrt(e: Expression) -> Expression {
    super::invoke("sqrt", vec![e], Rc::new(Sqrt))
}
