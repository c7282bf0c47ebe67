//! Exponentiation.
//!
//! The Taylor recurrence requires a constant exponent; `pow` with a
//! non-numeric exponent can still be built, evaluated and compiled, but
//! asking for its Taylor recurrence fails with `NotImplemented`.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{FuncImpl, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Pow;

impl FuncImpl for Pow {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(f^c) = c * f^(c-1) * df/dx, constant exponents only.
        let alpha = args[1].as_number()?;
        let da = args[0].diff(wrt).ok()?;
        Some(num(alpha.value()) * pow(args[0].clone(), num(alpha.value() - 1.0)) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].powf(vals[1]))
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("pow", args))
    }

    fn taylor_recurrence(&self, args: &[Expression]) -> Option<Recurrence> {
        let alpha = args[1].as_number()?;
        Some(Recurrence::Pow {
            alpha: alpha.value(),
        })
    }
}

/// Creates a `pow(base, exponent)` invocation.
pub fn pow(base: Expression, exponent: Expression) -> Expression {
    super::invoke("pow", vec![base, exponent], Rc::new(Pow))
}
