//! The natural logarithm.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::Expression;
use crate::func::{FuncImpl, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Log;

impl FuncImpl for Log {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(ln(f)) = df/dx / f
        let da = args[0].diff(wrt).ok()?;
        Some(da / args[0].clone())
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(vals[0].ln())
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("log", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Log)
    }
}

/// Creates a `log(e)` (natural logarithm) invocation.
pub fn log(e: Expression) -> Expression {
    super::invoke("log", vec![e], Rc::new(Log))
}
