//! The current integration time as an expression.
//!
//! `time()` takes no arguments; its order-0 coefficient is the time lanes
//! passed to the jet, its order-1 coefficient is one and all higher orders
//! vanish.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{FuncImpl, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Time;

impl FuncImpl for Time {
    fn diff(&self, _args: &[Expression], _wrt: &str) -> Option<Expression> {
        // Differentiation is with respect to a state variable.
        Some(num(0.0))
    }

    fn eval_num(&self, _vals: &[f64], time: f64) -> Option<f64> {
        Some(time)
    }

    fn codegen(&self, ctx: &mut CodegenCtx, _args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(Ok(ctx.time_load()))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Time)
    }
}

/// Creates a `time` invocation referring to the current integration time.
pub fn time() -> Expression {
    super::invoke("time", vec![], Rc::new(Time))
}
