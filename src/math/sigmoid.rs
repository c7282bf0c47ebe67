//! The logistic sigmoid.
//!
//! From `sigma' = sigma * (1 - sigma) * a'`, the recurrence convolves
//! against `self - square(self)`; the square partner is interned right
//! after the node. Codegen inlines `1 / (1 + exp(-x))` on top of the `exp`
//! external.

use std::rc::Rc;

use crate::errors::Error;
use crate::expr::{num, Expression};
use crate::func::{ConvSource, FuncImpl, PartnerSpec, Recurrence};
use crate::jit::{CodegenCtx, Lanes};

#[derive(Debug)]
struct Sigmoid;

impl FuncImpl for Sigmoid {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(sigmoid(f)) = sigmoid(f) * (1 - sigmoid(f)) * df/dx
        let da = args[0].diff(wrt).ok()?;
        let s = sigmoid(args[0].clone());
        Some(s.clone() * (num(1.0) - s) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(1.0 / (1.0 + (-vals[0]).exp()))
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        let neg = ctx.fneg(&args[0]);
        let e = match ctx.call_extern("exp", &[neg]) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let one = ctx.splat(1.0);
        let denom = ctx.fadd(&one, &e);
        Some(Ok(ctx.fdiv(&one, &denom)))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::SelfMinusPartner,
            sigma: 1.0,
            add_arg: false,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::AfterSelfSquare
    }
}

/// Creates a `sigmoid(e)` invocation.
pub fn sigmoid(e: Expression) -> Expression {
    super::invoke("sigmoid", vec![e], Rc::new(Sigmoid))
}
