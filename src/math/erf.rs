//! The error function.
//!
//! The partner is `exp(-square(a))`, interned ahead of the node; the
//! recurrence is the forward convolution scaled by `2/sqrt(pi)`. The libm
//! crate provides the external (`erf` is not in `std`).

use std::f64::consts::FRAC_2_SQRT_PI;
use std::rc::Rc;

use crate::errors::Error;
use crate::expr::Expression;
use crate::func::{ConvSource, FuncImpl, PartnerSpec, Recurrence};
use crate::jit::{CodegenCtx, Lanes};
use crate::math::exp::exp;
use crate::math::square::square;

fn erf_partner(a: Expression) -> Expression {
    exp(-square(a))
}

#[derive(Debug)]
struct Erf;

impl FuncImpl for Erf {
    fn diff(&self, args: &[Expression], wrt: &str) -> Option<Expression> {
        // d/dx(erf(f)) = 2/sqrt(pi) * exp(-f^2) * df/dx
        let da = args[0].diff(wrt).ok()?;
        Some(crate::expr::num(FRAC_2_SQRT_PI) * erf_partner(args[0].clone()) * da)
    }

    fn eval_num(&self, vals: &[f64], _time: f64) -> Option<f64> {
        Some(libm::erf(vals[0]))
    }

    fn codegen(&self, ctx: &mut CodegenCtx, args: &[Lanes]) -> Option<Result<Lanes, Error>> {
        Some(ctx.call_extern("erf", args))
    }

    fn taylor_recurrence(&self, _args: &[Expression]) -> Option<Recurrence> {
        Some(Recurrence::Forward {
            source: ConvSource::Partner,
            sigma: FRAC_2_SQRT_PI,
            add_arg: false,
        })
    }

    fn taylor_partner(&self) -> PartnerSpec {
        PartnerSpec::Before(erf_partner)
    }
}

/// Creates an `erf(e)` invocation.
pub fn erf(e: Expression) -> Expression {
    super::invoke("erf", vec![e], Rc::new(Erf))
}
