//! The registry of named math functions.
//!
//! Each submodule defines one function family: a behavior type implementing
//! [`FuncImpl`](crate::func::FuncImpl) plus a public constructor returning
//! the invocation as an [`Expression`]. The behaviors supply symbolic
//! derivatives, numerical evaluation, per-precision codegen and the Taylor
//! recurrence descriptors the jet code generator interprets.

use std::rc::Rc;

use crate::expr::Expression;
use crate::func::{Func, FuncImpl};

pub mod erf;
pub mod exp;
pub mod hyperbolic;
pub mod inverse_trig;
pub mod log;
pub mod pow;
pub mod sigmoid;
pub mod square;
pub mod sqrt;
pub mod time;
pub mod trigonometric;

pub use erf::erf;
pub use exp::exp;
pub use hyperbolic::{acosh, asinh, atanh, cosh, sinh, tanh};
pub use inverse_trig::{acos, asin, atan};
pub use log::log;
pub use pow::pow;
pub use sigmoid::sigmoid;
pub use square::square;
pub use sqrt::sqrt;
pub use time::time;
pub use trigonometric::{cos, sin, tan};

/// Builds a function invocation with a registry-supplied behavior.
pub(crate) fn invoke(
    name: &'static str,
    args: Vec<Expression>,
    behavior: Rc<dyn FuncImpl>,
) -> Expression {
    // Registry names are static and non-empty, so validation cannot fail.
    Expression::from(Func::new(name, args, behavior).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{num, var};
    use std::collections::HashMap;

    fn eval1(e: &Expression, x: f64) -> f64 {
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), x);
        e.eval(&vars, &[], 0.0).unwrap()
    }

    #[test]
    fn scalar_evaluation() {
        let x = var("x");
        assert_eq!(eval1(&sin(x.clone()), 0.0), 0.0);
        assert_eq!(eval1(&cos(x.clone()), 0.0), 1.0);
        assert_eq!(eval1(&exp(x.clone()), 0.0), 1.0);
        assert_eq!(eval1(&sqrt(x.clone()), 4.0), 2.0);
        assert_eq!(eval1(&square(x.clone()), 3.0), 9.0);
        assert_eq!(eval1(&pow(x.clone(), num(3.0)), 2.0), 8.0);
        assert!((eval1(&sigmoid(x.clone()), 0.0) - 0.5).abs() < 1e-15);
        assert!((eval1(&tanh(x.clone()), 0.5) - 0.5f64.tanh()).abs() < 1e-15);
        assert!((eval1(&erf(x), 0.7) - libm::erf(0.7)).abs() < 1e-15);
    }

    #[test]
    fn time_consumes_the_time_value() {
        let e = time();
        let vars = HashMap::new();
        assert_eq!(e.eval(&vars, &[], 2.5).unwrap(), 2.5);
    }

    #[test]
    fn symbolic_derivatives_match_finite_differences() {
        let x = var("x");
        let fns: Vec<Expression> = vec![
            sin(x.clone()),
            cos(x.clone()),
            tan(x.clone()),
            exp(x.clone()),
            log(x.clone()),
            sqrt(x.clone()),
            square(x.clone()),
            sinh(x.clone()),
            cosh(x.clone()),
            tanh(x.clone()),
            asin(x.clone()),
            acos(x.clone()),
            atan(x.clone()),
            asinh(x.clone()),
            atanh(x.clone()),
            erf(x.clone()),
            sigmoid(x.clone()),
            pow(x.clone(), num(2.5)),
        ];
        let x0 = 0.37;
        let h = 1e-6;
        let mut vars = HashMap::new();
        for f in fns {
            let d = f.diff("x").unwrap();
            vars.insert("x".to_string(), x0 + h);
            let hi = f.eval(&vars, &[], 0.0).unwrap();
            vars.insert("x".to_string(), x0 - h);
            let lo = f.eval(&vars, &[], 0.0).unwrap();
            vars.insert("x".to_string(), x0);
            let sym = d.eval(&vars, &[], 0.0).unwrap();
            let fd = (hi - lo) / (2.0 * h);
            assert!(
                (sym - fd).abs() <= 1e-5 * (1.0 + sym.abs()),
                "{f}: symbolic {sym} vs finite difference {fd}"
            );
        }
        // acosh is only defined for |x| > 1.
        let f = acosh(x);
        let d = f.diff("x").unwrap();
        let x0 = 1.7;
        vars.insert("x".to_string(), x0 + h);
        let hi = f.eval(&vars, &[], 0.0).unwrap();
        vars.insert("x".to_string(), x0 - h);
        let lo = f.eval(&vars, &[], 0.0).unwrap();
        vars.insert("x".to_string(), x0);
        let sym = d.eval(&vars, &[], 0.0).unwrap();
        assert!((sym - (hi - lo) / (2.0 * h)).abs() < 1e-5);
    }

    #[test]
    fn batch_evaluation_maps_the_scalar_path() {
        let e = sin(var("x"));
        let f = match e.node() {
            crate::expr::ExprNode::Func(f) => f.clone(),
            _ => unreachable!(),
        };
        let xs = [0.0, 0.5, 1.0];
        let mut out = [0.0; 3];
        f.eval_batch(&mut out, &[&xs[..]], &[0.0; 3]).unwrap();
        for (o, x) in out.iter().zip(&xs) {
            assert_eq!(*o, x.sin());
        }
    }
}
