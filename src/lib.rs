//! JIT-compiled Taylor-series integration of symbolic ODE systems.
//!
//! This crate turns a system of ordinary differential equations, written as
//! symbolic expressions, into native machine code using
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift):
//! a "Taylor jet" function that fills the first `O+1` Taylor coefficients of
//! every state variable, and an adaptive stepper that uses those
//! coefficients to pick its own step size.
//!
//! # Features
//!
//! - Symbolic expression algebra with constant folding and shared subtrees
//! - Automatic common-subexpression elimination in the Taylor decomposition
//! - Fully-unrolled or compact (loop-driven) jet kernels, batched over any
//!   number of SIMD lanes
//! - Adaptive step-size control from the radius of convergence of the
//!   Taylor series
//! - Double- and single-precision jets
//!
//! # Example
//!
//! ```rust
//! use taylor_jit::prelude::*;
//!
//! // The harmonic oscillator: x' = v, v' = -x.
//! let x = var("x");
//! let v = var("v");
//! let sys = vec![
//!     (x.clone(), v.clone()),
//!     (v.clone(), num(-1.0) * x.clone()),
//! ];
//!
//! let mut stepper =
//!     AdaptiveStepper::new(&sys, vec![1.0f64, 0.0], StepperOptions::default()).unwrap();
//! stepper.propagate_until(std::f64::consts::PI, 1_000, None).unwrap();
//!
//! // Half a period later the oscillator is mirrored.
//! assert!((stepper.state()[0] + 1.0).abs() < 1e-12);
//! ```

pub use decompose::{taylor_decompose, TaylorDecomposition};
pub use errors::Error;
pub use expr::{num, pairwise_sum, par, var, BinaryOp, ExprNode, Expression};
pub use func::{ConvSource, Func, FuncImpl, PartnerSpec, Recurrence};
pub use jit::{JetDims, JetFn, JitState};
pub use number::Number;
pub use stepper::{AdaptiveStepper, StepOutcome, StepperOptions};
pub use types::{JetFloat, Precision};

pub mod prelude {
    pub use crate::decompose::taylor_decompose;
    pub use crate::expr::{num, pairwise_sum, par, var, Expression};
    pub use crate::jit::JitState;
    pub use crate::math::*;
    pub use crate::nbody::{make_nbody_sys, make_nbody_sys_par};
    pub use crate::stepper::{AdaptiveStepper, StepOutcome, StepperOptions};
    pub use crate::types::Precision;
}

/// Taylor decomposition of an ODE system into a straight-line program
pub mod decompose;
/// Error types for construction, compilation and stepping
pub mod errors;
/// Expression tree representation, folding and symbolic differentiation
pub mod expr;
/// Polymorphic function invocations and their capability set
pub mod func;
/// JIT module lifecycle and the Cranelift emission façade
pub mod jit;
/// The registry of named math functions
pub mod math;
/// Gravitational N-body system builders
pub mod nbody;
/// Numeric literals with value semantics
pub mod number;
/// Adaptive Taylor stepping
pub mod stepper;
/// Pairwise summation shared by expressions and codegen
mod sum;
/// Taylor jet code generation
pub mod taylor;
/// Precision tags and scalar type bindings
pub mod types;
