//! Type definitions shared across the JIT pipeline.
//!
//! [`Precision`] tags the floating-point width a jet is compiled for;
//! [`JetFloat`] ties a Rust scalar type to its precision tag so that the
//! stepper and the fetch API can be generic over the width while each
//! compiled jet stays monomorphic.

use cranelift_codegen::ir::{types, Type};
use num_traits::Float;

/// Floating-point precision a jet function is specialized for.
///
/// Each precision produces a distinct jet symbol; mixing precisions across
/// calls is forbidden and rejected at fetch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// IEEE-754 binary64 (`f64`).
    Double,
    /// IEEE-754 binary32 (`f32`).
    Single,
}

impl Precision {
    /// The Cranelift IR type for scalars of this precision.
    pub(crate) fn fp_type(self) -> Type {
        match self {
            Precision::Double => types::F64,
            Precision::Single => types::F32,
        }
    }

    /// Size of one scalar in bytes.
    pub(crate) fn size(self) -> u32 {
        match self {
            Precision::Double => 8,
            Precision::Single => 4,
        }
    }

    /// The libm symbol for `name` at this precision (`sin` / `sinf`).
    pub(crate) fn libm_symbol(self, name: &str) -> String {
        match self {
            Precision::Double => name.to_string(),
            Precision::Single => format!("{name}f"),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Double => write!(f, "double"),
            Precision::Single => write!(f, "single"),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for f32 {}
}

/// Scalar types a jet can be compiled for.
///
/// Sealed: the admissible widths are fixed by the backend.
pub trait JetFloat: Float + Copy + Default + std::fmt::Debug + 'static + sealed::Sealed {
    const PRECISION: Precision;
}

impl JetFloat for f64 {
    const PRECISION: Precision = Precision::Double;
}

impl JetFloat for f32 {
    const PRECISION: Precision = Precision::Single;
}

/// Raw ABI of a compiled jet: `jet_<name>(tape, pars, time)`.
///
/// `tape` points to `(order + 1) * n_u * batch` scalars laid out row-major
/// over (order, u-index, lane); `pars` and `time` are read-only.
pub(crate) type RawJetFn<F> = unsafe extern "C" fn(*mut F, *const F, *const F);
