//! Error types for the taylor-jit crate.
//!
//! A single error enum covers the three strata of failures:
//!
//! - Construction-time: invalid arguments to symbolic builders (`InvalidArg`)
//! - Compile-time: decomposition and codegen failures (`CyclicSystem`,
//!   `NotImplemented`, `BackendFailure`)
//! - Run-time: the adaptive stepper detecting non-finite results
//!   (`NumericalFailure`)
//!
//! Messages include the display name of the offending function where one is
//! involved. The crate itself never logs; surfacing is the caller's
//! responsibility.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use thiserror::Error;

/// Errors surfaced by expression construction, Taylor decomposition, JIT
/// compilation and adaptive stepping.
#[derive(Error, Debug)]
pub enum Error {
    /// A symbolic builder or capability entry point was called with invalid
    /// arguments (empty display name, wrong arity, zero batch size, ...).
    #[error("{0}")]
    InvalidArg(String),
    /// A function capability needed by the pipeline is not provided by the
    /// function's behavior. The message carries the function's display name.
    #[error("{0}")]
    NotImplemented(String),
    /// An RHS references a variable that cannot be resolved to a state
    /// variable of the system.
    #[error("{0}")]
    CyclicSystem(String),
    /// A pairwise sum would exceed the index width of the decomposition.
    #[error("{0}")]
    OverflowInSum(String),
    /// The adaptive stepper produced a non-finite value or an unusable
    /// radius-of-convergence estimate; the step was not committed.
    #[error("{0}")]
    NumericalFailure(String),
    /// The JIT backend refused a construct.
    #[error("backend failure: {0}")]
    BackendFailure(String),
}

impl From<ModuleError> for Error {
    fn from(e: ModuleError) -> Self {
        Error::BackendFailure(e.to_string())
    }
}

impl From<CodegenError> for Error {
    fn from(e: CodegenError) -> Self {
        Error::BackendFailure(e.to_string())
    }
}

impl Error {
    /// Shorthand used by the capability dispatchers in [`crate::func`].
    pub(crate) fn not_implemented(what: &str, name: &str) -> Self {
        Error::NotImplemented(format!(
            "{} is not implemented for the function '{}'",
            what, name
        ))
    }
}
