//! Adaptive Taylor stepping.
//!
//! [`AdaptiveStepper`] owns a compiled jet for its system (batch width one),
//! the current state, parameters and time, plus a scratch tape. Each step
//! runs the jet, infers a step size from the radius of convergence of the
//! Taylor series and rolls the polynomial forward with Horner's scheme.
//!
//! A stepper is not thread-safe; independent steppers own independent
//! modules and may run in parallel.

use crate::errors::Error;
use crate::expr::Expression;
use crate::jit::{JetDims, JitState};
use crate::types::{JetFloat, RawJetFn};

/// How a step (or a propagation) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A full step of the inferred size was taken.
    Success,
    /// The step was clipped to land on the requested time bound.
    TimeLimit,
    /// The step budget ran out before the time bound was reached.
    StepLimit,
    /// The between-steps callback asked to stop.
    Interrupted,
}

/// Options recognized by the stepper constructor.
#[derive(Debug, Clone)]
pub struct StepperOptions<F> {
    /// Truncation tolerance; defaults to the rounding unit of `F`.
    pub tol: Option<F>,
    /// Emit the jet with loop-driven per-shape helpers instead of fully
    /// unrolled kernels.
    pub compact_mode: bool,
    /// Use compensated accumulation when rolling the polynomial forward.
    pub high_accuracy: bool,
    /// Initial parameter array.
    pub pars: Vec<F>,
    /// Initial time.
    pub time: F,
}

impl<F: JetFloat> Default for StepperOptions<F> {
    fn default() -> Self {
        StepperOptions {
            tol: None,
            compact_mode: false,
            high_accuracy: false,
            pars: Vec::new(),
            time: F::zero(),
        }
    }
}

/// An adaptive integrator for one trajectory of an ODE system.
pub struct AdaptiveStepper<F: JetFloat> {
    // The module must stay alive for as long as the raw pointer below.
    _jit: JitState,
    raw: RawJetFn<F>,
    dims: JetDims,
    state: Vec<F>,
    pars: Vec<F>,
    time: F,
    tol: F,
    high_accuracy: bool,
    tape: Vec<F>,
}

impl<F: JetFloat> std::fmt::Debug for AdaptiveStepper<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveStepper")
            .field("dims", &self.dims)
            .field("state", &self.state)
            .field("pars", &self.pars)
            .field("time", &self.time)
            .field("tol", &self.tol)
            .field("high_accuracy", &self.high_accuracy)
            .finish()
    }
}

// Taylor order from the tolerance: ceil(-ln(tol)/2), at least two.
fn order_from_tol(tol: f64) -> u32 {
    let order = (-tol.ln() / 2.0).ceil();
    (order as u32).max(2)
}

impl<F: JetFloat> AdaptiveStepper<F> {
    /// Compiles a jet for `sys` and wraps it in an adaptive stepper
    /// starting from `initial_state`.
    pub fn new(
        sys: &[(Expression, Expression)],
        initial_state: Vec<F>,
        opts: StepperOptions<F>,
    ) -> Result<Self, Error> {
        if initial_state.len() != sys.len() {
            return Err(Error::InvalidArg(format!(
                "Inconsistent sizes detected in the initialization of an adaptive stepper: the state vector has a size of {}, while the number of equations is {}",
                initial_state.len(),
                sys.len()
            )));
        }
        let tol = opts.tol.unwrap_or_else(F::epsilon);
        let tol_f = tol.to_f64().unwrap_or(f64::NAN);
        if !(tol_f.is_finite() && tol_f > 0.0) {
            return Err(Error::InvalidArg(format!(
                "The tolerance in an adaptive stepper must be finite and positive, but it is {tol_f} instead"
            )));
        }

        let order = order_from_tol(tol_f);
        let mut jit = JitState::new()?;
        let dims = jit.add_taylor_jet::<F>("stepper", sys, order, 1, opts.compact_mode)?;

        if (opts.pars.len() as u32) < dims.n_pars {
            return Err(Error::InvalidArg(format!(
                "Inconsistent sizes detected in the initialization of an adaptive stepper: the parameter array has a size of {}, while the system references {} parameters",
                opts.pars.len(),
                dims.n_pars
            )));
        }

        jit.compile()?;
        let (raw, dims) = jit.fetch_raw::<F>("stepper")?;

        Ok(AdaptiveStepper {
            _jit: jit,
            raw,
            dims,
            state: initial_state,
            pars: opts.pars,
            time: opts.time,
            tol,
            high_accuracy: opts.high_accuracy,
            tape: vec![F::zero(); dims.tape_len()],
        })
    }

    pub fn state(&self) -> &[F] {
        &self.state
    }

    pub fn time(&self) -> F {
        self.time
    }

    pub fn tol(&self) -> F {
        self.tol
    }

    /// The Taylor order the jet was compiled with.
    pub fn order(&self) -> u32 {
        self.dims.order
    }

    pub fn pars(&self) -> &[F] {
        &self.pars
    }

    pub fn pars_mut(&mut self) -> &mut [F] {
        &mut self.pars
    }

    // Infinity norm over the state columns of one tape row.
    fn row_norm(&self, row: u32) -> F {
        let n_u = self.dims.n_u as usize;
        let m = self.dims.n_state as usize;
        let base = row as usize * n_u;
        let mut norm = F::zero();
        for i in 0..m {
            norm = norm.max(self.tape[base + i].abs());
        }
        norm
    }

    fn coeff(&self, order: u32, i: usize) -> F {
        self.tape[order as usize * self.dims.n_u as usize + i]
    }

    /// Takes one adaptive step of at most `|max_delta|`, in the direction
    /// of `max_delta`'s sign.
    ///
    /// On success returns the outcome and the step actually taken; on
    /// [`Error::NumericalFailure`] the state and time are left untouched.
    pub fn step(&mut self, max_delta: F) -> Result<(StepOutcome, F), Error> {
        let m = self.dims.n_state as usize;
        let order = self.dims.order;

        // Order-0 row: current state; the rest of the tape is scratch.
        for v in self.tape.iter_mut() {
            *v = F::zero();
        }
        self.tape[..m].copy_from_slice(&self.state);
        // SAFETY: the tape, parameter and time buffers match the sizes the
        // jet was compiled for (batch width one).
        unsafe { (self.raw)(self.tape.as_mut_ptr(), self.pars.as_ptr(), &self.time) };

        // Radius-of-convergence estimate from the last two coefficient
        // norms.
        let n_hi = self.row_norm(order);
        let n_lo = self.row_norm(order - 1);
        if !(n_hi.is_finite() && n_lo.is_finite()) {
            return Err(Error::NumericalFailure(
                "Non-finite Taylor coefficients detected in an adaptive step".to_string(),
            ));
        }
        let inv = |norm: F, o: u32| norm.powf(-F::one() / F::from(o).unwrap());
        let rho = inv(n_hi, order).min(inv(n_lo, order - 1));
        if rho.is_nan() || rho <= F::zero() {
            return Err(Error::NumericalFailure(format!(
                "The estimated radius of convergence in an adaptive step is not positive: {:?}",
                rho.to_f64()
            )));
        }

        // Truncation-error bound on the step size.
        let two = F::one() + F::one();
        let denom = F::from(2 * order - 1).unwrap();
        let mut h_abs = if rho.is_infinite() {
            max_delta.abs()
        } else {
            rho * (-((F::one() / self.tol).ln() + two) / denom).exp()
        };

        let mut outcome = StepOutcome::Success;
        if h_abs >= max_delta.abs() {
            h_abs = max_delta.abs();
            outcome = StepOutcome::TimeLimit;
        }
        let h = if max_delta < F::zero() { -h_abs } else { h_abs };

        // Horner evaluation of the Taylor polynomial at h.
        let mut new_state = Vec::with_capacity(m);
        for i in 0..m {
            let mut acc = self.coeff(order, i);
            if self.high_accuracy {
                let mut comp = F::zero();
                for n in (0..order).rev() {
                    acc = acc * h;
                    let y = self.coeff(n, i) - comp;
                    let t = acc + y;
                    comp = (t - acc) - y;
                    acc = t;
                }
            } else {
                for n in (0..order).rev() {
                    acc = acc * h + self.coeff(n, i);
                }
            }
            new_state.push(acc);
        }

        if new_state.iter().any(|v| !v.is_finite()) || !h.is_finite() {
            return Err(Error::NumericalFailure(
                "Non-finite state detected at the end of an adaptive step".to_string(),
            ));
        }

        self.state.copy_from_slice(&new_state);
        self.time = self.time + h;
        Ok((outcome, h))
    }

    /// Takes one unclipped step in the positive time direction.
    pub fn step_forward(&mut self) -> Result<(StepOutcome, F), Error> {
        self.step(F::infinity())
    }

    /// Takes one unclipped step in the negative time direction.
    pub fn step_backward(&mut self) -> Result<(StepOutcome, F), Error> {
        self.step(F::neg_infinity())
    }

    /// Steps until `t` is reached, the step budget is exhausted, or the
    /// callback (checked between steps, never within one) returns `false`.
    pub fn propagate_until(
        &mut self,
        t: F,
        max_steps: usize,
        mut callback: Option<&mut dyn FnMut(&AdaptiveStepper<F>) -> bool>,
    ) -> Result<StepOutcome, Error> {
        if !t.is_finite() {
            return Err(Error::InvalidArg(
                "A non-finite time was passed to propagate_until".to_string(),
            ));
        }
        let mut steps = 0usize;
        loop {
            let delta = t - self.time;
            if delta == F::zero() {
                return Ok(StepOutcome::TimeLimit);
            }
            let (outcome, _) = self.step(delta)?;
            if let Some(cb) = callback.as_mut() {
                if !cb(self) {
                    return Ok(StepOutcome::Interrupted);
                }
            }
            if outcome == StepOutcome::TimeLimit {
                // The clipped step landed on the bound up to rounding.
                self.time = t;
                return Ok(StepOutcome::TimeLimit);
            }
            steps += 1;
            if steps >= max_steps {
                return Ok(StepOutcome::StepLimit);
            }
        }
    }

    /// Steps for a time span of `delta` from the current time.
    pub fn propagate_for(
        &mut self,
        delta: F,
        max_steps: usize,
        callback: Option<&mut dyn FnMut(&AdaptiveStepper<F>) -> bool>,
    ) -> Result<StepOutcome, Error> {
        self.propagate_until(self.time + delta, max_steps, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{num, var};
    use crate::math::{log, square};

    fn decay_stepper(compact: bool) -> AdaptiveStepper<f64> {
        // x' = -x, x(0) = 1.
        let x = var("x");
        let sys = vec![(x.clone(), num(-1.0) * x.clone())];
        AdaptiveStepper::new(
            &sys,
            vec![1.0],
            StepperOptions {
                compact_mode: compact,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn exponential_decay_matches_the_closed_form() {
        for compact in [false, true] {
            let mut stepper = decay_stepper(compact);
            let outcome = stepper.propagate_until(1.0, 10_000, None).unwrap();
            assert_eq!(outcome, StepOutcome::TimeLimit);
            assert_eq!(stepper.time(), 1.0);
            let exact = (-1.0f64).exp();
            assert!(
                (stepper.state()[0] - exact).abs() < 1e-14,
                "compact={compact}: {} vs {exact}",
                stepper.state()[0]
            );
        }
    }

    #[test]
    fn clipped_step_reports_the_time_limit() {
        let mut stepper = decay_stepper(false);
        let (outcome, h) = stepper.step(1e-3).unwrap();
        assert_eq!(outcome, StepOutcome::TimeLimit);
        assert_eq!(h, 1e-3);
        assert!((stepper.state()[0] - (-1e-3f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn backward_integration() {
        let mut stepper = decay_stepper(false);
        stepper.propagate_until(-0.5, 10_000, None).unwrap();
        assert!((stepper.state()[0] - 0.5f64.exp()).abs() < 1e-13);
    }

    #[test]
    fn oscillator_phase_after_one_period() {
        // x' = v, v' = -x; period 2*pi.
        let x = var("x");
        let v = var("v");
        let sys = vec![
            (x.clone(), v.clone()),
            (v.clone(), num(-1.0) * x.clone()),
        ];
        let mut stepper = AdaptiveStepper::new(
            &sys,
            vec![1.0f64, 0.0],
            StepperOptions {
                tol: Some(1e-14),
                ..Default::default()
            },
        )
        .unwrap();
        stepper
            .propagate_until(2.0 * std::f64::consts::PI, 100_000, None)
            .unwrap();
        assert!((stepper.state()[0] - 1.0).abs() < 1e-11);
        assert!(stepper.state()[1].abs() < 1e-11);
    }

    #[test]
    fn high_accuracy_stays_close_to_the_plain_path() {
        let x = var("x");
        let sys = vec![(x.clone(), num(-1.0) * x.clone())];
        let mut plain =
            AdaptiveStepper::<f64>::new(&sys, vec![1.0], StepperOptions::default()).unwrap();
        let mut compensated = AdaptiveStepper::<f64>::new(
            &sys,
            vec![1.0],
            StepperOptions {
                high_accuracy: true,
                ..Default::default()
            },
        )
        .unwrap();
        plain.propagate_until(1.0, 10_000, None).unwrap();
        compensated.propagate_until(1.0, 10_000, None).unwrap();
        assert!((plain.state()[0] - compensated.state()[0]).abs() < 1e-14);
    }

    #[test]
    fn numerical_failure_leaves_the_state_untouched() {
        // log of a negative value produces NaN coefficients immediately.
        let x = var("x");
        let sys = vec![(x.clone(), log(x.clone()))];
        let mut stepper =
            AdaptiveStepper::new(&sys, vec![-1.0f64], StepperOptions::default()).unwrap();
        let err = stepper.step_forward().unwrap_err();
        assert!(matches!(err, Error::NumericalFailure(_)));
        assert_eq!(stepper.state(), &[-1.0]);
        assert_eq!(stepper.time(), 0.0);
    }

    #[test]
    fn callback_interrupts_between_steps() {
        let mut stepper = decay_stepper(false);
        let mut count = 0;
        let mut cb = |_: &AdaptiveStepper<f64>| {
            count += 1;
            count < 3
        };
        let outcome = stepper
            .propagate_until(1000.0, 100_000, Some(&mut cb))
            .unwrap();
        assert_eq!(outcome, StepOutcome::Interrupted);
        assert_eq!(count, 3);
    }

    #[test]
    fn step_budget_is_honored() {
        let mut stepper = decay_stepper(false);
        let outcome = stepper.propagate_until(1e6, 5, None).unwrap();
        assert_eq!(outcome, StepOutcome::StepLimit);
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let x = var("x");
        let sys = vec![(x.clone(), crate::expr::par(0) * x.clone())];
        let err = AdaptiveStepper::<f64>::new(&sys, vec![1.0], StepperOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }

    #[test]
    fn singular_blowup_fails_instead_of_committing_garbage() {
        // x' = x^2 from x(0) = 1 diverges at t = 1.
        let x = var("x");
        let sys = vec![(x.clone(), square(x.clone()))];
        let mut stepper =
            AdaptiveStepper::new(&sys, vec![1.0f64], StepperOptions::default()).unwrap();
        let r = stepper.propagate_until(2.0, 100_000, None);
        match r {
            Ok(outcome) => assert_ne!(outcome, StepOutcome::TimeLimit),
            Err(e) => assert!(matches!(e, Error::NumericalFailure(_))),
        }
    }
}
