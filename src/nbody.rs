//! Gravitational N-body system builders.
//!
//! Two variants of the same system: [`make_nbody_sys`] embeds the masses as
//! literals, [`make_nbody_sys_par`] reads them from the runtime parameter
//! array. Both deliberately form the factor `fac_j = G*m_j*r^-3` once per
//! body pair and reuse it for the `j -> i` and `i -> j` accelerations, so
//! the decomposition's CSE collapses the shared products.
//!
//! Massless bodies never contribute a `m_i/m_j` ratio: the fixed-mass
//! variant detects them with `is_zero` on the literal, the parametric one
//! by the massive-body count. When the two agree on which bodies are
//! massless, the resulting systems are equivalent.

use crate::errors::Error;
use crate::expr::{num, pairwise_sum, par, var, Expression};
use crate::math::{pow, square};

fn state_vars(n: u32) -> Vec<[Expression; 6]> {
    (0..n)
        .map(|i| {
            [
                var(format!("x_{i}")),
                var(format!("y_{i}")),
                var(format!("z_{i}")),
                var(format!("vx_{i}")),
                var(format!("vy_{i}")),
                var(format!("vz_{i}")),
            ]
        })
        .collect()
}

fn r_m3(vars: &[[Expression; 6]], i: usize, j: usize) -> [Expression; 4] {
    let diff_x = vars[j][0].clone() - vars[i][0].clone();
    let diff_y = vars[j][1].clone() - vars[i][1].clone();
    let diff_z = vars[j][2].clone() - vars[i][2].clone();
    let r2 = square(diff_x.clone()) + square(diff_y.clone()) + square(diff_z.clone());
    [diff_x, diff_y, diff_z, pow(r2, num(-3.0 / 2.0))]
}

// Position derivatives plus the pairwise-summed accelerations for body i.
fn push_body(
    retval: &mut Vec<(Expression, Expression)>,
    vars: &[[Expression; 6]],
    acc: &mut [Vec<Expression>],
    i: usize,
) -> Result<(), Error> {
    let [x, y, z, vx, vy, vz] = vars[i].clone();
    retval.push((x, vx.clone()));
    retval.push((y, vy.clone()));
    retval.push((z, vz.clone()));
    retval.push((vx, pairwise_sum(std::mem::take(&mut acc[3 * i]))?));
    retval.push((vy, pairwise_sum(std::mem::take(&mut acc[3 * i + 1]))?));
    retval.push((vz, pairwise_sum(std::mem::take(&mut acc[3 * i + 2]))?));
    Ok(())
}

/// Builds an N-body system with fixed (literal) masses and gravitational
/// constant `g_const`.
///
/// When the mass vector is a block of massive bodies followed by a block of
/// massless ones, the restricted structure is used, mirroring the
/// parametric variant.
pub fn make_nbody_sys(
    n: u32,
    g_const: f64,
    masses: &[f64],
) -> Result<Vec<(Expression, Expression)>, Error> {
    if n < 2 {
        return Err(Error::InvalidArg(format!(
            "At least two bodies are needed to create an N-body system, but {n} were requested"
        )));
    }
    if masses.len() != n as usize {
        return Err(Error::InvalidArg(format!(
            "Inconsistent sizes detected while creating an N-body system: the vector of masses has a size of {}, while the number of bodies is {}",
            masses.len(),
            n
        )));
    }

    let vars = state_vars(n);
    let mut retval = Vec::with_capacity(6 * n as usize);
    // Per-body lists of acceleration contributions, x/y/z interleaved.
    let mut acc: Vec<Vec<Expression>> = vec![Vec::new(); 3 * n as usize];

    // Restricted problem detection: massive bodies first, massless after.
    let n_massive = masses.iter().take_while(|&&m| m != 0.0).count();
    let n_massless = masses[n_massive..].iter().take_while(|&&m| m == 0.0).count();
    let restricted = n_massless != 0 && n_massive + n_massless == n as usize;

    let massive_bound = if restricted { n_massive } else { n as usize };
    for i in 0..massive_bound {
        for j in (i + 1)..n as usize {
            let [dx, dy, dz, r3] = r_m3(&vars, i, j);
            let massless_j = if restricted {
                j >= n_massive
            } else {
                masses[j] == 0.0
            };
            if massless_j {
                // Only the acceleration exerted by i on the massless body
                // j; the m_i/m_j ratio is never formed.
                let fac = num(-g_const * masses[i]) * r3;
                acc[3 * j].push(dx * fac.clone());
                acc[3 * j + 1].push(dy * fac.clone());
                acc[3 * j + 2].push(dz * fac);
            } else {
                // The shared factor feeds both directions, so the CSE in
                // the decomposition keeps a single copy.
                let fac_j = num(g_const * masses[j]) * r3;
                let c_ij = num(-masses[i] / masses[j]);

                acc[3 * i].push(dx.clone() * fac_j.clone());
                acc[3 * i + 1].push(dy.clone() * fac_j.clone());
                acc[3 * i + 2].push(dz.clone() * fac_j.clone());

                acc[3 * j].push(dx * fac_j.clone() * c_ij.clone());
                acc[3 * j + 1].push(dy * fac_j.clone() * c_ij.clone());
                acc[3 * j + 2].push(dz * fac_j * c_ij);
            }
        }
        push_body(&mut retval, &vars, &mut acc, i)?;
    }

    for i in massive_bound..n as usize {
        push_body(&mut retval, &vars, &mut acc, i)?;
    }

    Ok(retval)
}

/// Builds an N-body system whose first `n_massive` masses live in the
/// runtime parameter array (`pars[i]` is the mass of body `i`); the
/// remaining bodies are massless.
pub fn make_nbody_sys_par(
    n: u32,
    g_const: f64,
    n_massive: u32,
) -> Result<Vec<(Expression, Expression)>, Error> {
    if n < 2 {
        return Err(Error::InvalidArg(format!(
            "At least two bodies are needed to create an N-body system, but {n} were requested"
        )));
    }
    if n_massive > n {
        return Err(Error::InvalidArg(format!(
            "The number of massive bodies, {n_massive}, cannot be larger than the total number of bodies, {n}"
        )));
    }

    let vars = state_vars(n);
    let mut retval = Vec::with_capacity(6 * n as usize);
    let mut acc: Vec<Vec<Expression>> = vec![Vec::new(); 3 * n as usize];

    for i in 0..n_massive as usize {
        for j in (i + 1)..n as usize {
            let [dx, dy, dz, r3] = r_m3(&vars, i, j);
            if j < n_massive as usize {
                let fac_j = num(g_const) * par(j as u32) * r3;
                let c_ij = (num(-1.0) * par(i as u32)) / par(j as u32);

                acc[3 * i].push(dx.clone() * fac_j.clone());
                acc[3 * i + 1].push(dy.clone() * fac_j.clone());
                acc[3 * i + 2].push(dz.clone() * fac_j.clone());

                acc[3 * j].push(dx * fac_j.clone() * c_ij.clone());
                acc[3 * j + 1].push(dy * fac_j.clone() * c_ij.clone());
                acc[3 * j + 2].push(dz * fac_j * c_ij);
            } else {
                let fac = num(-g_const) * par(i as u32) * r3;
                acc[3 * j].push(dx * fac.clone());
                acc[3 * j + 1].push(dy * fac.clone());
                acc[3 * j + 2].push(dz * fac);
            }
        }
        push_body(&mut retval, &vars, &mut acc, i)?;
    }

    for i in n_massive as usize..n as usize {
        push_body(&mut retval, &vars, &mut acc, i)?;
    }

    Ok(retval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::taylor_decompose;
    use crate::stepper::{AdaptiveStepper, StepperOptions};
    use std::collections::HashMap;

    fn random_point(n: u32) -> HashMap<String, f64> {
        // A fixed, well-separated configuration.
        let mut vars = HashMap::new();
        for i in 0..n {
            let fi = f64::from(i);
            vars.insert(format!("x_{i}"), 1.3 * fi + 0.2);
            vars.insert(format!("y_{i}"), -0.7 * fi + 1.1);
            vars.insert(format!("z_{i}"), 0.4 * fi - 0.5);
            vars.insert(format!("vx_{i}"), 0.1 * fi);
            vars.insert(format!("vy_{i}"), -0.2 * fi + 0.3);
            vars.insert(format!("vz_{i}"), 0.05 * fi);
        }
        vars
    }

    #[test]
    fn mass_vector_size_is_validated() {
        let err = make_nbody_sys(3, 1.0, &[1.0, 2.0]).unwrap_err();
        assert!(err.to_string().contains("has a size of 2"));
        assert!(err.to_string().contains("the number of bodies is 3"));
    }

    #[test]
    fn massive_count_is_validated() {
        assert!(make_nbody_sys_par(3, 1.0, 4).is_err());
    }

    #[test]
    fn shared_factors_are_merged_by_cse() {
        let sys = make_nbody_sys(3, 1.0, &[1.0, 1.5, 2.0]).unwrap();
        let dc = taylor_decompose(&sys).unwrap();
        // Each of the three body pairs contributes exactly one r^-3 node.
        let pow_nodes = dc
            .u_defs()
            .iter()
            .filter(|d| {
                matches!(d.node(), crate::expr::ExprNode::Func(f) if f.display_name() == "pow")
            })
            .count();
        assert_eq!(pow_nodes, 3);
    }

    #[test]
    fn fixed_and_parametric_masses_agree() {
        // Two massive bodies, one massless: the fixed-mass restricted path
        // and the parametric path must describe the same dynamics.
        let masses = [1.0, 0.5, 0.0];
        let fixed = make_nbody_sys(3, 1.0, &masses).unwrap();
        let parametric = make_nbody_sys_par(3, 1.0, 2).unwrap();
        assert_eq!(fixed.len(), parametric.len());

        let vars = random_point(3);
        for ((lhs_f, rhs_f), (lhs_p, rhs_p)) in fixed.iter().zip(&parametric) {
            assert_eq!(lhs_f.to_string(), lhs_p.to_string());
            let a = rhs_f.eval(&vars, &[], 0.0).unwrap();
            let b = rhs_p.eval(&vars, &masses[..2], 0.0).unwrap();
            assert!(
                (a - b).abs() <= 1e-14 * (1.0 + a.abs()),
                "{lhs_f}: {a} vs {b}"
            );
        }

        // The r^-3 sharing survives CSE identically in both variants: one
        // pow node per body pair.
        let count_pow = |dc: &crate::decompose::TaylorDecomposition| {
            dc.u_defs()
                .iter()
                .filter(|d| {
                    matches!(d.node(), crate::expr::ExprNode::Func(f) if f.display_name() == "pow")
                })
                .count()
        };
        let dc_f = taylor_decompose(&fixed).unwrap();
        let dc_p = taylor_decompose(&parametric).unwrap();
        assert_eq!(count_pow(&dc_f), 3);
        assert_eq!(count_pow(&dc_p), 3);
    }

    #[test]
    fn two_body_energy_drift_stays_small() {
        // Equal masses on a circular orbit: separation 1, period
        // 2*pi/sqrt(2). Energy drift after 1000 periods stays below 1e-12.
        let sys = make_nbody_sys(2, 1.0, &[1.0, 1.0]).unwrap();
        let v = 0.5 * 2.0f64.sqrt();
        // State ordering is per body: x, y, z, vx, vy, vz.
        let initial = vec![
            -0.5, 0.0, 0.0, 0.0, -v, 0.0, // body 0
            0.5, 0.0, 0.0, 0.0, v, 0.0, // body 1
        ];

        let energy = |s: &[f64]| {
            let (p0, v0) = (&s[0..3], &s[3..6]);
            let (p1, v1) = (&s[6..9], &s[9..12]);
            let ke = 0.5 * (v0.iter().map(|x| x * x).sum::<f64>()
                + v1.iter().map(|x| x * x).sum::<f64>());
            let r = ((p0[0] - p1[0]).powi(2) + (p0[1] - p1[1]).powi(2) + (p0[2] - p1[2]).powi(2))
                .sqrt();
            ke - 1.0 / r
        };

        let mut stepper = AdaptiveStepper::new(
            &sys,
            initial.clone(),
            StepperOptions {
                tol: Some(1e-14),
                ..Default::default()
            },
        )
        .unwrap();

        let e0 = energy(&initial);
        let period = 2.0 * std::f64::consts::PI / 2.0f64.sqrt();
        stepper
            .propagate_until(1000.0 * period, 10_000_000, None)
            .unwrap();
        let e1 = energy(stepper.state());
        assert!(
            ((e1 - e0) / e0).abs() < 1e-12,
            "relative energy drift {}",
            ((e1 - e0) / e0).abs()
        );
    }
}
