//! Levenberg-Marquardt with a finite-difference Jacobian.
//!
//! The instrument residual is too entangled with panel geometry for an
//! autodiff factor, so the damped normal equations are assembled from
//! forward differences. A singular system or iteration exhaustion yields a
//! structured non-converged outcome carrying the last residual.

use nalgebra::{DMatrix, DVector};

/// Solver settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmOptions {
    pub max_iters: usize,
    /// Stop when the step norm falls below this.
    pub xtol: f64,
    /// Stop when the relative cost reduction falls below this.
    pub ftol: f64,
    /// Initial damping.
    pub lambda0: f64,
    /// Damping multiplier on a rejected step.
    pub lambda_up: f64,
    /// Damping divisor on an accepted step.
    pub lambda_down: f64,
    /// Forward-difference step.
    pub fd_step: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iters: 50,
            xtol: 1e-10,
            ftol: 1e-12,
            lambda0: 1e-3,
            lambda_up: 10.0,
            lambda_down: 10.0,
            fd_step: 1e-6,
        }
    }
}

/// Structured refinement result.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub converged: bool,
    pub n_iter: usize,
    /// Sum of squared residuals at the initial parameters.
    pub rss_before: f64,
    /// Sum of squared residuals at the final parameters.
    pub rss_after: f64,
    /// Final residual vector.
    pub residual: DVector<f64>,
    pub message: String,
}

/// Minimize `|f(x)|^2` from `x0`; returns the final parameters and outcome.
pub fn solve_lm(
    f: impl Fn(&DVector<f64>) -> DVector<f64>,
    x0: DVector<f64>,
    options: &LmOptions,
) -> (DVector<f64>, RefineOutcome) {
    let n = x0.len();
    let mut x = x0;
    let mut residual = f(&x);
    let mut cost = residual.norm_squared();
    let rss_before = cost;
    let mut lambda = options.lambda0;
    let mut message = "iteration limit reached".to_string();
    let mut converged = false;
    let mut n_iter = 0;

    if !cost.is_finite() {
        return (
            x,
            RefineOutcome {
                converged: false,
                n_iter: 0,
                rss_before,
                rss_after: cost,
                residual,
                message: "non-finite initial residual".to_string(),
            },
        );
    }

    for iter in 0..options.max_iters {
        n_iter = iter + 1;

        // Forward-difference Jacobian.
        let m = residual.len();
        let mut jac = DMatrix::<f64>::zeros(m, n);
        for j in 0..n {
            let step = options.fd_step * x[j].abs().max(1.0);
            let mut xp = x.clone();
            xp[j] += step;
            let rp = f(&xp);
            for i in 0..m {
                jac[(i, j)] = (rp[i] - residual[i]) / step;
            }
        }

        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &residual;

        // Reject a numerically dead system outright.
        if jtj.iter().all(|v| v.abs() < 1e-30) {
            message = "singular jacobian".to_string();
            break;
        }

        let mut accepted = false;
        for _ in 0..8 {
            let mut damped = jtj.clone();
            for d in 0..n {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let Some(step) = damped.lu().solve(&(-&jtr)) else {
                message = "singular jacobian".to_string();
                lambda *= options.lambda_up;
                continue;
            };
            if !step.iter().all(|v| v.is_finite()) {
                message = "non-finite step".to_string();
                lambda *= options.lambda_up;
                continue;
            }

            let x_trial = &x + &step;
            let r_trial = f(&x_trial);
            let cost_trial = r_trial.norm_squared();
            if cost_trial.is_finite() && cost_trial < cost {
                let reduction = (cost - cost_trial) / cost.max(1e-300);
                let step_norm = step.norm();
                x = x_trial;
                residual = r_trial;
                cost = cost_trial;
                lambda = (lambda / options.lambda_down).max(1e-12);
                accepted = true;

                if step_norm < options.xtol || reduction < options.ftol {
                    converged = true;
                    message = "converged".to_string();
                }
                break;
            }
            lambda *= options.lambda_up;
        }

        if !accepted {
            // Damping exhausted without improvement: treat a tiny gradient
            // as convergence, otherwise report the stall.
            if jtr.norm() < 1e-10 {
                converged = true;
                message = "converged".to_string();
            } else if message == "iteration limit reached" {
                message = "no downhill step found".to_string();
            }
            break;
        }
        if converged {
            break;
        }
    }

    (
        x,
        RefineOutcome {
            converged,
            n_iter,
            rss_before,
            rss_after: cost,
            residual,
            message,
        },
    )
}
