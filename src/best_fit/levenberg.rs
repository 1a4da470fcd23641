//! Small dense Levenberg–Marquardt minimizer with a central-difference Jacobian.

use nalgebra::{DMatrix, DVector};

const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_MAX: f64 = 1e16;

#[derive(Debug, Clone, Copy)]
pub struct LmSettings {
    pub max_iterations: usize,
    /// Relative cost decrease and relative step size below which the
    /// iteration stops.
    pub tolerance: f64,
    /// Cost regarded as exactly zero.
    pub cost_floor: f64,
    pub initial_lambda: f64,
}

#[derive(Debug, Clone)]
pub struct LmReport {
    pub params: DVector<f64>,
    pub residuals: DVector<f64>,
    /// Sum of squared residuals.
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Gauss–Newton matrix JᵀJ at `params`.
    pub jtj: DMatrix<f64>,
}

/// Minimizes `Σ f(p)ᵢ²` starting from `initial`.
pub fn minimize<F>(f: F, initial: DVector<f64>, settings: &LmSettings) -> LmReport
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n = initial.len();
    let mut params = initial;
    let mut residuals = f(&params);
    let mut cost = residuals.norm_squared();
    let mut jac = jacobian(&f, &params, residuals.len());
    let mut lambda = settings.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        if cost <= settings.cost_floor {
            converged = true;
            break;
        }
        iterations += 1;

        let jtj = jac.transpose() * &jac;
        let gradient = jac.transpose() * &residuals;
        let mut damped = jtj.clone();
        for i in 0..n {
            damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
        }

        let step = match damped.cholesky() {
            Some(chol) => -chol.solve(&gradient),
            None => {
                lambda = (lambda * 10.0).min(LAMBDA_MAX);
                continue;
            }
        };
        let small_step =
            step.norm() <= settings.tolerance * (params.norm() + settings.tolerance);

        let candidate = &params + &step;
        let candidate_residuals = f(&candidate);
        let candidate_cost = candidate_residuals.norm_squared();

        if candidate_cost.is_finite() && candidate_cost < cost {
            let decrease = cost - candidate_cost;
            let previous = cost;
            params = candidate;
            residuals = candidate_residuals;
            cost = candidate_cost;
            jac = jacobian(&f, &params, residuals.len());
            lambda = (lambda / 10.0).max(LAMBDA_MIN);

            if decrease <= settings.tolerance * previous
                || small_step
                || cost <= settings.cost_floor
            {
                converged = true;
                break;
            }
        } else {
            // no descent left at this damping: we are at the numerical minimum
            if small_step || lambda >= LAMBDA_MAX {
                converged = true;
                break;
            }
            lambda = (lambda * 10.0).min(LAMBDA_MAX);
        }
    }

    if !converged && cost <= settings.cost_floor {
        converged = true;
    }

    LmReport {
        jtj: jac.transpose() * &jac,
        params,
        residuals,
        cost,
        iterations,
        converged,
    }
}

/// Central-difference Jacobian, one column per parameter.
fn jacobian<F>(f: &F, params: &DVector<f64>, rows: usize) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut jac = DMatrix::zeros(rows, params.len());
    for j in 0..params.len() {
        let h = 1e-7 * params[j].abs().max(1.0);
        let mut plus = params.clone();
        plus[j] += h;
        let mut minus = params.clone();
        minus[j] -= h;
        let column = (f(&plus) - f(&minus)) / (2.0 * h);
        jac.set_column(j, &column);
    }
    jac
}
