//! 1-D Gaussian model fitting on projection data.
//!
//! Both models are fitted with a damped least-squares (Levenberg-Marquardt)
//! loop over analytic Jacobians. Initial guesses are derived from the data
//! itself (mean, max, population standard deviation), so the solver
//! converges for arbitrary scale and offset without hard-coded positions.
//!
//! Every entry point returns `Option`: `None` means the fit did not
//! converge (degenerate data, runaway damping, non-finite model values) and
//! the caller falls back to the raw standard deviation of the projection.

use nalgebra::{DMatrix, DVector};

/// Parameters of a fitted single Gaussian `i0 + amp*exp(-(x-x0)^2/2s^2)`.
#[derive(Debug, Clone, Copy)]
pub struct GaussianFit {
    pub offset: f64,
    pub center: f64,
    /// Fitted width. May come out negative (the model is symmetric in the
    /// sign); callers take the absolute value.
    pub sigma: f64,
    pub amplitude: f64,
}

/// Parameters of a fitted symmetric two-lobe Gaussian: lobes of equal width
/// and amplitude at `x0 - d/2` and `x0 + d/2`.
#[derive(Debug, Clone, Copy)]
pub struct DoubleGaussianFit {
    pub offset: f64,
    pub center: f64,
    pub sigma: f64,
    pub amplitude: f64,
    pub separation: f64,
}

/// Initial lobe separation for the two-lobe fit, in pixels.
const INITIAL_SEPARATION: f64 = 100.0;

const MAX_ITERATIONS: usize = 100;
const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING: f64 = 1e10;
const STEP_TOLERANCE: f64 = 1e-10;

/// Fit a single Gaussian to `values` sampled at `x = 0, 1, 2, ...`.
pub fn fit_gaussian(values: &[f64]) -> Option<GaussianFit> {
    let (offset, center, sigma, amplitude) = initial_guess(values)?;
    let init = DVector::from_vec(vec![offset, center, sigma, amplitude]);

    let params = solve_least_squares(values, init, |x, p| {
        let (i0, x0, sigma, amp) = (p[0], p[1], p[2], p[3]);
        if sigma == 0.0 || !sigma.is_finite() {
            return None;
        }
        let u = x - x0;
        let s2 = sigma * sigma;
        let e = (-u * u / (2.0 * s2)).exp();
        let value = i0 + amp * e;
        if !value.is_finite() {
            return None;
        }
        let grad = DVector::from_vec(vec![
            1.0,
            amp * e * u / s2,
            amp * e * u * u / (s2 * sigma),
            e,
        ]);
        Some((value, grad))
    })?;

    Some(GaussianFit {
        offset: params[0],
        center: params[1],
        sigma: params[2],
        amplitude: params[3],
    })
}

/// Fit a symmetric two-lobe Gaussian to `values` sampled at `x = 0, 1, ...`.
pub fn fit_double_gaussian(values: &[f64]) -> Option<DoubleGaussianFit> {
    let (offset, center, sigma, amplitude) = initial_guess(values)?;
    let init = DVector::from_vec(vec![offset, center, sigma, amplitude, INITIAL_SEPARATION]);

    let params = solve_least_squares(values, init, |x, p| {
        let (i0, x0, sigma, amp, dist) = (p[0], p[1], p[2], p[3], p[4]);
        if sigma == 0.0 || !sigma.is_finite() {
            return None;
        }
        let s2 = sigma * sigma;
        let u1 = x - x0 + dist / 2.0;
        let u2 = x - x0 - dist / 2.0;
        let e1 = (-u1 * u1 / (2.0 * s2)).exp();
        let e2 = (-u2 * u2 / (2.0 * s2)).exp();
        let value = i0 + amp * (e1 + e2);
        if !value.is_finite() {
            return None;
        }
        let grad = DVector::from_vec(vec![
            1.0,
            amp * (e1 * u1 + e2 * u2) / s2,
            amp * (e1 * u1 * u1 + e2 * u2 * u2) / (s2 * sigma),
            e1 + e2,
            amp * (e2 * u2 - e1 * u1) / (2.0 * s2),
        ]);
        Some((value, grad))
    })?;

    Some(DoubleGaussianFit {
        offset: params[0],
        center: params[1],
        sigma: params[2],
        amplitude: params[3],
        separation: params[4],
    })
}

/// Population standard deviation of the sample values (the same statistic
/// the fallback path reports when a fit does not converge).
pub(crate) fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt()
}

/// Analytic initial guess: offset from the mean, amplitude from the excess
/// of the maximum over it, width from the value spread, center mid-span.
fn initial_guess(values: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !mean.is_finite() || !max.is_finite() {
        return None;
    }
    Some((mean, n / 2.0, population_std(values), max - mean))
}

/// Damped normal-equation iteration. `eval` returns the model value and its
/// gradient at sample position `x` for the current parameters, or `None`
/// when the model is undefined there (zero width, overflow).
fn solve_least_squares<F>(values: &[f64], init: DVector<f64>, eval: F) -> Option<DVector<f64>>
where
    F: Fn(f64, &DVector<f64>) -> Option<(f64, DVector<f64>)>,
{
    let n = values.len();
    let p = init.len();
    if n <= p {
        return None;
    }

    let residuals = |params: &DVector<f64>| -> Option<(DVector<f64>, DMatrix<f64>)> {
        let mut r = DVector::zeros(n);
        let mut jac = DMatrix::zeros(n, p);
        for (i, &y) in values.iter().enumerate() {
            let (value, grad) = eval(i as f64, params)?;
            r[i] = value - y;
            for col in 0..p {
                jac[(i, col)] = grad[col];
            }
        }
        Some((r, jac))
    };

    let mut params = init;
    let (mut r, mut jac) = residuals(&params)?;
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return None;
    }

    let mut damping = INITIAL_DAMPING;
    for _ in 0..MAX_ITERATIONS {
        let jt = jac.transpose();
        let mut h = &jt * &jac;
        let g = &jt * &r;
        for d in 0..p {
            h[(d, d)] += damping * h[(d, d)].max(1e-12);
        }

        let step = match h.lu().solve(&(-&g)) {
            Some(step) if step.iter().all(|v| v.is_finite()) => step,
            _ => {
                damping *= 10.0;
                if damping > MAX_DAMPING {
                    return None;
                }
                continue;
            }
        };

        let candidate = &params + &step;
        match residuals(&candidate) {
            Some((cr, cjac)) => {
                let candidate_cost = cr.norm_squared();
                if candidate_cost.is_finite() && candidate_cost <= cost {
                    let improvement = cost - candidate_cost;
                    params = candidate;
                    r = cr;
                    jac = cjac;
                    cost = candidate_cost;
                    damping = (damping * 0.1).max(1e-12);
                    if step.norm() < STEP_TOLERANCE
                        || improvement <= f64::EPSILON * cost.max(1.0)
                    {
                        return Some(params);
                    }
                } else {
                    damping *= 10.0;
                    if damping > MAX_DAMPING {
                        return None;
                    }
                }
            }
            None => {
                damping *= 10.0;
                if damping > MAX_DAMPING {
                    return None;
                }
            }
        }
    }

    // Ran out of iterations without meeting the convergence criteria.
    None
}
