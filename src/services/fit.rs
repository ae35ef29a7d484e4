//! Least-squares solvers behind `DeclineCurve::fit`.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, Dyn, OMatrix, OVector, Owned, U2, U3, Vector2, Vector3};
use thiserror::Error;

use crate::services::arps::rate;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {needed} points to fit, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("solver did not converge: {0}")]
    NotConverged(String),
    #[error("observations are missing the {0} column")]
    MissingColumn(&'static str),
    #[error("parameter covariance is singular")]
    Singular,
    #[error("unknown outlier filter: {0}")]
    UnknownFilter(String),
}

/// Fitted Arps parameters with their standard errors. `b_se` is zero when
/// `b` was held fixed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArpsEstimate {
    pub qi: f64,
    pub di: f64,
    pub b: f64,
    pub qi_se: f64,
    pub di_se: f64,
    pub b_se: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearEstimate {
    pub slope: f64,
    pub intercept: f64,
    pub slope_se: f64,
    pub intercept_se: f64,
}

struct FixedBProblem {
    params: Vector2<f64>,
    b: f64,
    t: Vec<f64>,
    q: Vec<f64>,
}

impl LeastSquaresProblem<f64, Dyn, U2> for FixedBProblem {
    type ParameterStorage = Owned<f64, U2>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U2>;

    fn set_params(&mut self, p: &Vector2<f64>) {
        self.params.copy_from(p);
    }

    fn params(&self) -> Vector2<f64> {
        self.params
    }

    fn residuals(&self) -> Option<OVector<f64, Dyn>> {
        let (qi, di) = (self.params[0], self.params[1]);
        Some(OVector::<f64, Dyn>::from_iterator(
            self.t.len(),
            self.t.iter().zip(&self.q).map(|(t, q)| rate(qi, di, self.b, *t) - q),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U2>> {
        let (qi, di) = (self.params[0], self.params[1]);
        let mut jac = OMatrix::<f64, Dyn, U2>::zeros(self.t.len());
        for (i, t) in self.t.iter().enumerate() {
            let (d_qi, d_di, _) = partials(qi, di, self.b, *t);
            jac[(i, 0)] = d_qi;
            jac[(i, 1)] = d_di;
        }
        Some(jac)
    }
}

struct FreeBProblem {
    params: Vector3<f64>,
    t: Vec<f64>,
    q: Vec<f64>,
}

impl LeastSquaresProblem<f64, Dyn, U3> for FreeBProblem {
    type ParameterStorage = Owned<f64, U3>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U3>;

    fn set_params(&mut self, p: &Vector3<f64>) {
        self.params.copy_from(p);
    }

    fn params(&self) -> Vector3<f64> {
        self.params
    }

    fn residuals(&self) -> Option<OVector<f64, Dyn>> {
        let (qi, di, b) = (self.params[0], self.params[1], self.params[2]);
        Some(OVector::<f64, Dyn>::from_iterator(
            self.t.len(),
            self.t.iter().zip(&self.q).map(|(t, q)| rate(qi, di, b, *t) - q),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U3>> {
        let (qi, di, b) = (self.params[0], self.params[1], self.params[2]);
        let mut jac = OMatrix::<f64, Dyn, U3>::zeros(self.t.len());
        for (i, t) in self.t.iter().enumerate() {
            let (d_qi, d_di, d_b) = partials(qi, di, b, *t);
            jac[(i, 0)] = d_qi;
            jac[(i, 1)] = d_di;
            jac[(i, 2)] = d_b;
        }
        Some(jac)
    }
}

/// Partial derivatives of the Arps rate with respect to qi, di and b.
fn partials(qi: f64, di: f64, b: f64, t: f64) -> (f64, f64, f64) {
    if b.abs() < 1e-9 {
        let decay = (-di * t).exp();
        let q = qi * decay;
        return (decay, -t * q, q * (di * t).powi(2) / 2.0);
    }
    let u = 1.0 + b * di * t;
    let base = u.powf(-1.0 / b);
    let q = qi * base;
    let d_qi = base;
    let d_di = -qi * t * u.powf(-1.0 / b - 1.0);
    let d_b = q * (u.ln() / (b * b) - di * t / (b * u));
    (d_qi, d_di, d_b)
}

/// Log-linear starting point: `ln q ≈ ln qi - di t`.
fn initial_guess(t: &[f64], q: &[f64]) -> (f64, f64) {
    let log_q: Vec<f64> = q.iter().map(|v| v.max(f64::MIN_POSITIVE).ln()).collect();
    match ols(t, &log_q) {
        Ok(line) => (line.intercept.exp(), (-line.slope).max(1e-6)),
        Err(_) => (q.first().copied().unwrap_or(1.0), 1e-3),
    }
}

/// Fits `q(t)` with Levenberg–Marquardt. `t` is measured from the anchor in
/// the units of the fitted decline rate.
pub fn fit_arps(t: &[f64], q: &[f64], fixed_b: Option<f64>) -> Result<ArpsEstimate, FitError> {
    let needed = if fixed_b.is_some() { 3 } else { 4 };
    if t.len() < needed {
        return Err(FitError::TooFewPoints {
            needed,
            got: t.len(),
        });
    }
    let (qi0, di0) = initial_guess(t, q);

    match fixed_b {
        Some(b) => {
            let problem = FixedBProblem {
                params: Vector2::new(qi0, di0),
                b,
                t: t.to_vec(),
                q: q.to_vec(),
            };
            let (result, report) = LevenbergMarquardt::new().minimize(problem);
            if !report.termination.was_successful() {
                return Err(FitError::NotConverged(format!("{:?}", report.termination)));
            }
            let residuals = result.residuals().ok_or(FitError::Singular)?;
            let jacobian = result.jacobian().ok_or(FitError::Singular)?;
            let se = standard_errors(
                DMatrix::from_iterator(t.len(), 2, jacobian.iter().copied()),
                residuals.as_slice(),
            )?;
            Ok(ArpsEstimate {
                qi: result.params[0],
                di: result.params[1],
                b,
                qi_se: se[0],
                di_se: se[1],
                b_se: 0.0,
            })
        }
        None => {
            let problem = FreeBProblem {
                params: Vector3::new(qi0, di0, 0.5),
                t: t.to_vec(),
                q: q.to_vec(),
            };
            let (result, report) = LevenbergMarquardt::new().minimize(problem);
            if !report.termination.was_successful() {
                return Err(FitError::NotConverged(format!("{:?}", report.termination)));
            }
            let residuals = result.residuals().ok_or(FitError::Singular)?;
            let jacobian = result.jacobian().ok_or(FitError::Singular)?;
            let se = standard_errors(
                DMatrix::from_iterator(t.len(), 3, jacobian.iter().copied()),
                residuals.as_slice(),
            )?;
            Ok(ArpsEstimate {
                qi: result.params[0],
                di: result.params[1],
                b: result.params[2],
                qi_se: se[0],
                di_se: se[1],
                b_se: se[2],
            })
        }
    }
}

/// Square roots of the diagonal of `(JᵀJ)⁻¹ · s²`.
fn standard_errors(jacobian: DMatrix<f64>, residuals: &[f64]) -> Result<Vec<f64>, FitError> {
    let (n, p) = jacobian.shape();
    let dof = n.saturating_sub(p).max(1) as f64;
    let s2 = residuals.iter().map(|r| r * r).sum::<f64>() / dof;
    let normal = jacobian.transpose() * &jacobian;
    let inverse = normal.try_inverse().ok_or(FitError::Singular)?;
    Ok((0..p).map(|i| (inverse[(i, i)] * s2).max(0.0).sqrt()).collect())
}

/// Ordinary least squares of `y` on `x`.
pub fn ols(x: &[f64], y: &[f64]) -> Result<LinearEstimate, FitError> {
    let n = x.len().min(y.len());
    if n < 3 {
        return Err(FitError::TooFewPoints { needed: 3, got: n });
    }
    let nf = n as f64;
    let x_mean = x[..n].iter().sum::<f64>() / nf;
    let y_mean = y[..n].iter().sum::<f64>() / nf;
    let sxx: f64 = x[..n].iter().map(|v| (v - x_mean).powi(2)).sum();
    if sxx == 0.0 {
        return Err(FitError::Singular);
    }
    let sxy: f64 = x[..n]
        .iter()
        .zip(&y[..n])
        .map(|(a, b)| (a - x_mean) * (b - y_mean))
        .sum();

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let ssr: f64 = x[..n]
        .iter()
        .zip(&y[..n])
        .map(|(a, b)| (b - intercept - slope * a).powi(2))
        .sum();
    let s2 = ssr / (nf - 2.0);
    let x_sq_mean = x[..n].iter().map(|v| v * v).sum::<f64>() / nf;

    Ok(LinearEstimate {
        slope,
        intercept,
        slope_se: (s2 / sxx).sqrt(),
        intercept_se: (s2 * x_sq_mean / sxx).sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ols_recovers_an_exact_line() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let line = ols(&x, &y).unwrap();
        assert_relative_eq!(line.slope, 2.0, epsilon = 1e-12);
        assert_relative_eq!(line.intercept, 1.0, epsilon = 1e-12);
        assert_relative_eq!(line.slope_se, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn fit_arps_recovers_exponential_parameters() {
        let t: Vec<f64> = (0..30).map(f64::from).collect();
        let q: Vec<f64> = t.iter().map(|t| rate(800.0, 0.05, 0.0, *t)).collect();
        let estimate = fit_arps(&t, &q, Some(0.0)).unwrap();
        assert_relative_eq!(estimate.qi, 800.0, max_relative = 1e-4);
        assert_relative_eq!(estimate.di, 0.05, max_relative = 1e-4);
        assert_eq!(estimate.b, 0.0);
    }

    #[test]
    fn fit_arps_recovers_hyperbolic_exponent() {
        let t: Vec<f64> = (0..60).map(f64::from).collect();
        let q: Vec<f64> = t.iter().map(|t| rate(1000.0, 0.08, 0.6, *t)).collect();
        let estimate = fit_arps(&t, &q, None).unwrap();
        assert_relative_eq!(estimate.qi, 1000.0, max_relative = 1e-3);
        assert_relative_eq!(estimate.di, 0.08, max_relative = 1e-2);
        assert_relative_eq!(estimate.b, 0.6, max_relative = 1e-2);
    }

    #[test]
    fn fit_arps_needs_enough_points() {
        let error = fit_arps(&[0.0, 1.0], &[10.0, 9.0], None).unwrap_err();
        assert_eq!(error, FitError::TooFewPoints { needed: 4, got: 2 });
    }
}
