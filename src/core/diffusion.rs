//! Diffusion curves describing how assumptions and technologies roll out
//! between the base year and the end year.
//!
//! Two kinds live here: the generic normalized curves (linear and sigmoid)
//! used by cascade stages such as smart-meter penetration and overall demand
//! change, and the two-anchor logistic fit used to model the adoption of an
//! installed technology.

use crate::core::units::SIGMOID_YEAR_OFFSET;
use crate::input::DiffusionMethod;
use anyhow::{anyhow, bail};
use nalgebra::{Matrix2, Vector2};

/// Anchor value used instead of zero when a technology enters the market
/// after the base year, keeping the logistic fit well-posed.
pub const MARKET_ENTRY_EPSILON: f64 = 1e-3;

/// Fraction of the base-to-end-year interval completed by `curr_yr`, linear.
///
/// Returns exactly 0 at the base year and exactly 1 at the end year.
pub fn linear_diffusion(base_yr: u32, curr_yr: u32, end_yr: u32) -> f64 {
    if end_yr == base_yr {
        return 0.;
    }
    (curr_yr as f64 - base_yr as f64) / (end_yr as f64 - base_yr as f64)
}

/// Fraction of the base-to-end-year interval completed by `curr_yr`, along a
/// sigmoid normalized so that the base year maps to exactly 0 and the end
/// year to exactly 1.
///
/// The interval is projected onto [-6, 6] before evaluating the logistic,
/// then rescaled by the curve's values at the interval ends.
pub fn sigmoid_diffusion(
    base_yr: u32,
    curr_yr: u32,
    end_yr: u32,
    sig_midpoint: f64,
    sig_steepness: f64,
) -> f64 {
    if end_yr == base_yr {
        return 0.;
    }
    let logistic = |x: f64| 1. / (1. + (-sig_steepness * (x - sig_midpoint)).exp());

    let fraction = (curr_yr as f64 - base_yr as f64) / (end_yr as f64 - base_yr as f64);
    let x = fraction * 12. - 6.;

    let lower = logistic(-6.);
    let upper = logistic(6.);

    (logistic(x) - lower) / (upper - lower)
}

/// Diffusion fraction for a method chosen in the scenario input.
pub fn diffusion_fraction(
    method: DiffusionMethod,
    base_yr: u32,
    curr_yr: u32,
    end_yr: u32,
    sig_midpoint: f64,
    sig_steepness: f64,
) -> f64 {
    match method {
        DiffusionMethod::Linear => linear_diffusion(base_yr, curr_yr, end_yr),
        DiffusionMethod::Sigmoid => {
            sigmoid_diffusion(base_yr, curr_yr, end_yr, sig_midpoint, sig_steepness)
        }
    }
}

/// Parameters of a fitted technology adoption curve
/// `f(year) = L / (1 + exp(-steepness * ((year - 2000) - midpoint)))`.
///
/// Computed once per (enduse, technology) at model setup and read-only
/// thereafter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SigmoidParameters {
    pub l_parameter: f64,
    pub midpoint: f64,
    pub steepness: f64,
}

impl SigmoidParameters {
    pub fn evaluate(&self, year: u32) -> f64 {
        let x = year as f64 - SIGMOID_YEAR_OFFSET;
        self.l_parameter / (1. + (-self.steepness * (x - self.midpoint)).exp())
    }
}

/// Bounded retry policy for the logistic fit: an ordered ladder of initial
/// steepness guesses, an iteration cap per attempt, and the acceptance
/// predicate thresholds.
#[derive(Clone, Debug)]
pub struct FitPolicy {
    pub initial_steepness: Vec<f64>,
    pub max_iterations: usize,
    pub residual_tolerance: f64,
    pub steepness_min: f64,
    pub steepness_max: f64,
}

impl Default for FitPolicy {
    fn default() -> Self {
        Self {
            // geometrically increasing ladder of starting magnitudes
            initial_steepness: vec![0.001, 0.01, 0.1, 1., 10., 100.],
            max_iterations: 200,
            residual_tolerance: 1e-7,
            steepness_min: 1e-3,
            steepness_max: 200.,
        }
    }
}

/// Fit the two-parameter logistic through two (year, value) anchors with
/// asymptote `l`, by damped Gauss-Newton least squares.
///
/// Deterministic: identical inputs and an identical ladder always produce the
/// same parameters. A converged fit whose steepness falls outside the
/// acceptable range is rejected and the next initial guess is tried;
/// exhausting the ladder is an error for the caller to make fatal.
pub fn fit_sigmoid(
    point_x: [f64; 2],
    point_y: [f64; 2],
    l: f64,
    policy: &FitPolicy,
) -> anyhow::Result<SigmoidParameters> {
    if l <= 0. {
        bail!("logistic asymptote must be positive, got {l}");
    }
    if point_x[0] == point_x[1] {
        bail!("anchor years must differ, both are {}", point_x[0]);
    }
    // Values on the asymptote (or at zero) make the logistic unreachable;
    // nudge them just inside the open interval.
    let y: Vec<f64> = point_y
        .iter()
        .map(|&value| value.clamp(l * 1e-9, l * (1. - 1e-9)))
        .collect();
    let x = [
        point_x[0] - SIGMOID_YEAR_OFFSET,
        point_x[1] - SIGMOID_YEAR_OFFSET,
    ];
    let midpoint_guess = (x[0] + x[1]) / 2.;

    for &initial_steepness in &policy.initial_steepness {
        match fit_attempt(&x, &y, l, midpoint_guess, initial_steepness, policy) {
            Some(parameters)
                if parameters.steepness.abs() >= policy.steepness_min
                    && parameters.steepness.abs() <= policy.steepness_max
                    && parameters.midpoint.is_finite() =>
            {
                return Ok(parameters);
            }
            Some(parameters) => {
                tracing::debug!(
                    steepness = parameters.steepness,
                    initial_steepness,
                    "rejecting fit with steepness outside acceptable range"
                );
            }
            None => {}
        }
    }

    Err(anyhow!(
        "no acceptable logistic fit through ({}, {}) and ({}, {}) with L = {l} after {} initial guesses",
        point_x[0],
        point_y[0],
        point_x[1],
        point_y[1],
        policy.initial_steepness.len()
    ))
}

/// One Levenberg-damped Gauss-Newton descent from a single starting point.
/// Returns parameters only when the residual dropped below tolerance.
fn fit_attempt(
    x: &[f64; 2],
    y: &[f64],
    l: f64,
    midpoint_guess: f64,
    initial_steepness: f64,
    policy: &FitPolicy,
) -> Option<SigmoidParameters> {
    let mut midpoint = midpoint_guess;
    let mut steepness = initial_steepness;
    let mut lambda = 1e-3;

    let residuals = |midpoint: f64, steepness: f64| -> Vector2<f64> {
        Vector2::new(
            l / (1. + (-steepness * (x[0] - midpoint)).exp()) - y[0],
            l / (1. + (-steepness * (x[1] - midpoint)).exp()) - y[1],
        )
    };

    for _ in 0..policy.max_iterations {
        let r = residuals(midpoint, steepness);
        if r.norm() < policy.residual_tolerance {
            return Some(SigmoidParameters {
                l_parameter: l,
                midpoint,
                steepness,
            });
        }

        let mut jacobian = Matrix2::zeros();
        for (i, &xi) in x.iter().enumerate() {
            let s = 1. / (1. + (-steepness * (xi - midpoint)).exp());
            let slope = l * s * (1. - s);
            jacobian[(i, 0)] = -steepness * slope;
            jacobian[(i, 1)] = (xi - midpoint) * slope;
        }

        let normal = jacobian.transpose() * jacobian + Matrix2::identity() * lambda;
        let gradient = jacobian.transpose() * r;
        let delta = normal.try_inverse()? * -gradient;

        let trial_midpoint = midpoint + delta[0];
        let trial_steepness = steepness + delta[1];
        if !trial_midpoint.is_finite() || !trial_steepness.is_finite() {
            return None;
        }

        if residuals(trial_midpoint, trial_steepness).norm() < r.norm() {
            midpoint = trial_midpoint;
            steepness = trial_steepness;
            lambda = (lambda * 0.5).max(1e-12);
        } else {
            lambda *= 10.;
            if lambda > 1e12 {
                return None;
            }
        }
    }

    let r = residuals(midpoint, steepness);
    (r.norm() < policy.residual_tolerance).then_some(SigmoidParameters {
        l_parameter: l,
        midpoint,
        steepness,
    })
}
