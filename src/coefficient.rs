//! Nonlinear coefficient models
//!
//! The level solvers linearize an elliptic equation whose conductivity depends
//! on the potential. Two models are provided:
//!
//! - [`Coefficient::Exponential`]: `κ(p) = exp(α·p)`
//! - [`Coefficient::Haverkamp`]: `κ(ψ) = k_sat·α / (α + |ψ|^β)` with
//!   `ψ = p − z`, a Richards-type relative permeability with optional
//!   per-element elevation
//!
//! Evaluations are clamped into `[MIN_COEFFICIENT, MAX_COEFFICIENT]` so the
//! rescaled operator stays solvable at extreme iterates; the derivative of the
//! inverse coefficient is zero wherever the clamp engages.

use crate::error::SolverError;
use ndarray::Array1;

/// Smallest coefficient value ever returned by [`Coefficient::kappa`].
pub const MIN_COEFFICIENT: f64 = 1e-30;

/// Largest coefficient value ever returned by [`Coefficient::kappa`].
pub const MAX_COEFFICIENT: f64 = 1e30;

/// Nonlinear conductivity model κ(p).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coefficient {
    /// `κ(p) = exp(α·p)`
    Exponential { alpha: f64 },
    /// `κ(ψ) = k_sat·α / (α + |ψ|^β)`, `ψ = p − z`
    Haverkamp { alpha: f64, beta: f64, k_sat: f64 },
}

impl Coefficient {
    /// Exponential model with sensitivity `alpha`
    pub fn exponential(alpha: f64) -> Self {
        Coefficient::Exponential { alpha }
    }

    /// Haverkamp relative-permeability model
    pub fn haverkamp(alpha: f64, beta: f64, k_sat: f64) -> Self {
        Coefficient::Haverkamp {
            alpha,
            beta,
            k_sat,
        }
    }

    /// Validate model parameters
    pub fn validate(&self) -> Result<(), SolverError> {
        match *self {
            Coefficient::Exponential { alpha } => {
                if !alpha.is_finite() {
                    return Err(SolverError::InvalidCoefficient {
                        name: "alpha",
                        value: alpha,
                    });
                }
            }
            Coefficient::Haverkamp {
                alpha,
                beta,
                k_sat,
            } => {
                for (name, value) in [("alpha", alpha), ("beta", beta), ("k_sat", k_sat)] {
                    if !value.is_finite() || value <= 0.0 {
                        return Err(SolverError::InvalidCoefficient { name, value });
                    }
                }
            }
        }
        Ok(())
    }

    /// Coefficient at one potential value, clamped into
    /// `[MIN_COEFFICIENT, MAX_COEFFICIENT]`
    pub fn kappa(&self, p: f64, z: f64) -> f64 {
        let raw = match *self {
            Coefficient::Exponential { alpha } => (alpha * p).exp(),
            Coefficient::Haverkamp {
                alpha,
                beta,
                k_sat,
            } => {
                let psi = p - z;
                k_sat * alpha / (alpha + psi.abs().powf(beta))
            }
        };
        raw.clamp(MIN_COEFFICIENT, MAX_COEFFICIENT)
    }

    /// Derivative of the inverse coefficient, `d(κ⁻¹)/dp`, at one potential
    /// value; zero wherever [`kappa`](Coefficient::kappa) is clamped
    pub fn dkinv_dp(&self, p: f64, z: f64) -> f64 {
        let raw = match *self {
            Coefficient::Exponential { alpha } => (alpha * p).exp(),
            Coefficient::Haverkamp {
                alpha,
                beta,
                k_sat,
            } => {
                let psi = p - z;
                k_sat * alpha / (alpha + psi.abs().powf(beta))
            }
        };
        if !(MIN_COEFFICIENT..=MAX_COEFFICIENT).contains(&raw) {
            return 0.0;
        }
        match *self {
            Coefficient::Exponential { alpha } => -alpha * (-alpha * p).exp(),
            Coefficient::Haverkamp {
                alpha,
                beta,
                k_sat,
            } => {
                let psi = p - z;
                if psi == 0.0 {
                    0.0
                } else {
                    beta * psi.abs().powf(beta - 1.0) * psi.signum() / (k_sat * alpha)
                }
            }
        }
    }

    /// Evaluate κ over a per-element potential vector
    pub fn eval(&self, p: &Array1<f64>, elevation: Option<&Array1<f64>>, out: &mut Array1<f64>) {
        match elevation {
            Some(z) => {
                for ((o, &pi), &zi) in out.iter_mut().zip(p.iter()).zip(z.iter()) {
                    *o = self.kappa(pi, zi);
                }
            }
            None => {
                for (o, &pi) in out.iter_mut().zip(p.iter()) {
                    *o = self.kappa(pi, 0.0);
                }
            }
        }
    }

    /// Evaluate `d(κ⁻¹)/dp` over a per-element potential vector
    pub fn eval_dkinv(
        &self,
        p: &Array1<f64>,
        elevation: Option<&Array1<f64>>,
        out: &mut Array1<f64>,
    ) {
        match elevation {
            Some(z) => {
                for ((o, &pi), &zi) in out.iter_mut().zip(p.iter()).zip(z.iter()) {
                    *o = self.dkinv_dp(pi, zi);
                }
            }
            None => {
                for (o, &pi) in out.iter_mut().zip(p.iter()) {
                    *o = self.dkinv_dp(pi, 0.0);
                }
            }
        }
    }
}
