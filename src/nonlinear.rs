//! Generic inexact-Newton outer loop
//!
//! [`solve_nonlinear`] drives any [`NonlinearScheme`] to approximately satisfy
//! `A(sol) = rhs`. Two implementors exist in this crate:
//! [`LevelSolver`](crate::level::LevelSolver) (Picard/Newton step) and
//! [`FasSolver`](crate::fas::FasSolver) (one FAS cycle per step).
//!
//! The loop measures the residual against a baseline taken at the zero vector,
//! stops on absolute or relative tolerance, and adapts the tolerance requested
//! from the inner linear solves with an Eisenstat-Walker forcing term.
//! Non-convergence is reported in the returned [`NonlinearState`], never as an
//! error.

use crate::error::SolverError;
use ndarray::Array1;
use std::time::Instant;

// Choice 2 in Eisenstat and Walker, SISC 17(1), 1996: exponent (1 + sqrt(5)) / 2.
const FORCING_EXPONENT: f64 = 1.618_033_988_749_895;
const MAX_FORCING_TERM: f64 = 0.9;

/// Linearization strategy for the level solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linearization {
    /// Full linearization including the coefficient derivative
    #[default]
    Newton,
    /// Fixed-point iteration re-evaluating the coefficient only
    Picard,
}

/// Configuration shared by every nonlinear solve
#[derive(Debug, Clone)]
pub struct NonlinearConfig {
    /// Log iteration progress when > 0; backtracking detail when > 1
    pub print_level: usize,
    /// Maximum number of nonlinear iterations
    pub max_iterations: usize,
    /// Relative residual tolerance (against the zero-vector baseline)
    pub rtol: f64,
    /// Absolute residual tolerance
    pub atol: f64,
    /// Warn when the iteration budget is exhausted without convergence;
    /// disabled for relaxation-mode solves inside a multigrid cycle
    pub check_converge: bool,
    /// Picard or Newton step
    pub linearization: Linearization,
    /// Maximum number of step halvings per backtracking pass (0 = off)
    pub num_backtrack: usize,
    /// Clamp on the maximum piecewise-constant potential change per step
    /// (`None` = off)
    pub diff_tol: Option<f64>,
    /// Linear tolerance requested on the first iteration
    pub init_linear_tol: f64,
    /// Floor for the adaptive linear tolerance
    pub min_linear_tol: f64,
}

impl Default for NonlinearConfig {
    fn default() -> Self {
        Self {
            print_level: 0,
            max_iterations: 50,
            rtol: 1e-8,
            atol: 1e-10,
            check_converge: true,
            linearization: Linearization::default(),
            num_backtrack: 0,
            diff_tol: None,
            init_linear_tol: 1e-4,
            min_linear_tol: 1e-8,
        }
    }
}

impl NonlinearConfig {
    /// Relaxation preset: a fixed number of smoothing steps with the
    /// exhaustion warning disabled
    pub fn relaxation(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            check_converge: false,
            ..Default::default()
        }
    }

    /// Validate tolerances; fatal at solver construction
    pub fn validate(&self) -> Result<(), SolverError> {
        for (name, value) in [("rtol", self.rtol), ("atol", self.atol)] {
            if !value.is_finite() || value < 0.0 {
                return Err(SolverError::InvalidTolerance { name, value });
            }
        }
        for (name, value) in [
            ("init_linear_tol", self.init_linear_tol),
            ("min_linear_tol", self.min_linear_tol),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(SolverError::InvalidTolerance { name, value });
            }
        }
        if self.min_linear_tol > self.init_linear_tol {
            return Err(SolverError::LinearTolOrder {
                floor: self.min_linear_tol,
                initial: self.init_linear_tol,
            });
        }
        if let Some(value) = self.diff_tol {
            if !value.is_finite() || value <= 0.0 {
                return Err(SolverError::InvalidTolerance {
                    name: "diff_tol",
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Mutable per-solve state, rebuilt at the start of each solve and returned
/// when it finishes
#[derive(Debug, Clone, Default)]
pub struct NonlinearState {
    /// Nonlinear iterations performed
    pub iterations: usize,
    /// Baseline residual norm at the zero vector
    pub initial_resid_norm: f64,
    /// Residual norm before the most recent step
    pub prev_resid_norm: f64,
    /// Most recent residual norm
    pub resid_norm: f64,
    /// Linear tolerance accepted for the most recent step
    pub linear_tol: f64,
    /// Whether a convergence test passed
    pub converged: bool,
    /// Wall-clock solve time in milliseconds
    pub solve_time_ms: f64,
}

impl NonlinearState {
    /// Residual norm relative to the zero-vector baseline
    pub fn relative_residual(&self) -> f64 {
        if self.initial_resid_norm > 0.0 {
            self.resid_norm / self.initial_resid_norm
        } else {
            self.resid_norm
        }
    }
}

/// One nonlinear relaxation scheme: how to measure the residual and how to
/// take one step.
///
/// The implementor set is closed by design: [`LevelSolver`](crate::level::LevelSolver)
/// dispatches on [`Linearization`], [`FasSolver`](crate::fas::FasSolver) runs
/// one multigrid cycle per step.
pub trait NonlinearScheme {
    /// Norm of `A(sol) − rhs` over free dofs, via true-vector reduction
    fn residual_norm(&mut self, sol: &Array1<f64>, rhs: &Array1<f64>) -> f64;

    /// One nonlinear update of `sol` toward `A(sol) = rhs`; reads the accepted
    /// linear tolerance from `state` and may refine `state.resid_norm` through
    /// backtracking
    fn iteration_step(&mut self, rhs: &Array1<f64>, sol: &mut Array1<f64>, state: &mut NonlinearState);

    /// Tag used in log messages
    fn name(&self) -> &str;
}

/// Drive `scheme` until `A(sol) = rhs` holds to tolerance, mutating `sol`.
///
/// Convergence is declared when the residual norm falls below `atol` or below
/// `rtol` relative to the zero-vector baseline. Exhausting `max_iterations`
/// reports `converged = false` (with a warning when `check_converge` is set)
/// and leaves the partial iterate in `sol`; the caller decides whether it is
/// usable. NaN residuals satisfy no test and terminate through exhaustion.
pub fn solve_nonlinear<S: NonlinearScheme>(
    scheme: &mut S,
    rhs: &Array1<f64>,
    sol: &mut Array1<f64>,
    config: &NonlinearConfig,
) -> NonlinearState {
    let start = Instant::now();

    let zero = Array1::zeros(sol.len());
    let norm0 = scheme.residual_norm(&zero, rhs);

    let mut state = NonlinearState {
        initial_resid_norm: norm0,
        prev_resid_norm: norm0,
        resid_norm: norm0,
        linear_tol: config.init_linear_tol,
        ..Default::default()
    };

    let mut iter = 0;
    while iter < config.max_iterations {
        state.resid_norm = scheme.residual_norm(sol, rhs);
        let rel = state.relative_residual();

        if config.print_level > 0 {
            log::info!(
                "{} iter {:3}: abs resid = {:.6e}, rel resid = {:.6e}",
                scheme.name(),
                iter,
                state.resid_norm,
                rel
            );
        }

        if state.resid_norm < config.atol || rel < config.rtol {
            state.converged = true;
            break;
        }

        if iter > 0 {
            state.linear_tol = forcing_term(&state, config);
        }
        state.prev_resid_norm = state.resid_norm;

        scheme.iteration_step(rhs, sol, &mut state);
        iter += 1;
    }
    state.iterations = iter;

    if !state.converged && config.check_converge {
        log::warn!(
            "{} solver did not converge after {} iterations (residual {:.6e})",
            scheme.name(),
            state.iterations,
            state.resid_norm
        );
    }

    state.solve_time_ms = start.elapsed().as_secs_f64() * 1e3;
    state
}

/// Linear tolerance for the next inner solve from the ratio of successive
/// nonlinear residual norms
fn forcing_term(state: &NonlinearState, config: &NonlinearConfig) -> f64 {
    if state.prev_resid_norm <= 0.0 {
        return config.init_linear_tol;
    }
    let ratio = state.resid_norm / state.prev_resid_norm;
    if !ratio.is_finite() {
        return config.init_linear_tol;
    }
    ratio
        .powf(FORCING_EXPONENT)
        .clamp(config.min_linear_tol, MAX_FORCING_TERM)
}
