//! Nonlinear multilevel solvers
//!
//! This crate provides an inexact-Newton outer iteration and two
//! interchangeable nonlinear relaxation schemes for mixed-form elliptic
//! problems with potential-dependent coefficients.
//!
//! # Features
//!
//! - **Outer Iteration**: generic inexact-Newton loop with Eisenstat-Walker
//!   adaptive linear tolerances
//! - **Level Solvers**: Picard and Newton linearizations with step clamping
//!   and residual-halving backtracking
//! - **FAS Multigrid**: full approximation scheme V-cycles and post-smoothing
//!   cycles over a user-supplied level hierarchy
//! - **Coefficient Models**: exponential and Haverkamp conductivities with
//!   optional per-element elevation
//! - **Pluggable Backends**: operator, transfer, and reduction traits keep the
//!   discretization and parallel layout outside the core
//!
//! # Example
//!
//! ```
//! use nlfas::testing::diffusion_hierarchy;
//! use nlfas::{Coefficient, FasConfig, LevelOperator};
//! use ndarray::Array1;
//!
//! // three 2:1 coarsened grids, exponential coefficient
//! let mut fas = diffusion_hierarchy(
//!     &[32, 16, 8],
//!     Coefficient::exponential(0.5),
//!     FasConfig::default(),
//! );
//!
//! let n = fas.level(0).operator().layout().total();
//! let rhs = Array1::from_elem(n, 0.01);
//! let mut sol = Array1::zeros(n);
//! let state = fas.solve(&rhs, &mut sol);
//! assert!(state.converged);
//! ```

pub mod coefficient;
pub mod dense;
pub mod error;
pub mod fas;
pub mod level;
pub mod nonlinear;
pub mod testing;
pub mod traits;

// Re-export the solver entry points
pub use fas::{CycleType, FasConfig, FasSolver};
pub use level::{EvalMode, LevelSolver, StepOrigin};
pub use nonlinear::{
    solve_nonlinear, Linearization, NonlinearConfig, NonlinearScheme, NonlinearState,
};

// Re-export the model and error types
pub use coefficient::{Coefficient, MAX_COEFFICIENT, MIN_COEFFICIENT};
pub use error::SolverError;

// Re-export the backend traits
pub use traits::{BlockLayout, ElementView, LevelOperator, LevelTransfer, Reduction, SerialReduction};
