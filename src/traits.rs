//! Core traits for the multilevel solver framework
//!
//! The solver core consumes three external capabilities through traits:
//!
//! - [`LevelOperator`]: the linearized per-level operator produced by the
//!   hierarchy/discretization subsystem (application, linear solves, coefficient
//!   rescaling, Jacobian updates, projections, dof bookkeeping)
//! - [`LevelTransfer`]: restriction, interpolation, and nonlinear projection
//!   between adjacent levels
//! - [`Reduction`]: global norm and max reductions over independent vectors,
//!   injected explicitly so the core runs deterministically in a single process
//!
//! How the operator is assembled or solved internally, and how the transfer
//! operators are constructed, is entirely the implementor's concern.

use crate::coefficient::Coefficient;
use ndarray::{Array1, Array2, ArrayView1};
use std::ops::Range;

/// Block structure of a level vector: flux dofs first, potential dofs second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Number of flux degrees of freedom
    pub flux: usize,
    /// Number of potential degrees of freedom
    pub potential: usize,
}

impl BlockLayout {
    /// Total degrees of freedom at this level
    pub fn total(&self) -> usize {
        self.flux + self.potential
    }

    /// Index range of the flux block
    pub fn flux_range(&self) -> Range<usize> {
        0..self.flux
    }

    /// Index range of the potential block
    pub fn potential_range(&self) -> Range<usize> {
        self.flux..self.total()
    }
}

/// Element-local data used to assemble Newton linearization blocks.
///
/// One view per element: the flux dofs it touches, the potential dofs it
/// couples to, its local mass matrix over those flux dofs, and the
/// piecewise-constant projection weights of its potential dofs.
#[derive(Debug)]
pub struct ElementView<'a> {
    /// Global flux dof indices (local block rows)
    pub flux_dofs: &'a [usize],
    /// Global potential dof indices (local block columns)
    pub potential_dofs: &'a [usize],
    /// Element mass matrix, `flux_dofs.len()` square
    pub mass: &'a Array2<f64>,
    /// Projection weights onto this element's piecewise-constant value,
    /// one per entry of `potential_dofs`
    pub pwc_weights: &'a [f64],
}

/// Per-level capabilities required from the hierarchy/discretization subsystem.
///
/// One instance represents one level. Vectors follow the level's
/// [`BlockLayout`]. `rescale`, `update_jacobian`, and `set_linear_tol`
/// configure the state used by subsequent [`solve`](LevelOperator::solve)
/// calls; `rescale` discards any previously installed Jacobian blocks.
pub trait LevelOperator {
    /// Block layout of vectors at this level
    fn layout(&self) -> BlockLayout;

    /// Number of elements (piecewise-constant unknowns)
    fn num_elements(&self) -> usize;

    /// Element-local data for Jacobian-block assembly
    fn element(&self, index: usize) -> ElementView<'_>;

    /// Apply the operator re-weighted by the per-element coefficient:
    /// `A(coeff; x)`
    fn apply(&self, coeff: &Array1<f64>, x: &Array1<f64>) -> Array1<f64>;

    /// Apply the operator with its most recently installed weighting, set by
    /// [`rescale`](LevelOperator::rescale) or
    /// [`rescale_exact`](LevelOperator::rescale_exact); Jacobian blocks do
    /// not enter
    fn apply_current(&self, x: &Array1<f64>) -> Array1<f64>;

    /// Solve the current linearized system
    fn solve(&mut self, rhs: &Array1<f64>) -> Array1<f64>;

    /// Solve the current linearized system using `x` as the initial guess,
    /// overwriting it with the solution
    fn solve_with_guess(&mut self, rhs: &Array1<f64>, x: &mut Array1<f64>);

    /// Fix the per-element coefficient used by subsequent solves
    fn rescale(&mut self, coeff: &Array1<f64>);

    /// Re-derive the operator weighting exactly from the current iterate's
    /// potential block through a coefficient model
    fn rescale_exact(&mut self, potential: ArrayView1<'_, f64>, model: &Coefficient);

    /// Install Newton linearization blocks (one per element, shaped by
    /// [`element`](LevelOperator::element)) for subsequent solves
    fn update_jacobian(&mut self, coeff: &Array1<f64>, blocks: &[Array2<f64>]);

    /// Relative-tolerance request for subsequent solves
    fn set_linear_tol(&mut self, tol: f64);

    /// Project a potential-block vector to one scalar per element
    fn pwc_project(&self, potential: ArrayView1<'_, f64>) -> Array1<f64>;

    /// Mask of fixed-value dofs over the full layout; these rows are excluded
    /// from residuals and corrections
    fn essential_dofs(&self) -> &[bool];

    /// Collapse a possibly duplicated distributed vector to its independent
    /// representation, required before any [`Reduction`] call
    fn assemble_true(&self, x: &Array1<f64>) -> Array1<f64>;
}

/// Transfer operators between adjacent levels.
///
/// `level` always names the source level: `restrict` and `project` map
/// `level → level + 1`, `interpolate` maps `level → level - 1`.
/// `project` differs from `restrict` in that it nonlinearly maps the current
/// iterate rather than a residual-like quantity.
pub trait LevelTransfer {
    /// Restrict a residual-like vector one level coarser
    fn restrict(&self, level: usize, fine: &Array1<f64>) -> Array1<f64>;

    /// Interpolate a correction one level finer
    fn interpolate(&self, level: usize, coarse: &Array1<f64>) -> Array1<f64>;

    /// Nonlinearly project the current iterate one level coarser
    fn project(&self, level: usize, fine: &Array1<f64>) -> Array1<f64>;
}

/// Global reductions over independent (true-dof) vectors.
///
/// Implementations must be deterministic and order-consistent across repeated
/// calls; convergence decisions are made from these values.
pub trait Reduction {
    /// Global l2 norm
    fn norm(&self, x: &Array1<f64>) -> f64;

    /// Global maximum absolute entry (0 for an empty vector)
    fn abs_max(&self, x: &Array1<f64>) -> f64;
}

/// Single-process reduction: plain serial norm and max.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialReduction;

impl Reduction for SerialReduction {
    fn norm(&self, x: &Array1<f64>) -> f64 {
        x.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    fn abs_max(&self, x: &Array1<f64>) -> f64 {
        x.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}
