//! Full approximation scheme (FAS) nonlinear multigrid
//!
//! [`FasSolver`] drives a hierarchy of [`LevelSolver`]s as one outer
//! inexact-Newton iteration whose step is a multigrid cycle. Unlike linear
//! multigrid, FAS restricts the full iterate alongside the defect, so each
//! coarse level solves a genuinely nonlinear problem whose right-hand side
//! carries the fine-level defect.

use crate::coefficient::Coefficient;
use crate::error::SolverError;
use crate::level::{LevelSolver, StepOrigin};
use crate::nonlinear::{
    solve_nonlinear, Linearization, NonlinearConfig, NonlinearScheme, NonlinearState,
};
use crate::traits::{LevelOperator, LevelTransfer, Reduction};
use ndarray::Array1;

// Linear-tolerance scaling for relaxations below the finest level.
const NEWTON_SMOOTH_RATIO: f64 = 1e-6;
const PICARD_SMOOTH_RATIO: f64 = 1e-2;

/// Cycle shape of one FAS sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleType {
    /// Pre-smooth, coarse correction, post-smooth
    #[default]
    VCycle,
    /// Coarse correction then post-smooth only
    Fmg,
}

/// Configuration for [`FasSolver`]
///
/// The outer iteration controls live in `outer`; `fine`, `mid` and `coarse`
/// configure the relaxation on the finest level, the intermediate levels and
/// the coarsest level respectively.
#[derive(Debug, Clone)]
pub struct FasConfig {
    pub cycle: CycleType,
    /// Relative defect threshold below which a level skips its coarse
    /// correction; `0.0` disables the skip
    pub coarse_correct_tol: f64,
    pub outer: NonlinearConfig,
    pub fine: NonlinearConfig,
    pub mid: NonlinearConfig,
    pub coarse: NonlinearConfig,
}

impl Default for FasConfig {
    fn default() -> Self {
        Self {
            cycle: CycleType::default(),
            coarse_correct_tol: 0.0,
            outer: NonlinearConfig::default(),
            fine: NonlinearConfig::relaxation(1),
            mid: NonlinearConfig::relaxation(1),
            coarse: NonlinearConfig::relaxation(20),
        }
    }
}

/// Nonlinear multigrid solver over a hierarchy of level operators
///
/// Level 0 is the finest. The hierarchy depth is the number of operators
/// handed to [`FasSolver::new`].
pub struct FasSolver<O, T, R> {
    levels: Vec<LevelSolver<O, R>>,
    transfer: T,
    config: FasConfig,
    state: NonlinearState,
    /// Per-level right-hand sides; `rhs[0]` mirrors the caller's vector
    rhs: Vec<Array1<f64>>,
    /// Per-level iterates
    sol: Vec<Array1<f64>>,
    /// Per-level scratch for restricted defects and interpolated corrections
    help: Vec<Array1<f64>>,
    /// Per-level snapshot of the projected iterate around the recursion
    snap: Vec<Array1<f64>>,
    /// Defect norm recorded per level during the most recent cycle
    defect_norms: Vec<f64>,
}

impl<O, T, R> FasSolver<O, T, R>
where
    O: LevelOperator,
    T: LevelTransfer,
    R: Reduction + Clone,
{
    /// Build a FAS solver from level operators ordered finest first
    pub fn new(
        ops: Vec<O>,
        model: Coefficient,
        transfer: T,
        reduce: R,
        config: FasConfig,
    ) -> Result<Self, SolverError> {
        let elevations = ops.iter().map(|_| None).collect();
        Self::with_elevations(ops, model, elevations, transfer, reduce, config)
    }

    /// Build a FAS solver with one optional elevation vector per level
    pub fn with_elevations(
        ops: Vec<O>,
        model: Coefficient,
        elevations: Vec<Option<Array1<f64>>>,
        transfer: T,
        reduce: R,
        config: FasConfig,
    ) -> Result<Self, SolverError> {
        if ops.is_empty() {
            return Err(SolverError::EmptyHierarchy);
        }
        if elevations.len() != ops.len() {
            return Err(SolverError::ElevationCount {
                expected: ops.len(),
                actual: elevations.len(),
            });
        }
        config.outer.validate()?;
        if !config.coarse_correct_tol.is_finite() || config.coarse_correct_tol < 0.0 {
            return Err(SolverError::InvalidTolerance {
                name: "coarse_correct_tol",
                value: config.coarse_correct_tol,
            });
        }

        let num_levels = ops.len();
        let mut levels = Vec::with_capacity(num_levels);
        for (level, (op, elevation)) in ops.into_iter().zip(elevations).enumerate() {
            let level_config = if level == 0 {
                config.fine.clone()
            } else if level + 1 == num_levels {
                config.coarse.clone()
            } else {
                config.mid.clone()
            };
            levels.push(LevelSolver::with_elevation(
                level,
                op,
                model,
                elevation,
                level_config,
                reduce.clone(),
            )?);
        }

        let mut rhs = Vec::with_capacity(num_levels);
        let mut sol = Vec::with_capacity(num_levels);
        let mut help = Vec::with_capacity(num_levels);
        let mut snap = Vec::with_capacity(num_levels);
        for lv in &levels {
            let n = lv.operator().layout().total();
            rhs.push(Array1::zeros(n));
            sol.push(Array1::zeros(n));
            help.push(Array1::zeros(n));
            snap.push(Array1::zeros(n));
        }

        // probe the transfer shapes once so cycles cannot fail midway
        for level in 0..num_levels - 1 {
            let fine_n = rhs[level].len();
            let coarse_n = rhs[level + 1].len();
            let down = transfer.restrict(level, &rhs[level]);
            if down.len() != coarse_n {
                return Err(SolverError::TransferShape {
                    level,
                    operation: "restrict",
                    expected: coarse_n,
                    actual: down.len(),
                });
            }
            let projected = transfer.project(level, &sol[level]);
            if projected.len() != coarse_n {
                return Err(SolverError::TransferShape {
                    level,
                    operation: "project",
                    expected: coarse_n,
                    actual: projected.len(),
                });
            }
            let up = transfer.interpolate(level + 1, &help[level + 1]);
            if up.len() != fine_n {
                return Err(SolverError::TransferShape {
                    level: level + 1,
                    operation: "interpolate",
                    expected: fine_n,
                    actual: up.len(),
                });
            }
        }

        let defect_norms = vec![0.0; num_levels];
        Ok(Self {
            levels,
            transfer,
            config,
            state: NonlinearState::default(),
            rhs,
            sol,
            help,
            snap,
            defect_norms,
        })
    }

    /// Number of levels in the hierarchy
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// State of the most recent solve
    pub fn state(&self) -> &NonlinearState {
        &self.state
    }

    /// Borrow one level's solver, finest first
    pub fn level(&self, level: usize) -> &LevelSolver<O, R> {
        &self.levels[level]
    }

    /// Defect norms recorded per level during the most recent cycle; the
    /// coarsest entry is never written
    pub fn defect_norms(&self) -> &[f64] {
        &self.defect_norms
    }

    /// Run the outer nonlinear iteration, mutating `sol`
    pub fn solve(&mut self, rhs: &Array1<f64>, sol: &mut Array1<f64>) -> NonlinearState {
        let config = self.config.outer.clone();
        let state = solve_nonlinear(self, rhs, sol, &config);
        self.state = state.clone();
        state
    }

    /// One FAS cycle rooted at `level`
    fn fas_cycle(&mut self, level: usize, outer_tol: f64) {
        if level + 1 == self.levels.len() {
            self.smoothing(level, outer_tol);
            return;
        }

        if self.config.cycle == CycleType::VCycle {
            self.smoothing(level, outer_tol);
        }

        let defect = self.levels[level].residual(&self.sol[level], &self.rhs[level]);
        let defect_norm = self.levels[level].free_norm(&defect);
        self.defect_norms[level] = defect_norm;

        let skip = self.config.coarse_correct_tol > 0.0 && {
            let rhs_norm = self.levels[level].free_norm(&self.rhs[level]);
            defect_norm < self.config.coarse_correct_tol * rhs_norm
        };

        if skip {
            if self.config.outer.print_level > 1 {
                log::info!(
                    "level {}: defect {:.6e} below coarse correction threshold",
                    level,
                    defect_norm
                );
            }
        } else {
            // full approximation: the coarse right-hand side carries the
            // coarse operator at the projected iterate minus the restricted
            // defect
            self.help[level + 1] = self.transfer.restrict(level, &defect);
            self.sol[level + 1] = self.transfer.project(level, &self.sol[level]);
            let mut coarse_rhs = self.levels[level + 1].apply(&self.sol[level + 1]);
            coarse_rhs -= &self.help[level + 1];
            self.rhs[level + 1] = coarse_rhs;
            self.snap[level + 1].assign(&self.sol[level + 1]);

            self.fas_cycle(level + 1, outer_tol);

            // snap now holds the correction, snapshot minus coarse solution
            self.snap[level + 1] -= &self.sol[level + 1];
            self.help[level] = self.transfer.interpolate(level + 1, &self.snap[level + 1]);
            self.sol[level] -= &self.help[level];

            // the interpolated correction doubles as the backtracking step
            let mut scratch = NonlinearState::default();
            let (levels, rhs, sol, help) =
                (&mut self.levels, &self.rhs, &mut self.sol, &mut self.help);
            levels[level].backtrack(
                &rhs[level],
                defect_norm,
                &mut sol[level],
                &mut help[level],
                StepOrigin::Interpolated,
                &mut scratch,
            );
        }

        self.smoothing(level, outer_tol);
    }

    /// Relax at `level`, forwarding a linear tolerance derived from the
    /// outer forcing term
    fn smoothing(&mut self, level: usize, outer_tol: f64) {
        let tol = if level == 0 {
            outer_tol
        } else {
            let ratio = match self.levels[level].linearization() {
                Linearization::Newton => NEWTON_SMOOTH_RATIO,
                Linearization::Picard => PICARD_SMOOTH_RATIO,
            };
            (outer_tol * ratio).max(self.config.outer.min_linear_tol)
        };
        self.levels[level].request_linear_tol(tol);

        let (levels, rhs, sol) = (&mut self.levels, &self.rhs, &mut self.sol);
        levels[level].solve(&rhs[level], &mut sol[level]);
    }
}

impl<O, T, R> NonlinearScheme for FasSolver<O, T, R>
where
    O: LevelOperator,
    T: LevelTransfer,
    R: Reduction + Clone,
{
    fn residual_norm(&mut self, sol: &Array1<f64>, rhs: &Array1<f64>) -> f64 {
        self.levels[0].residual_norm(sol, rhs)
    }

    fn iteration_step(
        &mut self,
        rhs: &Array1<f64>,
        sol: &mut Array1<f64>,
        state: &mut NonlinearState,
    ) {
        self.rhs[0].assign(rhs);
        self.sol[0].assign(sol);
        self.fas_cycle(0, state.linear_tol);
        sol.assign(&self.sol[0]);
    }

    fn name(&self) -> &str {
        "FAS"
    }
}
