//! Level-local nonlinear solver
//!
//! A [`LevelSolver`] owns one level's [`LevelOperator`] together with the
//! coefficient caches derived from the current iterate, and advances the
//! iterate with a Picard or Newton step followed by two backtracking
//! safeguards: a clamp on the piecewise-constant potential change and an
//! iterative step-halving loop with a stall rule.
//!
//! The same type serves as the relaxation inside a
//! [`FasSolver`](crate::fas::FasSolver) cycle and as a standalone single-level
//! solver.

use crate::coefficient::Coefficient;
use crate::error::SolverError;
use crate::nonlinear::{
    solve_nonlinear, Linearization, NonlinearConfig, NonlinearScheme, NonlinearState,
};
use crate::traits::{BlockLayout, LevelOperator, Reduction};
use ndarray::{s, Array1, Array2};

// Halving stops once it fails to shave at least 10% off the residual.
const STALL_FRACTION: f64 = 0.9;

/// Where the level solver takes its coefficient from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Coefficient evaluated from the piecewise-constant projection of the
    /// current iterate
    #[default]
    Projected,
    /// Coefficient re-derived exactly from the iterate by the operator
    /// ([`LevelOperator::rescale_exact`]), then applied as rescaled
    Exact,
}

/// Origin of a step handed to backtracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOrigin {
    /// Direct Picard/Newton step at this level
    Direct,
    /// Correction interpolated from a coarser level; the potential-change
    /// clamp does not apply
    Interpolated,
}

/// Nonlinear solver for one level of the hierarchy
pub struct LevelSolver<O, R> {
    level: usize,
    op: O,
    model: Coefficient,
    eval: EvalMode,
    elevation: Option<Array1<f64>>,
    config: NonlinearConfig,
    reduce: R,
    layout: BlockLayout,
    /// Externally requested linear tolerance, seeding the next solve
    requested_tol: Option<f64>,
    /// Piecewise-constant potential at the last coefficient evaluation
    p: Array1<f64>,
    /// Coefficient at `p`
    kp: Array1<f64>,
    /// Derivative of the inverse coefficient at `p`
    dkinv_dp: Array1<f64>,
    /// Newton linearization blocks, one per element
    blocks: Vec<Array2<f64>>,
    state: NonlinearState,
}

impl<O: LevelOperator, R: Reduction> LevelSolver<O, R> {
    /// Build a solver for `level` around its operator
    pub fn new(
        level: usize,
        op: O,
        model: Coefficient,
        config: NonlinearConfig,
        reduce: R,
    ) -> Result<Self, SolverError> {
        Self::with_elevation(level, op, model, None, config, reduce)
    }

    /// Build a solver with a per-element elevation vector for
    /// elevation-dependent models
    pub fn with_elevation(
        level: usize,
        op: O,
        model: Coefficient,
        elevation: Option<Array1<f64>>,
        config: NonlinearConfig,
        reduce: R,
    ) -> Result<Self, SolverError> {
        config.validate()?;
        model.validate()?;

        let layout = op.layout();
        let num_elements = op.num_elements();
        if let Some(z) = &elevation {
            if z.len() != num_elements {
                return Err(SolverError::ElevationSize {
                    level,
                    expected: num_elements,
                    actual: z.len(),
                });
            }
        }

        let blocks = (0..num_elements)
            .map(|e| {
                let view = op.element(e);
                Array2::zeros((view.flux_dofs.len(), view.potential_dofs.len()))
            })
            .collect();

        Ok(Self {
            level,
            op,
            model,
            eval: EvalMode::default(),
            elevation,
            config,
            reduce,
            layout,
            requested_tol: None,
            p: Array1::zeros(num_elements),
            kp: Array1::ones(num_elements),
            dkinv_dp: Array1::zeros(num_elements),
            blocks,
            state: NonlinearState::default(),
        })
    }

    /// Switch the coefficient evaluation mode
    pub fn with_eval_mode(mut self, eval: EvalMode) -> Self {
        self.eval = eval;
        self
    }

    /// Level index this solver relaxes
    pub fn level(&self) -> usize {
        self.level
    }

    /// Configured linearization strategy
    pub fn linearization(&self) -> Linearization {
        self.config.linearization
    }

    /// State of the most recent solve
    pub fn state(&self) -> &NonlinearState {
        &self.state
    }

    /// Borrow the level operator
    pub fn operator(&self) -> &O {
        &self.op
    }

    /// Forward a relative-tolerance request to the level operator and seed
    /// the next solve's initial linear tolerance with it; the adaptive
    /// forcing term takes over from the second iteration
    pub fn request_linear_tol(&mut self, tol: f64) {
        self.requested_tol = Some(tol);
        self.op.set_linear_tol(tol);
    }

    /// Run the nonlinear iteration at this level, mutating `sol`
    pub fn solve(&mut self, rhs: &Array1<f64>, sol: &mut Array1<f64>) -> NonlinearState {
        debug_assert_eq!(rhs.len(), self.layout.total());
        debug_assert_eq!(sol.len(), self.layout.total());
        let mut config = self.config.clone();
        if let Some(tol) = self.requested_tol.take() {
            config.init_linear_tol = tol;
        }
        let state = solve_nonlinear(self, rhs, sol, &config);
        self.state = state.clone();
        state
    }

    /// Apply the nonlinear operator at `x` with the coefficient freshly
    /// evaluated there
    pub fn apply(&mut self, x: &Array1<f64>) -> Array1<f64> {
        match self.eval {
            EvalMode::Projected => {
                self.eval_coefficient(x);
                self.op.apply(&self.kp, x)
            }
            EvalMode::Exact => {
                let pot = x.slice(s![self.layout.potential_range()]);
                self.op.rescale_exact(pot, &self.model);
                self.op.apply_current(x)
            }
        }
    }

    /// `A(κ(sol); sol) − rhs` with essential rows zeroed
    pub fn residual(&mut self, sol: &Array1<f64>, rhs: &Array1<f64>) -> Array1<f64> {
        let mut r = self.apply(sol);
        r -= rhs;
        self.zero_essential(&mut r);
        r
    }

    /// Refresh the coefficient caches from the iterate's potential block
    fn eval_coefficient(&mut self, x: &Array1<f64>) {
        let pot = x.slice(s![self.layout.potential_range()]);
        self.p = self.op.pwc_project(pot);
        self.model.eval(&self.p, self.elevation.as_ref(), &mut self.kp);
    }

    fn zero_essential(&self, r: &mut Array1<f64>) {
        for (i, &is_essential) in self.op.essential_dofs().iter().enumerate() {
            if is_essential {
                r[i] = 0.0;
            }
        }
    }

    /// Reduction norm of the independent representation of `r`
    pub(crate) fn free_norm(&self, r: &Array1<f64>) -> f64 {
        self.reduce.norm(&self.op.assemble_true(r))
    }

    fn picard_step(&mut self, rhs: &Array1<f64>, x: &mut Array1<f64>, state: &mut NonlinearState) {
        let prev_resid_norm = self.residual_norm(x, rhs);
        state.prev_resid_norm = prev_resid_norm;

        match self.eval {
            EvalMode::Projected => self.op.rescale(&self.kp),
            EvalMode::Exact => {
                let pot = x.slice(s![self.layout.potential_range()]);
                self.op.rescale_exact(pot, &self.model);
            }
        }

        let x_old = x.clone();
        self.op.solve_with_guess(rhs, x);
        let mut dx = &x_old - &*x;

        self.backtrack(rhs, prev_resid_norm, x, &mut dx, StepOrigin::Direct, state);
    }

    fn newton_step(&mut self, rhs: &Array1<f64>, x: &mut Array1<f64>, state: &mut NonlinearState) {
        self.eval_coefficient(x);
        let resid = self.residual(x, rhs);
        let prev_resid_norm = self.free_norm(&resid);
        state.prev_resid_norm = prev_resid_norm;

        self.model
            .eval_dkinv(&self.p, self.elevation.as_ref(), &mut self.dkinv_dp);
        self.build_jacobian_blocks(x);
        self.op.update_jacobian(&self.kp, &self.blocks);

        let mut dx = self.op.solve(&resid);
        *x -= &dx;

        self.backtrack(rhs, prev_resid_norm, x, &mut dx, StepOrigin::Direct, state);
    }

    /// `dM/dp` blocks: per element, `(mass · σ_local) ⊗ (dκ⁻¹/dp · pwc weights)`
    fn build_jacobian_blocks(&mut self, x: &Array1<f64>) {
        let flux = x.slice(s![self.layout.flux_range()]);
        for e in 0..self.op.num_elements() {
            let view = self.op.element(e);
            let sigma: Array1<f64> = view.flux_dofs.iter().map(|&d| flux[d]).collect();
            let msigma = view.mass.dot(&sigma);
            let scale = self.dkinv_dp[e];
            let block = &mut self.blocks[e];
            for (i, &mi) in msigma.iter().enumerate() {
                for (j, &wj) in view.pwc_weights.iter().enumerate() {
                    block[[i, j]] = mi * scale * wj;
                }
            }
        }
    }

    /// Safeguard an accepted step. `dx` must equal `x_old − x` on entry; the
    /// invariant is preserved while the net step shrinks.
    ///
    /// The potential-change clamp applies to [`StepOrigin::Direct`] steps
    /// only; halving applies to both and stops early when it fails to shave
    /// at least 10% off the residual, undoing the unhelpful halving.
    pub(crate) fn backtrack(
        &mut self,
        rhs: &Array1<f64>,
        prev_resid_norm: f64,
        x: &mut Array1<f64>,
        dx: &mut Array1<f64>,
        origin: StepOrigin,
        state: &mut NonlinearState,
    ) {
        if origin == StepOrigin::Direct {
            if let Some(diff_tol) = self.config.diff_tol {
                let dp = self
                    .op
                    .pwc_project(dx.slice(s![self.layout.potential_range()]));
                let max_change = self.reduce.abs_max(&dp);
                let ratio = max_change / diff_tol;
                if ratio > 1.0 {
                    dx.mapv_inplace(|v| v / ratio);
                    x.scaled_add(ratio - 1.0, dx);
                }
            }
        }

        if self.config.num_backtrack == 0 {
            return;
        }

        state.resid_norm = self.residual_norm(x, rhs);
        let mut halvings = 0;
        while halvings < self.config.num_backtrack && state.resid_norm > prev_resid_norm {
            let before = state.resid_norm;
            dx.mapv_inplace(|v| 0.5 * v);
            *x += &*dx;
            state.resid_norm = self.residual_norm(x, rhs);

            if self.config.print_level > 1 {
                log::info!(
                    "level {} backtracking {}: resid {:.6e} -> {:.6e}",
                    self.level,
                    halvings,
                    before,
                    state.resid_norm
                );
            }

            if state.resid_norm > STALL_FRACTION * before {
                *x -= &*dx;
                state.resid_norm = before;
                break;
            }
            halvings += 1;
        }
    }
}

impl<O: LevelOperator, R: Reduction> NonlinearScheme for LevelSolver<O, R> {
    fn residual_norm(&mut self, sol: &Array1<f64>, rhs: &Array1<f64>) -> f64 {
        let r = self.residual(sol, rhs);
        self.free_norm(&r)
    }

    fn iteration_step(
        &mut self,
        rhs: &Array1<f64>,
        sol: &mut Array1<f64>,
        state: &mut NonlinearState,
    ) {
        if self.config.max_iterations > 1 {
            self.op.set_linear_tol(state.linear_tol);
        }
        match self.config.linearization {
            Linearization::Picard => self.picard_step(rhs, sol, state),
            Linearization::Newton => self.newton_step(rhs, sol, state),
        }
    }

    fn name(&self) -> &str {
        match self.config.linearization {
            Linearization::Picard => "Picard",
            Linearization::Newton => "Newton",
        }
    }
}
