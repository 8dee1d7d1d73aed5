//! End-to-end convergence tests for the level and FAS solvers
//!
//! These exercise the real fixtures: the 1D mixed diffusion operator with
//! exponential and Haverkamp coefficients, identity hierarchies, and 2:1
//! coarsened hierarchies. Manufactured right-hand sides pin the expected
//! solutions.

use approx::assert_relative_eq;
use ndarray::Array1;
use nlfas::testing::{diffusion_hierarchy, identity_hierarchy, MixedDiffusion1d};
use nlfas::traits::{LevelOperator, SerialReduction};
use nlfas::{
    Coefficient, CycleType, EvalMode, FasConfig, LevelSolver, Linearization, NonlinearConfig,
    NonlinearScheme,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Single-level solver over a fresh fixture grid
fn level_solver(
    num_cells: usize,
    model: Coefficient,
    config: NonlinearConfig,
) -> LevelSolver<MixedDiffusion1d, SerialReduction> {
    LevelSolver::new(
        0,
        MixedDiffusion1d::new(num_cells),
        model,
        config,
        SerialReduction,
    )
    .expect("solver construction should succeed")
}

/// A smooth iterate with moderate magnitudes
fn smooth_iterate(n: usize) -> Array1<f64> {
    Array1::from_shape_fn(n, |i| 0.3 * (0.4 * i as f64).sin())
}

/// Right-hand side whose exact solution is `target`
fn manufactured_rhs(num_cells: usize, model: Coefficient, target: &Array1<f64>) -> Array1<f64> {
    let mut scratch = level_solver(num_cells, model, NonlinearConfig::default());
    scratch.apply(target)
}

#[test]
fn test_picard_converges_to_manufactured_solution() {
    let model = Coefficient::exponential(0.5);
    let config = NonlinearConfig {
        linearization: Linearization::Picard,
        num_backtrack: 4,
        ..Default::default()
    };
    let mut lv = level_solver(16, model, config);
    let n = lv.operator().layout().total();

    let target = smooth_iterate(n);
    let rhs = manufactured_rhs(16, model, &target);
    let mut sol = Array1::zeros(n);
    let state = lv.solve(&rhs, &mut sol);

    assert!(state.converged, "Picard should converge");
    assert!(state.relative_residual() < 1e-8);
    for i in 0..n {
        assert_relative_eq!(sol[i], target[i], epsilon = 1e-5, max_relative = 1e-4);
    }
}

#[test]
fn test_newton_converges_in_fewer_iterations_than_picard() {
    let model = Coefficient::exponential(1.5);
    let newton_config = NonlinearConfig {
        num_backtrack: 4,
        ..Default::default()
    };
    let picard_config = NonlinearConfig {
        linearization: Linearization::Picard,
        num_backtrack: 4,
        ..Default::default()
    };

    let mut newton = level_solver(16, model, newton_config);
    let mut picard = level_solver(16, model, picard_config);
    let n = newton.operator().layout().total();
    let rhs = manufactured_rhs(16, model, &smooth_iterate(n));

    let mut sol_n = Array1::zeros(n);
    let state_n = newton.solve(&rhs, &mut sol_n);
    let mut sol_p = Array1::zeros(n);
    let state_p = picard.solve(&rhs, &mut sol_p);

    assert!(state_n.converged, "Newton should converge");
    assert!(state_p.converged, "Picard should converge");
    assert!(
        state_n.iterations <= state_p.iterations,
        "Newton took {} iterations, Picard {}",
        state_n.iterations,
        state_p.iterations
    );
    for i in 0..n {
        assert_relative_eq!(sol_n[i], sol_p[i], epsilon = 1e-5, max_relative = 1e-4);
    }
}

/// A constant coefficient makes the problem linear: the first step solves it
/// from any starting point.
#[test]
fn test_linear_problem_converges_in_one_iteration() {
    for linearization in [Linearization::Picard, Linearization::Newton] {
        let config = NonlinearConfig {
            linearization,
            ..Default::default()
        };
        let mut lv = level_solver(12, Coefficient::exponential(0.0), config);
        let n = lv.operator().layout().total();
        let rhs = Array1::from_elem(n, 0.1);

        for guess in [Array1::zeros(n), smooth_iterate(n)] {
            let mut sol = guess;
            let state = lv.solve(&rhs, &mut sol);
            assert!(state.converged);
            assert_eq!(
                state.iterations, 1,
                "{linearization:?} should solve a linear problem in one step"
            );
        }
    }
}

/// With identity transfers and no coarse relaxation budget, the FMG cycle
/// degenerates to exactly the single-level step and the trajectories match
/// bit for bit.
#[test]
fn test_fmg_without_coarse_relaxation_matches_single_level() {
    let model = Coefficient::exponential(0.8);
    let config = FasConfig {
        cycle: CycleType::Fmg,
        coarse: NonlinearConfig::relaxation(0),
        ..Default::default()
    };
    let mut fas = identity_hierarchy(12, 2, model, config);
    let n = fas.level(0).operator().layout().total();
    let rhs = Array1::from_elem(n, 0.05);

    let mut sol_fas = Array1::zeros(n);
    let fas_state = fas.solve(&rhs, &mut sol_fas);

    let mut lv = level_solver(12, model, NonlinearConfig::default());
    let mut sol_lv = Array1::zeros(n);
    let lv_state = lv.solve(&rhs, &mut sol_lv);

    assert!(fas_state.converged && lv_state.converged);
    assert_eq!(fas_state.iterations, lv_state.iterations);
    assert_eq!(sol_fas, sol_lv);
}

/// A V-cycle with an idle coarse level is two smoothing steps per outer
/// iteration: same solution, at most as many outer iterations.
#[test]
fn test_vcycle_without_coarse_relaxation_double_smooths() {
    let model = Coefficient::exponential(0.8);
    let config = FasConfig {
        coarse: NonlinearConfig::relaxation(0),
        ..Default::default()
    };
    let mut fas = identity_hierarchy(12, 2, model, config);
    let n = fas.level(0).operator().layout().total();
    let rhs = Array1::from_elem(n, 0.05);

    let mut sol_fas = Array1::zeros(n);
    let fas_state = fas.solve(&rhs, &mut sol_fas);

    let mut lv = level_solver(12, model, NonlinearConfig::default());
    let mut sol_lv = Array1::zeros(n);
    let lv_state = lv.solve(&rhs, &mut sol_lv);

    assert!(fas_state.converged && lv_state.converged);
    assert!(fas_state.iterations <= lv_state.iterations);
    for i in 0..n {
        assert_relative_eq!(sol_fas[i], sol_lv[i], epsilon = 1e-4);
    }
}

/// A one-level hierarchy is just the level solver with extra bookkeeping.
#[test]
fn test_single_level_hierarchy_matches_level_solver() {
    let model = Coefficient::exponential(1.0);
    let mut fas = identity_hierarchy(16, 1, model, FasConfig::default());
    let n = fas.level(0).operator().layout().total();
    let rhs = Array1::from_elem(n, 0.04);

    let mut sol_fas = Array1::zeros(n);
    let fas_state = fas.solve(&rhs, &mut sol_fas);

    let mut lv = level_solver(16, model, NonlinearConfig::default());
    let mut sol_lv = Array1::zeros(n);
    let lv_state = lv.solve(&rhs, &mut sol_lv);

    assert!(fas_state.converged && lv_state.converged);
    assert_eq!(fas_state.iterations, lv_state.iterations);
    assert_eq!(sol_fas, sol_lv);
}

#[test]
fn test_three_level_vcycle_converges_to_manufactured_solution() {
    let model = Coefficient::exponential(1.0);
    let backtracking_smoother = NonlinearConfig {
        num_backtrack: 4,
        ..NonlinearConfig::relaxation(1)
    };
    let config = FasConfig {
        fine: backtracking_smoother.clone(),
        mid: backtracking_smoother,
        ..Default::default()
    };

    let mut fas = diffusion_hierarchy(&[32, 16, 8], model, config);
    let n = fas.level(0).operator().layout().total();
    let target = smooth_iterate(n);
    let rhs = manufactured_rhs(32, model, &target);

    let mut sol = Array1::zeros(n);
    let state = fas.solve(&rhs, &mut sol);

    assert!(state.converged, "three-level V-cycle should converge");
    assert!(state.relative_residual() < 1e-8);
    for i in 0..n {
        assert_relative_eq!(sol[i], target[i], epsilon = 1e-3);
    }

    // defect norms were recorded on every non-terminal level
    let defects = fas.defect_norms();
    assert!(defects[0] > 0.0);
    assert!(defects[1] > 0.0);
    assert_eq!(defects[2], 0.0);
}

#[test]
fn test_three_level_fmg_converges_from_random_guess() {
    let model = Coefficient::exponential(1.0);
    let backtracking_smoother = NonlinearConfig {
        num_backtrack: 4,
        ..NonlinearConfig::relaxation(1)
    };
    let config = FasConfig {
        cycle: CycleType::Fmg,
        fine: backtracking_smoother.clone(),
        mid: backtracking_smoother,
        ..Default::default()
    };

    let mut fas = diffusion_hierarchy(&[32, 16, 8], model, config);
    let n = fas.level(0).operator().layout().total();
    let rhs = manufactured_rhs(32, model, &smooth_iterate(n));

    let mut rng = StdRng::seed_from_u64(42);
    let mut sol = Array1::from_shape_fn(n, |_| rng.gen_range(-0.1..0.1));
    let state = fas.solve(&rhs, &mut sol);

    assert!(state.converged, "FMG cycles should converge");
    assert!(state.relative_residual() < 1e-8);
}

/// The fixture's potential space is piecewise constant already, so exact
/// coefficient evaluation and projected evaluation are the same arithmetic.
#[test]
fn test_exact_evaluation_matches_projected_on_p0_fixture() {
    let model = Coefficient::exponential(0.9);
    let config = NonlinearConfig {
        linearization: Linearization::Picard,
        ..Default::default()
    };

    let mut projected = level_solver(10, model, config.clone());
    let mut exact = LevelSolver::new(
        0,
        MixedDiffusion1d::new(10),
        model,
        config,
        SerialReduction,
    )
    .expect("solver construction should succeed")
    .with_eval_mode(EvalMode::Exact);

    let n = projected.operator().layout().total();
    let rhs = Array1::from_elem(n, 0.06);

    let mut sol_p = Array1::zeros(n);
    let state_p = projected.solve(&rhs, &mut sol_p);
    let mut sol_e = Array1::zeros(n);
    let state_e = exact.solve(&rhs, &mut sol_e);

    assert!(state_p.converged && state_e.converged);
    assert_eq!(state_p.iterations, state_e.iterations);
    assert_eq!(sol_p, sol_e);
}

/// Each accepted step's post-backtracking residual stays at or below its
/// pre-step residual, and the sequence decreases across solves.
#[test]
fn test_backtracking_keeps_residuals_monotone() {
    let config = NonlinearConfig {
        linearization: Linearization::Picard,
        num_backtrack: 8,
        max_iterations: 1,
        check_converge: false,
        ..Default::default()
    };
    let mut lv = level_solver(16, Coefficient::exponential(1.2), config);
    let n = lv.operator().layout().total();
    let rhs = Array1::from_elem(n, 0.08);

    let mut sol = Array1::zeros(n);
    let mut last = f64::INFINITY;
    for _ in 0..6 {
        let state = lv.solve(&rhs, &mut sol);
        assert!(
            state.resid_norm <= state.prev_resid_norm * (1.0 + 1e-12),
            "post-step residual {} exceeds pre-step residual {}",
            state.resid_norm,
            state.prev_resid_norm
        );
        assert!(state.resid_norm <= last * (1.0 + 1e-12));
        last = state.resid_norm;
    }
}

#[test]
fn test_essential_dofs_are_masked_and_enforced() {
    let op = MixedDiffusion1d::with_essential(6, &[0]);
    let config = NonlinearConfig {
        linearization: Linearization::Picard,
        ..Default::default()
    };
    let mut lv = LevelSolver::new(0, op, Coefficient::exponential(0.4), config, SerialReduction)
        .expect("solver construction should succeed");
    let n = lv.operator().layout().total();

    // a residual living only on the essential row measures zero
    let mut forcing_on_essential = Array1::zeros(n);
    forcing_on_essential[0] = 1.0;
    assert_eq!(lv.residual_norm(&Array1::zeros(n), &forcing_on_essential), 0.0);

    // the fixed value still travels through the linearized solves
    let mut rhs = Array1::from_elem(n, 0.02);
    rhs[0] = 0.7;
    let mut sol = Array1::zeros(n);
    let state = lv.solve(&rhs, &mut sol);
    assert!(state.converged);
    assert_relative_eq!(sol[0], 0.7, epsilon = 1e-12);
}

#[test]
fn test_haverkamp_with_elevation_converges() {
    let cells = 8;
    let model = Coefficient::haverkamp(1.0, 2.0, 2.0);
    let elevation = Array1::from_shape_fn(cells, |e| (e as f64 + 0.5) / cells as f64);
    let config = NonlinearConfig {
        num_backtrack: 4,
        diff_tol: Some(1.0),
        ..Default::default()
    };
    let mut lv = LevelSolver::with_elevation(
        0,
        MixedDiffusion1d::new(cells),
        model,
        Some(elevation),
        config,
        SerialReduction,
    )
    .expect("solver construction should succeed");

    let n = lv.operator().layout().total();
    let rhs = Array1::from_elem(n, 0.05);
    let mut sol = Array1::zeros(n);
    let state = lv.solve(&rhs, &mut sol);

    assert!(state.converged, "Newton with elevation should converge");
}

/// A stiff sensitivity never panics or produces non-finite state; the clamp
/// and the backtracking safeguards absorb it.
#[test]
fn test_stiff_coefficient_stays_finite() {
    let config = NonlinearConfig {
        linearization: Linearization::Picard,
        num_backtrack: 8,
        diff_tol: Some(0.5),
        max_iterations: 40,
        check_converge: false,
        ..Default::default()
    };
    let mut lv = level_solver(8, Coefficient::exponential(6.0), config);
    let n = lv.operator().layout().total();
    let rhs = Array1::from_elem(n, 0.5);

    let mut sol = Array1::zeros(n);
    let state = lv.solve(&rhs, &mut sol);

    assert!(state.resid_norm.is_finite());
    assert!(sol.iter().all(|v| v.is_finite()));
    assert!(state.iterations <= 40);
}

/// Relaxations below the finest level see the outer tolerance scaled by the
/// linearization-specific ratio, floored at `min_linear_tol`.
#[test]
fn test_smoothing_tolerance_forwarding() {
    let config = FasConfig {
        coarse: NonlinearConfig::relaxation(1),
        outer: NonlinearConfig {
            max_iterations: 1,
            check_converge: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut fas = identity_hierarchy(8, 2, Coefficient::exponential(0.5), config);
    let n = fas.level(0).operator().layout().total();
    let rhs = Array1::from_elem(n, 0.05);
    let mut sol = Array1::zeros(n);
    fas.solve(&rhs, &mut sol);

    // finest level gets the outer tolerance (first cycle: init_linear_tol);
    // the Newton-coarse request 1e-4 * 1e-6 hits the 1e-8 floor
    assert_eq!(fas.level(0).operator().linear_tol(), 1e-4);
    assert_eq!(fas.level(1).operator().linear_tol(), 1e-8);
}
