//! Test fixtures: a 1D mixed-form diffusion operator and level transfers
//!
//! [`MixedDiffusion1d`] discretizes `−(κ(p)·p′)′ = f` on `[0, 1]` in first
//! order mixed form: one flux unknown per face, one potential unknown per
//! cell. The linearized systems are the saddle matrices
//!
//! ```text
//! [ M(κ⁻¹)  Bᵀ ] [σ]
//! [ B        0 ] [p]
//! ```
//!
//! solved directly with the [`dense`](crate::dense) LU. The divergence matrix
//! has full row rank and the weighted mass block is positive definite, so the
//! system is nonsingular without any essential conditions; essential dofs can
//! still be marked for masking tests. The piecewise-constant projection is the
//! identity because the potential space already is piecewise constant, which
//! makes the exact and projected coefficient evaluations coincide on this
//! fixture.
//!
//! These types exist for unit tests, integration tests, and benches, but are
//! ordinary public items so examples can build on them too.

use crate::coefficient::Coefficient;
use crate::dense;
use crate::fas::{FasConfig, FasSolver};
use crate::traits::{BlockLayout, ElementView, LevelOperator, LevelTransfer, SerialReduction};
use ndarray::{Array1, Array2, ArrayView1};

const UNIT_WEIGHT: [f64; 1] = [1.0];

/// 1D mixed-form diffusion operator on a uniform grid
pub struct MixedDiffusion1d {
    num_cells: usize,
    layout: BlockLayout,
    /// Element mass matrix over a cell's two faces, shared by every cell
    mass: Array2<f64>,
    cell_faces: Vec<[usize; 2]>,
    cell_pdofs: Vec<[usize; 1]>,
    /// Per-cell inverse coefficient installed by the rescale calls
    weights: Vec<f64>,
    newton_blocks: Option<Vec<Array2<f64>>>,
    linear_tol: f64,
    essential: Vec<bool>,
}

impl MixedDiffusion1d {
    /// Uniform grid with `num_cells` cells and `num_cells + 1` faces
    pub fn new(num_cells: usize) -> Self {
        let h = 1.0 / num_cells as f64;
        let layout = BlockLayout {
            flux: num_cells + 1,
            potential: num_cells,
        };
        Self {
            num_cells,
            layout,
            mass: ndarray::array![[1.0 / 3.0, 1.0 / 6.0], [1.0 / 6.0, 1.0 / 3.0]] * h,
            cell_faces: (0..num_cells).map(|e| [e, e + 1]).collect(),
            cell_pdofs: (0..num_cells).map(|e| [e]).collect(),
            weights: vec![1.0; num_cells],
            newton_blocks: None,
            linear_tol: 0.0,
            essential: vec![false; layout.total()],
        }
    }

    /// Same grid with the given dofs marked essential
    pub fn with_essential(num_cells: usize, dofs: &[usize]) -> Self {
        let mut op = Self::new(num_cells);
        for &d in dofs {
            op.essential[d] = true;
        }
        op
    }

    /// Linear tolerance most recently requested of this operator
    pub fn linear_tol(&self) -> f64 {
        self.linear_tol
    }

    /// Assemble the current linearized system as a dense matrix
    fn dense_matrix(&self) -> Array2<f64> {
        let n = self.layout.total();
        let nf = self.layout.flux;
        let mut a = Array2::zeros((n, n));

        for e in 0..self.num_cells {
            let [f0, f1] = self.cell_faces[e];
            let w = self.weights[e];
            for (i, &fi) in [f0, f1].iter().enumerate() {
                for (j, &fj) in [f0, f1].iter().enumerate() {
                    a[[fi, fj]] += w * self.mass[[i, j]];
                }
            }
            // divergence row and its transpose
            a[[nf + e, f0]] = -1.0;
            a[[nf + e, f1]] = 1.0;
            a[[f0, nf + e]] = -1.0;
            a[[f1, nf + e]] = 1.0;

            if let Some(blocks) = &self.newton_blocks {
                a[[f0, nf + e]] += blocks[e][[0, 0]];
                a[[f1, nf + e]] += blocks[e][[1, 0]];
            }
        }

        for (i, &is_essential) in self.essential.iter().enumerate() {
            if is_essential {
                for j in 0..n {
                    a[[i, j]] = 0.0;
                }
                a[[i, i]] = 1.0;
            }
        }
        a
    }
}

impl LevelOperator for MixedDiffusion1d {
    fn layout(&self) -> BlockLayout {
        self.layout
    }

    fn num_elements(&self) -> usize {
        self.num_cells
    }

    fn element(&self, index: usize) -> ElementView<'_> {
        ElementView {
            flux_dofs: &self.cell_faces[index],
            potential_dofs: &self.cell_pdofs[index],
            mass: &self.mass,
            pwc_weights: &UNIT_WEIGHT,
        }
    }

    fn apply(&self, coeff: &Array1<f64>, x: &Array1<f64>) -> Array1<f64> {
        let nf = self.layout.flux;
        let mut y = Array1::zeros(self.layout.total());
        for e in 0..self.num_cells {
            let [f0, f1] = self.cell_faces[e];
            let w = 1.0 / coeff[e];
            let (s0, s1) = (x[f0], x[f1]);
            let p = x[nf + e];
            y[f0] += w * (self.mass[[0, 0]] * s0 + self.mass[[0, 1]] * s1) - p;
            y[f1] += w * (self.mass[[1, 0]] * s0 + self.mass[[1, 1]] * s1) + p;
            y[nf + e] = s1 - s0;
        }
        y
    }

    fn apply_current(&self, x: &Array1<f64>) -> Array1<f64> {
        let nf = self.layout.flux;
        let mut y = Array1::zeros(self.layout.total());
        for e in 0..self.num_cells {
            let [f0, f1] = self.cell_faces[e];
            let w = self.weights[e];
            let (s0, s1) = (x[f0], x[f1]);
            let p = x[nf + e];
            y[f0] += w * (self.mass[[0, 0]] * s0 + self.mass[[0, 1]] * s1) - p;
            y[f1] += w * (self.mass[[1, 0]] * s0 + self.mass[[1, 1]] * s1) + p;
            y[nf + e] = s1 - s0;
        }
        y
    }

    fn solve(&mut self, rhs: &Array1<f64>) -> Array1<f64> {
        match dense::lu_solve(&self.dense_matrix(), rhs) {
            Ok(x) => x,
            Err(err) => {
                log::warn!("level linear solve failed: {err}");
                Array1::zeros(rhs.len())
            }
        }
    }

    fn solve_with_guess(&mut self, rhs: &Array1<f64>, x: &mut Array1<f64>) {
        // direct solver: the guess only survives a failed factorization
        match dense::lu_solve(&self.dense_matrix(), rhs) {
            Ok(sol) => x.assign(&sol),
            Err(err) => log::warn!("level linear solve failed: {err}"),
        }
    }

    fn rescale(&mut self, coeff: &Array1<f64>) {
        for (w, &c) in self.weights.iter_mut().zip(coeff.iter()) {
            *w = 1.0 / c;
        }
        self.newton_blocks = None;
    }

    fn rescale_exact(&mut self, potential: ArrayView1<'_, f64>, model: &Coefficient) {
        for (w, &p) in self.weights.iter_mut().zip(potential.iter()) {
            *w = 1.0 / model.kappa(p, 0.0);
        }
        self.newton_blocks = None;
    }

    fn update_jacobian(&mut self, coeff: &Array1<f64>, blocks: &[Array2<f64>]) {
        for (w, &c) in self.weights.iter_mut().zip(coeff.iter()) {
            *w = 1.0 / c;
        }
        self.newton_blocks = Some(blocks.to_vec());
    }

    fn set_linear_tol(&mut self, tol: f64) {
        // recorded but unused: the dense solver is exact
        self.linear_tol = tol;
    }

    fn pwc_project(&self, potential: ArrayView1<'_, f64>) -> Array1<f64> {
        potential.to_owned()
    }

    fn essential_dofs(&self) -> &[bool] {
        &self.essential
    }

    fn assemble_true(&self, x: &Array1<f64>) -> Array1<f64> {
        x.clone()
    }
}

/// Transfer that copies vectors unchanged; every level must share one grid
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransfer;

impl LevelTransfer for IdentityTransfer {
    fn restrict(&self, _level: usize, fine: &Array1<f64>) -> Array1<f64> {
        fine.clone()
    }

    fn interpolate(&self, _level: usize, coarse: &Array1<f64>) -> Array1<f64> {
        coarse.clone()
    }

    fn project(&self, _level: usize, fine: &Array1<f64>) -> Array1<f64> {
        fine.clone()
    }
}

/// 2:1 geometric coarsening between [`MixedDiffusion1d`] grids
///
/// Coarse faces sit on the even fine faces. Residual restriction is the
/// transpose of correction interpolation; iterate projection samples fluxes
/// and averages potentials.
pub struct CoarsenByTwo {
    /// Cell count per level, finest first; each level halves the previous
    cells: Vec<usize>,
}

impl CoarsenByTwo {
    pub fn new(cells: Vec<usize>) -> Self {
        for pair in cells.windows(2) {
            debug_assert_eq!(pair[0], 2 * pair[1], "levels must coarsen 2:1");
        }
        Self { cells }
    }
}

impl LevelTransfer for CoarsenByTwo {
    fn restrict(&self, level: usize, fine: &Array1<f64>) -> Array1<f64> {
        let n = self.cells[level];
        let nc = self.cells[level + 1];
        let (nf, nfc) = (n + 1, nc + 1);
        let mut out = Array1::zeros(nfc + nc);
        for j in 0..nfc {
            let f = 2 * j;
            out[j] = fine[f];
            if f > 0 {
                out[j] += 0.5 * fine[f - 1];
            }
            if f < n {
                out[j] += 0.5 * fine[f + 1];
            }
        }
        for j in 0..nc {
            out[nfc + j] = fine[nf + 2 * j] + fine[nf + 2 * j + 1];
        }
        out
    }

    fn interpolate(&self, level: usize, coarse: &Array1<f64>) -> Array1<f64> {
        let nc = self.cells[level];
        let n = self.cells[level - 1];
        let (nf, nfc) = (n + 1, nc + 1);
        let mut out = Array1::zeros(nf + n);
        for j in 0..nfc {
            out[2 * j] = coarse[j];
        }
        for j in 0..nc {
            out[2 * j + 1] = 0.5 * (coarse[j] + coarse[j + 1]);
            out[nf + 2 * j] = coarse[nfc + j];
            out[nf + 2 * j + 1] = coarse[nfc + j];
        }
        out
    }

    fn project(&self, level: usize, fine: &Array1<f64>) -> Array1<f64> {
        let n = self.cells[level];
        let nc = self.cells[level + 1];
        let (nf, nfc) = (n + 1, nc + 1);
        let mut out = Array1::zeros(nfc + nc);
        for j in 0..nfc {
            out[j] = fine[2 * j];
        }
        for j in 0..nc {
            out[nfc + j] = 0.5 * (fine[nf + 2 * j] + fine[nf + 2 * j + 1]);
        }
        out
    }
}

/// FAS solver over 2:1 coarsened grids, finest first.
///
/// Panics when the cell counts do not halve level to level; intended for
/// tests and benches.
pub fn diffusion_hierarchy(
    cells: &[usize],
    model: Coefficient,
    config: FasConfig,
) -> FasSolver<MixedDiffusion1d, CoarsenByTwo, SerialReduction> {
    let ops = cells.iter().map(|&n| MixedDiffusion1d::new(n)).collect();
    let transfer = CoarsenByTwo::new(cells.to_vec());
    FasSolver::new(ops, model, transfer, SerialReduction, config)
        .expect("hierarchy construction should succeed")
}

/// FAS solver whose levels all share one grid, connected by identity
/// transfers.
///
/// Panics on invalid configuration; intended for tests and benches.
pub fn identity_hierarchy(
    num_cells: usize,
    num_levels: usize,
    model: Coefficient,
    config: FasConfig,
) -> FasSolver<MixedDiffusion1d, IdentityTransfer, SerialReduction> {
    let ops = (0..num_levels).map(|_| MixedDiffusion1d::new(num_cells)).collect();
    FasSolver::new(ops, model, IdentityTransfer, SerialReduction, config)
        .expect("hierarchy construction should succeed")
}
