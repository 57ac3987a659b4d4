// ========================================================================================
//
//                    Variance-inflation pruning of one correlation window
//
// ========================================================================================
//
// The window scheduler hands over a correlation matrix addressed by window slot (only
// the upper triangle is read) plus the slots that are still alive, previously accepted
// markers first. We repeatedly build the unit-diagonal correlation matrix of the live
// set, invert it through faer's Cholesky factor, and drop either the first row that turns
// out to be linearly dependent on the rows before it or the row with the largest
// variance inflation factor, until every factor is at or below the threshold.

use faer::linalg::solvers::{LltError, Solve};
use faer::{Mat, Side};
use log::trace;
use ndarray::{Array1, Array2, ArrayView2};

/// Cholesky pivots at or below this value mark a row as linearly dependent. faer itself
/// only rejects pivots that are not positive.
const SINGULAR_PIVOT_EPSILON: f64 = 1e-12;

/// The row of a correlation matrix that made it singular.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingularRow(pub usize);

/// Diagonal of the inverse of the symmetric matrix `matrix`, i.e. the variance
/// inflation factor of every row when `matrix` is a correlation matrix.
pub fn variance_inflation(matrix: &Array2<f64>) -> Result<Array1<f64>, SingularRow> {
    let dim = matrix.nrows();
    debug_assert_eq!(dim, matrix.ncols());

    let mat = Mat::from_fn(dim, dim, |i, j| matrix[[i, j]]);
    let factor = mat
        .as_ref()
        .llt(Side::Lower)
        .map_err(|LltError::NonPositivePivot { index }| SingularRow(index))?;
    let l = factor.L();
    if let Some(row) = (0..dim).find(|&i| !(l[(i, i)] * l[(i, i)] > SINGULAR_PIVOT_EPSILON)) {
        return Err(SingularRow(row));
    }

    let inverse = factor.solve(Mat::<f64>::identity(dim, dim).as_ref());
    Ok(Array1::from_shape_fn(dim, |k| inverse[(k, k)]))
}

pub struct MatrixPruner {
    vif_threshold: f64,
}

impl MatrixPruner {
    pub fn new(vif_threshold: f64) -> Self {
        Self { vif_threshold }
    }

    /// Unit-diagonal correlation matrix of `rows`, read from the upper triangle of
    /// `window_corr`.
    fn gather(window_corr: &ArrayView2<'_, f64>, rows: &[usize]) -> Array2<f64> {
        let n = rows.len();
        Array2::from_shape_fn((n, n), |(i, j)| {
            if i == j {
                1.0
            } else {
                let (a, b) = (rows[i.min(j)], rows[i.max(j)]);
                window_corr[[a.min(b), a.max(b)]]
            }
        })
    }

    /// Prunes the live slots `rows` of one window. Returns the dropped slots in the
    /// order they were removed.
    pub fn prune_window(&self, window_corr: ArrayView2<'_, f64>, mut rows: Vec<usize>) -> Vec<usize> {
        let mut dropped = Vec::new();
        while rows.len() > 1 {
            let factors = loop {
                match variance_inflation(&Self::gather(&window_corr, &rows)) {
                    Ok(factors) => break factors,
                    Err(SingularRow(k)) => {
                        trace!("slot {} is linearly dependent on earlier slots", rows[k]);
                        dropped.push(rows.remove(k));
                    }
                }
            };

            let (worst, max_vif) = factors
                .iter()
                .copied()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (idx, vif)| {
                    if vif > best.1 { (idx, vif) } else { best }
                });
            if max_vif > self.vif_threshold {
                trace!("slot {} has VIF {max_vif:.4}", rows[worst]);
                dropped.push(rows.remove(worst));
            } else {
                break;
            }
        }
        dropped
    }
}
