//! Linear algebra helpers for log-domain weight arithmetic and Gaussian sampling.
//!
//! Public API:
//!     pub fn logsumexp(values: &[f64]) -> f64
//!     pub fn row_logsumexp(matrix: &DMatrix<f64>) -> DVector<f64>
//!     pub fn normalize_log_weights(log_weights: &mut DMatrix<f64>) -> Result<(), FilterError>
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn spd_cholesky_factor(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn standard_normal_vector(rng, dim) -> DVector<f64>
//!     pub fn sample_mvn(rng, mean, scale_tril) -> DVector<f64>
//!
//! Weight normalization is always done by log-sum-exp subtraction so that weights
//! spanning hundreds of orders of magnitude remain representable. Gaussian sampling is
//! expressed as a deterministic transform of an independent standard normal draw
//! (`mean + L z`), which is what keeps the propagation step differentiable with respect
//! to the mean and covariance factor.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::FilterError;

/// Numerically stable `ln(sum(exp(values)))`.
///
/// Shifts by the maximum before exponentiating. Returns negative infinity for an empty
/// slice or when every entry is negative infinity.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        // All -inf, empty, or poisoned by NaN/+inf; nothing meaningful to shift.
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Log-sum-exp of each row of a matrix.
pub fn row_logsumexp(matrix: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_fn(matrix.nrows(), |i, _| {
        let row: Vec<f64> = matrix.row(i).iter().cloned().collect();
        logsumexp(&row)
    })
}

/// Normalize log-weights in place so each row sums to 1 in probability space.
///
/// Subtracts the per-row log-sum-exp, after which `sum(exp(row)) == 1` within floating
/// point tolerance.
///
/// # Errors
/// [`FilterError::DegenerateWeights`] if a row's log-sum-exp is not finite (all weights
/// zero, or a NaN/infinity was introduced upstream). The matrix is left untouched in
/// that case.
pub fn normalize_log_weights(log_weights: &mut DMatrix<f64>) -> Result<(), FilterError> {
    let lse = row_logsumexp(log_weights);
    for (batch_index, v) in lse.iter().enumerate() {
        if !v.is_finite() {
            return Err(FilterError::DegenerateWeights { batch_index });
        }
    }
    for i in 0..log_weights.nrows() {
        for j in 0..log_weights.ncols() {
            log_weights[(i, j)] -= lse[i];
        }
    }
    Ok(())
}

/// Symmetrize a matrix: P <- 0.5 (P + P^T), killing round-off asymmetry.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Lower-triangular Cholesky factor `L` of a symmetric positive-definite matrix,
/// with `matrix ≈ L * L^T`.
///
/// The input is symmetrized first. Returns `None` when the factorization fails, i.e.
/// the matrix is not positive-definite. No jitter is applied: a degenerate covariance
/// must surface as a hard failure rather than be silently repaired.
pub fn spd_cholesky_factor(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if !matrix.is_square() {
        return None;
    }
    Cholesky::new(symmetrize(matrix)).map(|ch| ch.l())
}

/// Draw a vector of i.i.d. standard normal samples.
pub fn standard_normal_vector<R: Rng + ?Sized>(rng: &mut R, dim: usize) -> DVector<f64> {
    DVector::from_fn(dim, |_, _| StandardNormal.sample(rng))
}

/// Reparameterized multivariate normal draw: `mean + L z` with `z ~ N(0, I)`.
///
/// `scale_tril` is the lower-triangular covariance factor, so the sample has
/// distribution `N(mean, L L^T)`. Because the randomness enters only through the
/// independent draw `z`, the sample is a deterministic (differentiable) function of
/// `mean` and `scale_tril`.
///
/// # Arguments
/// * `mean` - distribution mean, length D
/// * `scale_tril` - lower-triangular D x D covariance factor
pub fn sample_mvn<R: Rng + ?Sized>(
    rng: &mut R,
    mean: &DVector<f64>,
    scale_tril: &DMatrix<f64>,
) -> DVector<f64> {
    let z = standard_normal_vector(rng, mean.len());
    mean + scale_tril * z
}

/* =============================== Tests ==================================== */
