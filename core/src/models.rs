//! Model trait seams and batched input containers.
//!
//! The filter treats its two probabilistic models as pure, stateless functions invoked
//! through the [`DynamicsModel`] and [`MeasurementModel`] traits. Controls and
//! observations arrive as an [`InputBatch`]: either a single dense matrix with one row
//! per batch element, or a mapping of named channels that all share the same leading
//! batch dimension (e.g. `{"image": N x 1024, "gyro": N x 3}`). The filter never
//! inspects channel contents; it only checks the leading dimension and expands rows
//! along the particle axis before a dynamics call.

use nalgebra::DMatrix;
use std::collections::BTreeMap;

use crate::FilterError;

/// A batch of N independent control or observation samples.
///
/// Each variant carries matrices whose leading (row) dimension is the batch size N.
/// The trailing dimension is opaque to the filter and interpreted only by the model
/// implementations.
#[derive(Debug, Clone, PartialEq)]
pub enum InputBatch {
    /// A single unnamed channel, shape N x C.
    Dense(DMatrix<f64>),
    /// Named channels, each of shape N x C_k, all sharing the same N.
    Named(BTreeMap<String, DMatrix<f64>>),
}

impl InputBatch {
    /// Build a named batch from an iterator of `(name, matrix)` pairs.
    pub fn from_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = (S, DMatrix<f64>)>,
        S: Into<String>,
    {
        InputBatch::Named(
            channels
                .into_iter()
                .map(|(name, m)| (name.into(), m))
                .collect(),
        )
    }

    /// The shared leading batch dimension N.
    ///
    /// # Errors
    /// [`FilterError::InvalidInput`] if the batch has no channels or the channels
    /// disagree on their leading dimension.
    pub fn batch_size(&self) -> Result<usize, FilterError> {
        match self {
            InputBatch::Dense(m) => Ok(m.nrows()),
            InputBatch::Named(channels) => {
                let mut iter = channels.values();
                let first = iter
                    .next()
                    .ok_or(FilterError::InvalidInput("named batch has no channels"))?;
                let n = first.nrows();
                if iter.any(|m| m.nrows() != n) {
                    return Err(FilterError::InvalidInput(
                        "named channels disagree on leading batch dimension",
                    ));
                }
                Ok(n)
            }
        }
    }

    /// Expand every batch row `repeats` times by interleaved repetition.
    ///
    /// Row order is `[u0 u0 ... u1 u1 ...]`, not tiling: the particle index varies
    /// fastest, matching the flattening order of the particle array.
    pub fn repeat_interleave(&self, repeats: usize) -> InputBatch {
        match self {
            InputBatch::Dense(m) => InputBatch::Dense(repeat_rows(m, repeats)),
            InputBatch::Named(channels) => InputBatch::Named(
                channels
                    .iter()
                    .map(|(name, m)| (name.clone(), repeat_rows(m, repeats)))
                    .collect(),
            ),
        }
    }

    /// The dense matrix, if this batch is a single unnamed channel.
    pub fn dense(&self) -> Option<&DMatrix<f64>> {
        match self {
            InputBatch::Dense(m) => Some(m),
            InputBatch::Named(_) => None,
        }
    }

    /// A named channel, if present.
    pub fn channel(&self, name: &str) -> Option<&DMatrix<f64>> {
        match self {
            InputBatch::Dense(_) => None,
            InputBatch::Named(channels) => channels.get(name),
        }
    }
}

/// Repeat each row of `m` `repeats` times consecutively.
fn repeat_rows(m: &DMatrix<f64>, repeats: usize) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows() * repeats, m.ncols(), |i, j| m[(i / repeats, j)])
}

/// Forward (state transition) model.
///
/// Given a flattened batch of K initial states and their K-aligned controls, predicts
/// the parameters of the next-state distribution. The filter samples from that
/// distribution itself via the reparameterized transform, so implementations only
/// supply a mean and a lower-triangular covariance factor per state and stay fully
/// deterministic.
pub trait DynamicsModel {
    /// Dimension D of the state vector.
    fn state_dim(&self) -> usize;

    /// Predict the next-state distribution for each of the K input states.
    ///
    /// # Arguments
    /// * `initial_states` - K x D matrix of current states (K = N * M during a filter
    ///   step, batch-major with particle index fastest)
    /// * `controls` - control batch already expanded to K rows
    ///
    /// # Returns
    /// `(predicted_means, scale_trils)`: a K x D matrix of means and K lower-triangular
    /// D x D covariance factors.
    fn propagate(
        &self,
        initial_states: &DMatrix<f64>,
        controls: &InputBatch,
    ) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>), FilterError>;
}

/// Observation likelihood model.
pub trait MeasurementModel {
    /// Dimension D of the state vector.
    fn state_dim(&self) -> usize;

    /// Log-likelihood of the current observation under each candidate state.
    ///
    /// # Arguments
    /// * `states` - N matrices of shape M x D (one per batch row)
    /// * `observations` - observation batch with leading dimension N
    ///
    /// # Returns
    /// N x M matrix of log-likelihoods.
    fn score(
        &self,
        states: &[DMatrix<f64>],
        observations: &InputBatch,
    ) -> Result<DMatrix<f64>, FilterError>;
}
