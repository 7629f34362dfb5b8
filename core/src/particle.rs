//! Differentiable particle filter: belief state, resampling strategies, and the
//! per-timestep update.
//!
//! The filter maintains a weighted particle population per batch row and advances it
//! one timestep at a time: decide whether to resample, rebalance the particle count if
//! resampling is skipped, propagate through the dynamics model, reweight against the
//! measurement model, produce a point estimate, then (optionally) resample. The belief
//! is threaded through the update as an explicit value: `step` computes a successor
//! [`BeliefState`] from an immutable borrow and reassigns it only on success, so any
//! error leaves the previous belief intact.

use std::fmt::{self, Debug};

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::FilterError;
use crate::linalg::{logsumexp, normalize_log_weights, sample_mvn, spd_cholesky_factor};
use crate::models::{DynamicsModel, InputBatch, MeasurementModel};

/// The filter's posterior approximation: a particle population with log-weights.
///
/// Conceptually a `(N, M, D)` state array plus an `N x M` log-weight matrix. After
/// every normalization step the log-sum-exp of each weight row is 0, i.e. the weights
/// of each batch row sum to 1 in probability space.
#[derive(Debug, Clone, PartialEq)]
pub struct BeliefState {
    /// N matrices of shape M x D.
    particle_states: Vec<DMatrix<f64>>,
    /// N x M log-weights.
    particle_log_weights: DMatrix<f64>,
}

impl BeliefState {
    /// Assemble a belief from particle states and log-weights.
    ///
    /// # Errors
    /// [`FilterError::ShapeMismatch`] unless there is at least one batch row, every
    /// state matrix has the same `M x D` shape with `M, D >= 1`, and the weight matrix
    /// is `N x M`.
    pub fn new(
        particle_states: Vec<DMatrix<f64>>,
        particle_log_weights: DMatrix<f64>,
    ) -> Result<Self, FilterError> {
        let n = particle_states.len();
        if n == 0 {
            return Err(FilterError::ShapeMismatch {
                context: "belief state",
                expected: "at least one batch row".to_string(),
                actual: "0 rows".to_string(),
            });
        }
        let m = particle_states[0].nrows();
        let d = particle_states[0].ncols();
        if m == 0 || d == 0 {
            return Err(FilterError::ShapeMismatch {
                context: "belief state",
                expected: "M >= 1 particles and D >= 1 state dimensions".to_string(),
                actual: format!("{m} x {d}"),
            });
        }
        for states in &particle_states {
            if states.nrows() != m || states.ncols() != d {
                return Err(FilterError::ShapeMismatch {
                    context: "belief state",
                    expected: format!("{m} x {d} per batch row"),
                    actual: format!("{} x {}", states.nrows(), states.ncols()),
                });
            }
        }
        if particle_log_weights.nrows() != n || particle_log_weights.ncols() != m {
            return Err(FilterError::ShapeMismatch {
                context: "belief state log-weights",
                expected: format!("{n} x {m}"),
                actual: format!(
                    "{} x {}",
                    particle_log_weights.nrows(),
                    particle_log_weights.ncols()
                ),
            });
        }
        Ok(BeliefState {
            particle_states,
            particle_log_weights,
        })
    }

    /// Number of batch rows N.
    pub fn batch_size(&self) -> usize {
        self.particle_log_weights.nrows()
    }

    /// Current particle count M (may transiently differ from the configured target).
    pub fn particle_count(&self) -> usize {
        self.particle_log_weights.ncols()
    }

    /// State dimension D.
    pub fn state_dim(&self) -> usize {
        self.particle_states[0].ncols()
    }

    /// Particle states, one `M x D` matrix per batch row.
    pub fn particle_states(&self) -> &[DMatrix<f64>] {
        &self.particle_states
    }

    /// `N x M` log-weight matrix.
    pub fn particle_log_weights(&self) -> &DMatrix<f64> {
        &self.particle_log_weights
    }

    /// Effective sample size per batch row: `1 / sum_j w_j^2`.
    ///
    /// Ranges from 1 (one particle carries all the weight) to M (uniform weights);
    /// a standard degeneracy diagnostic.
    pub fn effective_sample_size(&self) -> DVector<f64> {
        DVector::from_fn(self.batch_size(), |i, _| {
            let sum_sq: f64 = self
                .particle_log_weights
                .row(i)
                .iter()
                .map(|lw| (2.0 * lw).exp())
                .sum();
            if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
        })
    }

    /// Weighted mean state per batch row, shape N x D. Assumes normalized weights.
    pub fn weighted_mean(&self) -> DMatrix<f64> {
        let n = self.batch_size();
        let d = self.state_dim();
        let mut mean = DMatrix::zeros(n, d);
        for b in 0..n {
            for j in 0..self.particle_count() {
                let w = self.particle_log_weights[(b, j)].exp();
                for k in 0..d {
                    mean[(b, k)] += w * self.particle_states[b][(j, k)];
                }
            }
        }
        mean
    }

    /// Weighted state covariance per batch row. Assumes normalized weights.
    pub fn weighted_covariance(&self) -> Vec<DMatrix<f64>> {
        let mean = self.weighted_mean();
        let d = self.state_dim();
        (0..self.batch_size())
            .map(|b| {
                let mut cov = DMatrix::zeros(d, d);
                for j in 0..self.particle_count() {
                    let w = self.particle_log_weights[(b, j)].exp();
                    let diff = DVector::from_fn(d, |k, _| {
                        self.particle_states[b][(j, k)] - mean[(b, k)]
                    });
                    cov += w * &diff * diff.transpose();
                }
                cov
            })
            .collect()
    }
}

/// How the point estimate is extracted from the belief.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Weighted average of particle states. Requires normalized weights.
    WeightedAverage,
    /// State of the particle with the maximum log-weight; ties break to the first
    /// occurrence.
    Argmax,
}

impl Default for EstimationMethod {
    fn default() -> Self {
        EstimationMethod::WeightedAverage
    }
}

impl EstimationMethod {
    /// Point estimate per batch row, shape N x D.
    pub fn estimate(&self, belief: &BeliefState) -> DMatrix<f64> {
        match self {
            EstimationMethod::WeightedAverage => belief.weighted_mean(),
            EstimationMethod::Argmax => {
                let n = belief.batch_size();
                let d = belief.state_dim();
                let lw = belief.particle_log_weights();
                let mut est = DMatrix::zeros(n, d);
                for b in 0..n {
                    let mut best = 0;
                    for j in 1..belief.particle_count() {
                        // Strict comparison: the first maximal index wins ties.
                        if lw[(b, j)] > lw[(b, best)] {
                            best = j;
                        }
                    }
                    est.set_row(b, &belief.particle_states()[b].row(best));
                }
                est
            }
        }
    }
}

/// Whether a step is part of a training pass or an inference pass.
///
/// Passed explicitly into every `step` call; the filter holds no hidden mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

/// When resampling occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Resample on every step.
    Always,
    /// Never resample; the particle set is only rebalanced to the target count.
    Never,
    /// Resample during [`Phase::Eval`] only: training keeps propagation differentiable
    /// end-to-end across time, inference avoids particle deprivation over long
    /// horizons.
    Adaptive,
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        ResamplePolicy::Adaptive
    }
}

impl ResamplePolicy {
    /// Resolve the policy against the current pass.
    pub fn resolve(&self, phase: Phase) -> bool {
        match self {
            ResamplePolicy::Always => true,
            ResamplePolicy::Never => false,
            ResamplePolicy::Adaptive => phase == Phase::Eval,
        }
    }
}

/// Resampling algorithm, selected by the soft-resample coefficient alpha.
///
/// Both variants draw `target_count` indices per batch row from a categorical
/// distribution over the current particles and gather the states at those indices;
/// they differ in the sampling logits and in what happens to the weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResampleStrategy {
    /// Sampling logits are exactly the current log-weights; new weights are uniform.
    /// The hard selection stops gradient flow through the weight values, leaving it
    /// only through the gathered states.
    Standard,
    /// Karkus et al. soft resampling with mixture coefficient `0 < alpha < 1`:
    /// logits are `logsumexp(lw + ln(alpha), -ln(M) + ln(1 - alpha))` and the new
    /// weights carry the importance correction `lw - logits`, preserving a
    /// differentiable pathway through the weights at the cost of some estimator bias.
    Soft(f64),
}

impl ResampleStrategy {
    /// Select the strategy for a given coefficient.
    ///
    /// # Errors
    /// [`FilterError::InvalidConfig`] unless `0 < alpha <= 1`. `alpha == 1` selects
    /// [`ResampleStrategy::Standard`].
    pub fn from_alpha(alpha: f64) -> Result<Self, FilterError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(FilterError::InvalidConfig(format!(
                "soft_resample_alpha must be in (0, 1], got {alpha}"
            )));
        }
        if alpha < 1.0 {
            Ok(ResampleStrategy::Soft(alpha))
        } else {
            Ok(ResampleStrategy::Standard)
        }
    }

    /// The categorical sampling logits for the current log-weights.
    pub fn sampling_logits(&self, log_weights: &DMatrix<f64>) -> DMatrix<f64> {
        match *self {
            ResampleStrategy::Standard => log_weights.clone(),
            ResampleStrategy::Soft(alpha) => {
                let m = log_weights.ncols() as f64;
                let uniform = -m.ln() + (1.0 - alpha).ln();
                let log_alpha = alpha.ln();
                DMatrix::from_fn(log_weights.nrows(), log_weights.ncols(), |i, j| {
                    logsumexp(&[log_weights[(i, j)] + log_alpha, uniform])
                })
            }
        }
    }

    /// Replace the particle set with `target_count` particles drawn proportionally to
    /// the sampling logits (with replacement).
    ///
    /// Standard: new log-weights are uniform `-ln(target_count)`. Soft: new
    /// log-weights are the importance-corrected `lw - logits`, gathered at the drawn
    /// indices and renormalized per row.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        belief: &BeliefState,
        target_count: usize,
    ) -> Result<BeliefState, FilterError> {
        let n = belief.batch_size();
        let lw = belief.particle_log_weights();
        let logits = self.sampling_logits(lw);

        let mut new_states = Vec::with_capacity(n);
        let mut new_lw = DMatrix::zeros(n, target_count);
        for b in 0..n {
            let row: Vec<f64> = logits.row(b).iter().cloned().collect();
            let lse = logsumexp(&row);
            if !lse.is_finite() {
                return Err(FilterError::DegenerateWeights { batch_index: b });
            }
            let probs: Vec<f64> = row.iter().map(|l| (l - lse).exp()).collect();
            let categorical = WeightedIndex::new(&probs)
                .map_err(|_| FilterError::DegenerateWeights { batch_index: b })?;
            let indices: Vec<usize> = (0..target_count)
                .map(|_| categorical.sample(rng))
                .collect();

            new_states.push(gather_rows(&belief.particle_states()[b], &indices));
            match *self {
                ResampleStrategy::Standard => {
                    let uniform = -(target_count as f64).ln();
                    for k in 0..target_count {
                        new_lw[(b, k)] = uniform;
                    }
                }
                ResampleStrategy::Soft(_) => {
                    for (k, &idx) in indices.iter().enumerate() {
                        new_lw[(b, k)] = lw[(b, idx)] - logits[(b, idx)];
                    }
                }
            }
        }
        if matches!(self, ResampleStrategy::Soft(_)) {
            normalize_log_weights(&mut new_lw)?;
        }
        BeliefState::new(new_states, new_lw)
    }
}

/// Gather rows of `m` by index, allowing repeats.
fn gather_rows(m: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(indices.len(), m.ncols(), |i, j| m[(indices[i], j)])
}

/// Index vector forcing a particle set of size `current` to size `target` without
/// resampling.
///
/// The first `floor(target/current) * current` slots cycle through the original
/// indices so each particle is duplicated an equal number of whole times (zero
/// sampling variance); the remainder is filled from the front of a random permutation
/// (sampling without replacement). When `target` is an exact multiple of `current` the
/// permutation draw is skipped entirely.
fn rebalance_indices<R: Rng + ?Sized>(rng: &mut R, current: usize, target: usize) -> Vec<usize> {
    let copies = (target / current) * current;
    let mut indices = Vec::with_capacity(target);
    for i in 0..copies {
        indices.push(i % current);
    }
    let remaining = target - copies;
    if remaining > 0 {
        let mut perm: Vec<usize> = (0..current).collect();
        perm.shuffle(rng);
        indices.extend_from_slice(&perm[..remaining]);
    }
    indices
}

/// Force the belief to `target` particles per row via copy-then-sample, renormalizing
/// the gathered log-weights. One index vector is drawn and shared across batch rows.
fn rebalance_to_target<R: Rng + ?Sized>(
    rng: &mut R,
    belief: &BeliefState,
    target: usize,
) -> Result<BeliefState, FilterError> {
    let indices = rebalance_indices(rng, belief.particle_count(), target);
    let new_states: Vec<DMatrix<f64>> = belief
        .particle_states()
        .iter()
        .map(|states| gather_rows(states, &indices))
        .collect();
    let mut new_lw = DMatrix::from_fn(belief.batch_size(), target, |b, k| {
        belief.particle_log_weights()[(b, indices[k])]
    });
    normalize_log_weights(&mut new_lw)?;
    BeliefState::new(new_states, new_lw)
}

/// Filter configuration, immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Target particle count M*.
    pub num_particles: usize,
    /// When resampling occurs.
    #[serde(default)]
    pub resample_policy: ResamplePolicy,
    /// Soft-resample mixture coefficient, in (0, 1]. 1 selects standard resampling.
    pub soft_resample_alpha: f64,
    /// How point estimates are extracted.
    #[serde(default)]
    pub estimation_method: EstimationMethod,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 100,
            resample_policy: ResamplePolicy::default(),
            soft_resample_alpha: 1.0,
            estimation_method: EstimationMethod::default(),
        }
    }
}

impl FilterConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfig(
                "num_particles must be positive".to_string(),
            ));
        }
        ResampleStrategy::from_alpha(self.soft_resample_alpha)?;
        Ok(())
    }
}

/// Sequential Monte Carlo state estimator over user-supplied dynamics and measurement
/// models.
///
/// One filter instance per independent estimation problem; the N batch rows within a
/// call are processed jointly as vectorized independent tracks. The instance is not
/// reentrant, which `&mut self` on the stepping methods makes a compile-time property.
pub struct ParticleFilter<D: DynamicsModel, M: MeasurementModel> {
    dynamics_model: D,
    measurement_model: M,
    config: FilterConfig,
    resample_strategy: ResampleStrategy,
    state_dim: usize,
    belief: Option<BeliefState>,
}

impl<D: DynamicsModel, M: MeasurementModel> ParticleFilter<D, M> {
    /// Build a filter around a dynamics/measurement model pair.
    ///
    /// # Errors
    /// [`FilterError::InvalidConfig`] for a non-positive particle count, an
    /// out-of-range soft-resample coefficient, or disagreeing model state dimensions.
    pub fn new(dynamics_model: D, measurement_model: M, config: FilterConfig) -> Result<Self, FilterError> {
        config.validate()?;
        let state_dim = dynamics_model.state_dim();
        if state_dim != measurement_model.state_dim() {
            return Err(FilterError::InvalidConfig(format!(
                "dynamics state_dim {} != measurement state_dim {}",
                state_dim,
                measurement_model.state_dim()
            )));
        }
        if state_dim == 0 {
            return Err(FilterError::InvalidConfig(
                "state dimension must be positive".to_string(),
            ));
        }
        let resample_strategy = ResampleStrategy::from_alpha(config.soft_resample_alpha)?;
        Ok(ParticleFilter {
            dynamics_model,
            measurement_model,
            config,
            resample_strategy,
            state_dim,
            belief: None,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn resample_strategy(&self) -> ResampleStrategy {
        self.resample_strategy
    }

    /// The current belief, if initialized.
    pub fn belief(&self) -> Option<&BeliefState> {
        self.belief.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.belief.is_some()
    }

    /// Replace the belief wholesale, e.g. to restore a checkpoint or inject a particle
    /// set of a different size (the next non-resampling step rebalances it back to the
    /// target count).
    ///
    /// # Errors
    /// [`FilterError::ShapeMismatch`] if the belief's state dimension disagrees with
    /// the models'.
    pub fn set_belief(&mut self, belief: BeliefState) -> Result<(), FilterError> {
        if belief.state_dim() != self.state_dim {
            return Err(FilterError::ShapeMismatch {
                context: "belief state dimension",
                expected: format!("{}", self.state_dim),
                actual: format!("{}", belief.state_dim()),
            });
        }
        self.belief = Some(belief);
        Ok(())
    }

    /// Populate the initial belief with normally distributed particles.
    ///
    /// For each batch row independently, draws `num_particles` i.i.d. samples from
    /// `N(mean_row, covariance_row)` and assigns every particle the uniform log-weight
    /// `-ln(num_particles)`.
    ///
    /// # Arguments
    /// * `mean` - N x D matrix of per-row means
    /// * `covariance` - N symmetric positive-definite D x D matrices
    ///
    /// # Errors
    /// [`FilterError::ShapeMismatch`] on inconsistent shapes,
    /// [`FilterError::CovarianceNotPositiveDefinite`] when a row's covariance fails
    /// its Cholesky factorization. The previous belief (if any) is untouched on error.
    pub fn initialize_beliefs<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        mean: &DMatrix<f64>,
        covariance: &[DMatrix<f64>],
    ) -> Result<(), FilterError> {
        let n = mean.nrows();
        let d = self.state_dim;
        if n == 0 || mean.ncols() != d {
            return Err(FilterError::ShapeMismatch {
                context: "initial belief mean",
                expected: format!("N x {d} with N >= 1"),
                actual: format!("{} x {}", n, mean.ncols()),
            });
        }
        if covariance.len() != n {
            return Err(FilterError::ShapeMismatch {
                context: "initial belief covariance",
                expected: format!("{n} matrices"),
                actual: format!("{} matrices", covariance.len()),
            });
        }
        let m = self.config.num_particles;
        let mut states = Vec::with_capacity(n);
        for (b, cov) in covariance.iter().enumerate() {
            if cov.nrows() != d || cov.ncols() != d {
                return Err(FilterError::ShapeMismatch {
                    context: "initial belief covariance",
                    expected: format!("{d} x {d}"),
                    actual: format!("{} x {}", cov.nrows(), cov.ncols()),
                });
            }
            let tril = spd_cholesky_factor(cov)
                .ok_or(FilterError::CovarianceNotPositiveDefinite { batch_index: b })?;
            let mean_row: DVector<f64> = mean.row(b).transpose();
            let mut row_states = DMatrix::zeros(m, d);
            for j in 0..m {
                let sample = sample_mvn(rng, &mean_row, &tril);
                row_states.set_row(j, &sample.transpose());
            }
            states.push(row_states);
        }
        let log_weights = DMatrix::from_element(n, m, -(m as f64).ln());
        self.belief = Some(BeliefState::new(states, log_weights)?);
        Ok(())
    }

    /// Advance the belief by one timestep and return the state estimate, shape N x D.
    ///
    /// Order of operations: resolve the resample decision from the policy and `phase`;
    /// rebalance the particle count if resampling is skipped and the count is off
    /// target; propagate every particle through the dynamics model (reparameterized
    /// Gaussian draw); reweight by the measurement log-likelihoods and renormalize;
    /// extract the point estimate; resample if decided.
    ///
    /// The update is all-or-nothing: on any error the belief from before the call is
    /// preserved.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        observations: &InputBatch,
        controls: &InputBatch,
        phase: Phase,
    ) -> Result<DMatrix<f64>, FilterError> {
        let belief = self.belief.as_ref().ok_or(FilterError::NotInitialized)?;
        let (next, estimate) = self.advance(rng, belief, observations, controls, phase)?;
        self.belief = Some(next);
        Ok(estimate)
    }

    /// Compute the successor belief and estimate without touching `self.belief`.
    fn advance<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        belief: &BeliefState,
        observations: &InputBatch,
        controls: &InputBatch,
        phase: Phase,
    ) -> Result<(BeliefState, DMatrix<f64>), FilterError> {
        let n = belief.batch_size();
        let d = self.state_dim;
        let obs_n = observations.batch_size()?;
        if obs_n != n {
            return Err(FilterError::ShapeMismatch {
                context: "observations",
                expected: format!("{n} batch rows"),
                actual: format!("{obs_n} batch rows"),
            });
        }
        let ctrl_n = controls.batch_size()?;
        if ctrl_n != n {
            return Err(FilterError::ShapeMismatch {
                context: "controls",
                expected: format!("{n} batch rows"),
                actual: format!("{ctrl_n} batch rows"),
            });
        }

        let resample_now = self.config.resample_policy.resolve(phase);

        // Resampling is the natural place to change the particle count; when it is
        // skipped the set must still be forced to the target size before propagation.
        let rebalanced;
        let belief = if !resample_now && belief.particle_count() != self.config.num_particles {
            debug!(
                "rebalancing particle set from {} to {} particles",
                belief.particle_count(),
                self.config.num_particles
            );
            rebalanced = rebalance_to_target(rng, belief, self.config.num_particles)?;
            &rebalanced
        } else {
            belief
        };
        let m = belief.particle_count();

        // Flatten (N, M, D) -> (N*M, D), batch-major with the particle index fastest,
        // and expand the controls to match.
        let mut flat = DMatrix::zeros(n * m, d);
        for (b, states) in belief.particle_states().iter().enumerate() {
            for j in 0..m {
                for k in 0..d {
                    flat[(b * m + j, k)] = states[(j, k)];
                }
            }
        }
        let expanded_controls = controls.repeat_interleave(m);
        let (means, trils) = self
            .dynamics_model
            .propagate(&flat, &expanded_controls)?;
        if means.nrows() != n * m || means.ncols() != d {
            return Err(FilterError::ModelContract(format!(
                "dynamics returned {} x {} means, expected {} x {}",
                means.nrows(),
                means.ncols(),
                n * m,
                d
            )));
        }
        if trils.len() != n * m {
            return Err(FilterError::ModelContract(format!(
                "dynamics returned {} covariance factors, expected {}",
                trils.len(),
                n * m
            )));
        }
        let mut new_states = Vec::with_capacity(n);
        for b in 0..n {
            let mut row_states = DMatrix::zeros(m, d);
            for j in 0..m {
                let k = b * m + j;
                let tril = &trils[k];
                if tril.nrows() != d || tril.ncols() != d {
                    return Err(FilterError::ModelContract(format!(
                        "dynamics covariance factor {} is {} x {}, expected {} x {}",
                        k,
                        tril.nrows(),
                        tril.ncols(),
                        d,
                        d
                    )));
                }
                let mean_row: DVector<f64> = means.row(k).transpose();
                let sample = sample_mvn(rng, &mean_row, tril);
                row_states.set_row(j, &sample.transpose());
            }
            new_states.push(row_states);
        }

        // Reweight by the observation log-likelihoods and renormalize.
        let log_likelihoods = self.measurement_model.score(&new_states, observations)?;
        if log_likelihoods.nrows() != n || log_likelihoods.ncols() != m {
            return Err(FilterError::ModelContract(format!(
                "measurement returned {} x {} log-likelihoods, expected {} x {}",
                log_likelihoods.nrows(),
                log_likelihoods.ncols(),
                n,
                m
            )));
        }
        let mut log_weights = belief.particle_log_weights().clone();
        log_weights += &log_likelihoods;
        normalize_log_weights(&mut log_weights)?;
        let posterior = BeliefState::new(new_states, log_weights)?;

        // The estimate is extracted before any resampling so it reflects the weighted
        // posterior rather than the post-resampling uniform set.
        let estimate = self.config.estimation_method.estimate(&posterior);

        let next = if resample_now {
            debug!(
                "resampling {} -> {} particles ({:?})",
                m, self.config.num_particles, self.resample_strategy
            );
            self.resample_strategy
                .resample(rng, &posterior, self.config.num_particles)?
        } else {
            posterior
        };
        Ok((next, estimate))
    }
}

impl<D: DynamicsModel, M: MeasurementModel> Debug for ParticleFilter<D, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ParticleFilter");
        s.field("num_particles", &self.config.num_particles)
            .field("state_dim", &self.state_dim)
            .field("resample_policy", &self.config.resample_policy)
            .field("resample_strategy", &self.resample_strategy)
            .field("estimation_method", &self.config.estimation_method);
        match &self.belief {
            Some(belief) => {
                let ess = belief.effective_sample_size();
                let min_ess = ess.iter().cloned().fold(f64::INFINITY, f64::min);
                let max_ess = ess.iter().cloned().fold(0.0, f64::max);
                s.field("batch_size", &belief.batch_size())
                    .field("particle_count", &belief.particle_count())
                    .field(
                        "effective_particles",
                        &format_args!("[{:.1}, {:.1}]", min_ess, max_ess),
                    );
            }
            None => {
                s.field("initialized", &false);
            }
        }
        s.finish()
    }
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Identity dynamics with isotropic process noise; ignores controls.
    struct TestDynamics {
        dim: usize,
        noise_std: f64,
    }
    impl DynamicsModel for TestDynamics {
        fn state_dim(&self) -> usize {
            self.dim
        }
        fn propagate(
            &self,
            initial_states: &DMatrix<f64>,
            _controls: &InputBatch,
        ) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>), FilterError> {
            let k = initial_states.nrows();
            let tril = DMatrix::identity(self.dim, self.dim) * self.noise_std;
            Ok((initial_states.clone(), vec![tril; k]))
        }
    }

    /// Gaussian-style score: negative half squared distance to the dense observation.
    struct TestMeasurement {
        dim: usize,
    }
    impl MeasurementModel for TestMeasurement {
        fn state_dim(&self) -> usize {
            self.dim
        }
        fn score(
            &self,
            states: &[DMatrix<f64>],
            observations: &InputBatch,
        ) -> Result<DMatrix<f64>, FilterError> {
            let obs = observations
                .dense()
                .ok_or(FilterError::ModelContract("expected dense observations".to_string()))?;
            let n = states.len();
            let m = states[0].nrows();
            let mut ll = DMatrix::zeros(n, m);
            for b in 0..n {
                for j in 0..m {
                    let mut sq = 0.0;
                    for k in 0..self.dim {
                        let diff = states[b][(j, k)] - obs[(b, k)];
                        sq += diff * diff;
                    }
                    ll[(b, j)] = -0.5 * sq;
                }
            }
            Ok(ll)
        }
    }

    fn test_filter(config: FilterConfig) -> ParticleFilter<TestDynamics, TestMeasurement> {
        ParticleFilter::new(
            TestDynamics {
                dim: 2,
                noise_std: 0.1,
            },
            TestMeasurement { dim: 2 },
            config,
        )
        .unwrap()
    }

    fn initialized_filter(
        rng: &mut StdRng,
        config: FilterConfig,
    ) -> ParticleFilter<TestDynamics, TestMeasurement> {
        let mut pf = test_filter(config);
        let mean = DMatrix::zeros(3, 2);
        let cov = vec![DMatrix::identity(2, 2); 3];
        pf.initialize_beliefs(rng, &mean, &cov).unwrap();
        pf
    }

    fn two_particle_belief() -> BeliefState {
        // Two particles at 0 and 4 with weights 0.25 / 0.75.
        BeliefState::new(
            vec![DMatrix::from_row_slice(2, 1, &[0.0, 4.0])],
            DMatrix::from_row_slice(1, 2, &[0.25_f64.ln(), 0.75_f64.ln()]),
        )
        .unwrap()
    }

    #[test]
    fn test_config_rejects_zero_particles() {
        let config = FilterConfig {
            num_particles: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(
            ParticleFilter::new(
                TestDynamics { dim: 2, noise_std: 0.1 },
                TestMeasurement { dim: 2 },
                config
            ),
            Err(FilterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_bad_alpha() {
        for alpha in [0.0, -0.5, 1.5] {
            let config = FilterConfig {
                soft_resample_alpha: alpha,
                ..FilterConfig::default()
            };
            assert!(config.validate().is_err(), "alpha {alpha} should be rejected");
        }
    }

    #[test]
    fn test_config_rejects_state_dim_mismatch() {
        assert!(matches!(
            ParticleFilter::new(
                TestDynamics { dim: 3, noise_std: 0.1 },
                TestMeasurement { dim: 2 },
                FilterConfig::default()
            ),
            Err(FilterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_serde_identifiers() {
        let json = r#"{
            "num_particles": 50,
            "resample_policy": "adaptive",
            "soft_resample_alpha": 0.5,
            "estimation_method": "weighted_average"
        }"#;
        let config: FilterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_particles, 50);
        assert_eq!(config.estimation_method, EstimationMethod::WeightedAverage);
        // Unknown identifiers fail before construction.
        assert!(serde_json::from_str::<FilterConfig>(
            r#"{"num_particles": 50, "soft_resample_alpha": 1.0, "estimation_method": "mode"}"#
        )
        .is_err());
    }

    #[test]
    fn test_step_before_initialization_fails() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pf = test_filter(FilterConfig::default());
        let obs = InputBatch::Dense(DMatrix::zeros(3, 2));
        let ctrl = InputBatch::Dense(DMatrix::zeros(3, 1));
        assert!(matches!(
            pf.step(&mut rng, &obs, &ctrl, Phase::Train),
            Err(FilterError::NotInitialized)
        ));
    }

    #[test]
    fn test_initialize_beliefs_shapes_and_weights() {
        let mut rng = StdRng::seed_from_u64(2);
        let pf = initialized_filter(&mut rng, FilterConfig::default());
        let belief = pf.belief().unwrap();
        assert_eq!(belief.batch_size(), 3);
        assert_eq!(belief.particle_count(), 100);
        assert_eq!(belief.state_dim(), 2);
        let expected = -(100.0_f64).ln();
        for lw in belief.particle_log_weights().iter() {
            assert_approx_eq!(*lw, expected, 1e-12);
        }
        for b in 0..3 {
            let total: f64 = belief
                .particle_log_weights()
                .row(b)
                .iter()
                .map(|lw| lw.exp())
                .sum();
            assert_approx_eq!(total, 1.0, 1e-9);
        }
    }

    #[test]
    fn test_initialize_rejects_indefinite_covariance() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pf = test_filter(FilterConfig::default());
        let mean = DMatrix::zeros(1, 2);
        let cov = vec![DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0])];
        assert!(matches!(
            pf.initialize_beliefs(&mut rng, &mean, &cov),
            Err(FilterError::CovarianceNotPositiveDefinite { batch_index: 0 })
        ));
        assert!(!pf.is_initialized());
    }

    #[test]
    fn test_initialize_rejects_shape_mismatch() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut pf = test_filter(FilterConfig::default());
        // Wrong state dimension in the mean.
        let mean = DMatrix::zeros(1, 3);
        let cov = vec![DMatrix::identity(3, 3)];
        assert!(matches!(
            pf.initialize_beliefs(&mut rng, &mean, &cov),
            Err(FilterError::ShapeMismatch { .. })
        ));
        // Covariance count disagrees with the mean rows.
        let mean = DMatrix::zeros(2, 2);
        let cov = vec![DMatrix::identity(2, 2)];
        assert!(matches!(
            pf.initialize_beliefs(&mut rng, &mean, &cov),
            Err(FilterError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rebalance_indices_exact_multiple() {
        let mut rng = StdRng::seed_from_u64(5);
        let indices = rebalance_indices(&mut rng, 2, 6);
        assert_eq!(indices, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_rebalance_indices_copy_then_sample() {
        // 2 particles expanding to 5: exactly 2 full cyclic copies plus one sampled slot.
        let mut rng = StdRng::seed_from_u64(6);
        let indices = rebalance_indices(&mut rng, 2, 5);
        assert_eq!(indices.len(), 5);
        assert_eq!(&indices[..4], &[0, 1, 0, 1]);
        assert!(indices[4] < 2);
    }

    #[test]
    fn test_rebalance_indices_contraction() {
        // Shrinking 5 -> 3 uses sampling without replacement only.
        let mut rng = StdRng::seed_from_u64(7);
        let indices = rebalance_indices(&mut rng, 5, 3);
        assert_eq!(indices.len(), 3);
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3, "indices must be distinct: {indices:?}");
    }

    #[test]
    fn test_rebalance_preserves_state_set() {
        let mut rng = StdRng::seed_from_u64(8);
        let belief = two_particle_belief();
        let rebalanced = rebalance_to_target(&mut rng, &belief, 5).unwrap();
        assert_eq!(rebalanced.particle_count(), 5);
        for j in 0..5 {
            let v = rebalanced.particle_states()[0][(j, 0)];
            assert!(v == 0.0 || v == 4.0, "fabricated state {v}");
        }
        let total: f64 = rebalanced
            .particle_log_weights()
            .row(0)
            .iter()
            .map(|lw| lw.exp())
            .sum();
        assert_approx_eq!(total, 1.0, 1e-12);
    }

    #[test]
    fn test_standard_resample_uniform_weights() {
        let mut rng = StdRng::seed_from_u64(9);
        let belief = two_particle_belief();
        let resampled = ResampleStrategy::Standard
            .resample(&mut rng, &belief, 8)
            .unwrap();
        assert_eq!(resampled.particle_count(), 8);
        let expected = -(8.0_f64).ln();
        for lw in resampled.particle_log_weights().iter() {
            assert_approx_eq!(*lw, expected, 1e-12);
        }
        for j in 0..8 {
            let v = resampled.particle_states()[0][(j, 0)];
            assert!(v == 0.0 || v == 4.0);
        }
    }

    #[test]
    fn test_standard_resample_prefers_heavy_particles() {
        // With weights [0.01, 0.99] nearly every draw should pick the second state.
        let mut rng = StdRng::seed_from_u64(10);
        let belief = BeliefState::new(
            vec![DMatrix::from_row_slice(2, 1, &[0.0, 4.0])],
            DMatrix::from_row_slice(1, 2, &[0.01_f64.ln(), 0.99_f64.ln()]),
        )
        .unwrap();
        let resampled = ResampleStrategy::Standard
            .resample(&mut rng, &belief, 1000)
            .unwrap();
        let heavy = (0..1000)
            .filter(|&j| resampled.particle_states()[0][(j, 0)] == 4.0)
            .count();
        assert!(heavy > 950, "only {heavy}/1000 draws picked the heavy particle");
    }

    #[test]
    fn test_soft_logits_alpha_near_one_match_weights() {
        let lw = DMatrix::from_row_slice(1, 3, &[-0.5, -1.5, -2.5]);
        let strategy = ResampleStrategy::Soft(1.0 - 1e-9);
        let logits = strategy.sampling_logits(&lw);
        for j in 0..3 {
            assert_approx_eq!(logits[(0, j)], lw[(0, j)], 1e-6);
        }
    }

    #[test]
    fn test_soft_logits_alpha_near_zero_uniform() {
        let lw = DMatrix::from_row_slice(1, 4, &[-0.01, -8.0, -12.0, -20.0]);
        let strategy = ResampleStrategy::Soft(1e-9);
        let logits = strategy.sampling_logits(&lw);
        let uniform = -(4.0_f64).ln();
        for j in 0..4 {
            assert_approx_eq!(logits[(0, j)], uniform, 1e-6);
        }
    }

    #[test]
    fn test_soft_resample_importance_correction() {
        let mut rng = StdRng::seed_from_u64(11);
        let belief = two_particle_belief();
        let strategy = ResampleStrategy::Soft(0.5);
        let resampled = strategy.resample(&mut rng, &belief, 6).unwrap();
        assert_eq!(resampled.particle_count(), 6);
        // Corrected weights stay normalized.
        let total: f64 = resampled
            .particle_log_weights()
            .row(0)
            .iter()
            .map(|lw| lw.exp())
            .sum();
        assert_approx_eq!(total, 1.0, 1e-12);
        // Every drawn particle carries the correction of its source index, so a
        // particle drawn from state 0 must have the state-0 corrected weight.
        let logits = strategy.sampling_logits(belief.particle_log_weights());
        let lw = belief.particle_log_weights();
        let corrections = [
            lw[(0, 0)] - logits[(0, 0)],
            lw[(0, 1)] - logits[(0, 1)],
        ];
        let lse = logsumexp(&{
            let rows: Vec<f64> = (0..6)
                .map(|j| {
                    let src = if resampled.particle_states()[0][(j, 0)] == 0.0 { 0 } else { 1 };
                    corrections[src]
                })
                .collect();
            rows
        });
        for j in 0..6 {
            let src = if resampled.particle_states()[0][(j, 0)] == 0.0 { 0 } else { 1 };
            assert_approx_eq!(
                resampled.particle_log_weights()[(0, j)],
                corrections[src] - lse,
                1e-12
            );
        }
    }

    #[test]
    fn test_strategy_from_alpha_selection() {
        assert_eq!(ResampleStrategy::from_alpha(1.0).unwrap(), ResampleStrategy::Standard);
        assert_eq!(
            ResampleStrategy::from_alpha(0.25).unwrap(),
            ResampleStrategy::Soft(0.25)
        );
        assert!(ResampleStrategy::from_alpha(0.0).is_err());
    }

    #[test]
    fn test_weighted_average_estimate_hand_case() {
        // weights [0.25, 0.75], states [[0], [4]] -> 0.25*0 + 0.75*4 = 3.0
        let belief = two_particle_belief();
        let est = EstimationMethod::WeightedAverage.estimate(&belief);
        assert_eq!(est.nrows(), 1);
        assert_eq!(est.ncols(), 1);
        assert_approx_eq!(est[(0, 0)], 3.0, 1e-12);
    }

    #[test]
    fn test_argmax_estimate_and_tie_break() {
        let belief = two_particle_belief();
        let est = EstimationMethod::Argmax.estimate(&belief);
        assert_eq!(est[(0, 0)], 4.0);

        // Exact tie: the first maximal particle wins.
        let tied = BeliefState::new(
            vec![DMatrix::from_row_slice(3, 1, &[7.0, 9.0, 11.0])],
            DMatrix::from_row_slice(1, 3, &[-1.0, -0.5, -0.5]),
        )
        .unwrap();
        let est = EstimationMethod::Argmax.estimate(&tied);
        assert_eq!(est[(0, 0)], 9.0);
    }

    #[test]
    fn test_effective_sample_size_bounds() {
        let uniform = BeliefState::new(
            vec![DMatrix::zeros(4, 1)],
            DMatrix::from_element(1, 4, -(4.0_f64).ln()),
        )
        .unwrap();
        assert_approx_eq!(uniform.effective_sample_size()[0], 4.0, 1e-9);

        let collapsed = BeliefState::new(
            vec![DMatrix::zeros(4, 1)],
            DMatrix::from_row_slice(1, 4, &[0.0, -1e9, -1e9, -1e9]),
        )
        .unwrap();
        assert_approx_eq!(collapsed.effective_sample_size()[0], 1.0, 1e-6);
    }

    #[test]
    fn test_weighted_covariance_hand_case() {
        let belief = two_particle_belief();
        // E[x] = 3, var = 0.25*9 + 0.75*1 = 3.0
        let cov = belief.weighted_covariance();
        assert_approx_eq!(cov[0][(0, 0)], 3.0, 1e-12);
    }

    #[test]
    fn test_resample_policy_resolution() {
        assert!(ResamplePolicy::Always.resolve(Phase::Train));
        assert!(ResamplePolicy::Always.resolve(Phase::Eval));
        assert!(!ResamplePolicy::Never.resolve(Phase::Train));
        assert!(!ResamplePolicy::Never.resolve(Phase::Eval));
        assert!(!ResamplePolicy::Adaptive.resolve(Phase::Train));
        assert!(ResamplePolicy::Adaptive.resolve(Phase::Eval));
    }

    #[test]
    fn test_step_keeps_weights_normalized() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut pf = initialized_filter(&mut rng, FilterConfig::default());
        let obs = InputBatch::Dense(DMatrix::zeros(3, 2));
        let ctrl = InputBatch::Dense(DMatrix::zeros(3, 1));
        let est = pf.step(&mut rng, &obs, &ctrl, Phase::Train).unwrap();
        assert_eq!(est.nrows(), 3);
        assert_eq!(est.ncols(), 2);
        let belief = pf.belief().unwrap();
        assert_eq!(belief.particle_count(), 100);
        for b in 0..3 {
            let total: f64 = belief
                .particle_log_weights()
                .row(b)
                .iter()
                .map(|lw| lw.exp())
                .sum();
            assert_approx_eq!(total, 1.0, 1e-9);
        }
    }

    #[test]
    fn test_step_eval_resamples_to_uniform() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut pf = initialized_filter(&mut rng, FilterConfig::default());
        let obs = InputBatch::Dense(DMatrix::zeros(3, 2));
        let ctrl = InputBatch::Dense(DMatrix::zeros(3, 1));
        pf.step(&mut rng, &obs, &ctrl, Phase::Eval).unwrap();
        let belief = pf.belief().unwrap();
        assert_eq!(belief.particle_count(), 100);
        let expected = -(100.0_f64).ln();
        for lw in belief.particle_log_weights().iter() {
            assert_approx_eq!(*lw, expected, 1e-12);
        }
    }

    #[test]
    fn test_failed_step_leaves_belief_unchanged() {
        let mut rng = StdRng::seed_from_u64(14);
        let mut pf = initialized_filter(&mut rng, FilterConfig::default());
        let before = pf.belief().unwrap().clone();
        // Observation batch of the wrong leading dimension.
        let obs = InputBatch::Dense(DMatrix::zeros(2, 2));
        let ctrl = InputBatch::Dense(DMatrix::zeros(3, 1));
        assert!(matches!(
            pf.step(&mut rng, &obs, &ctrl, Phase::Train),
            Err(FilterError::ShapeMismatch { .. })
        ));
        assert_eq!(pf.belief().unwrap(), &before);
    }

    #[test]
    fn test_step_rebalances_injected_belief() {
        let mut rng = StdRng::seed_from_u64(15);
        let config = FilterConfig {
            num_particles: 5,
            resample_policy: ResamplePolicy::Never,
            ..FilterConfig::default()
        };
        let mut pf = ParticleFilter::new(
            TestDynamics {
                dim: 1,
                noise_std: 0.1,
            },
            TestMeasurement { dim: 1 },
            config,
        )
        .unwrap();
        pf.set_belief(two_particle_belief()).unwrap();
        let obs = InputBatch::Dense(DMatrix::zeros(1, 1));
        let ctrl = InputBatch::Dense(DMatrix::zeros(1, 1));
        pf.step(&mut rng, &obs, &ctrl, Phase::Train).unwrap();
        assert_eq!(pf.belief().unwrap().particle_count(), 5);
    }

    #[test]
    fn test_set_belief_rejects_dim_mismatch() {
        let mut pf = test_filter(FilterConfig::default());
        // two_particle_belief is 1-dimensional; the filter expects 2.
        assert!(matches!(
            pf.set_belief(two_particle_belief()),
            Err(FilterError::ShapeMismatch { .. })
        ));
    }
}
