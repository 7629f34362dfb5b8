//! Sequential Monte Carlo (particle) state estimation toolbox
//!
//! This crate implements a differentiable particle filter: a weighted population of
//! hypothesized states ("particles") approximating a posterior belief distribution over
//! a hidden state, updated one timestep at a time from a stream of control inputs and
//! observations. It is aimed at state estimation and tracking problems (e.g. localization)
//! where the state transition and observation likelihood are themselves learnable,
//! differentiable functions supplied by the caller.
//!
//! The filter itself only owns the belief update: initialization from a Gaussian prior,
//! per-timestep propagation, reweighting and estimation, and the resampling/rebalancing
//! logic (standard, soft, and particle-count-adjustment variants). The two probabilistic
//! models it consumes are behind traits:
//!
//! - [`models::DynamicsModel`]: maps a batch of states and controls to a predicted mean
//!   and a lower-triangular covariance factor per state, from which the next state is
//!   sampled via the reparameterized transform `mean + L z`, `z ~ N(0, I)`.
//! - [`models::MeasurementModel`]: scores a batch of candidate states against the current
//!   observation, returning one log-likelihood per particle.
//!
//! Weight arithmetic is carried out entirely in log space with log-sum-exp
//! normalization so that long sequences of small likelihoods stay numerically stable.
//! Soft resampling follows Karkus et al., "Particle Filter Networks with Application to
//! Visual Localization" (<https://arxiv.org/abs/1805.08975>): sampling from a mixture of
//! the true weights and a uniform distribution, with an importance-correction factor
//! that preserves a differentiable pathway through the resampling step.
//!
//! Primarily built off of three crate dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filters.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   Provide random number generation for Gaussian sampling, permutations, and
//!   categorical resampling draws. Generators are always passed in explicitly so runs
//!   are reproducible under a seeded [`rand::rngs::StdRng`].
//!
//! ## Crate overview
//!
//! - [`linalg`]: log-sum-exp helpers, SPD Cholesky factorization, and reparameterized
//!   multivariate normal sampling.
//! - [`models`]: the [`models::InputBatch`] container for batched controls/observations
//!   and the dynamics/measurement model trait seams.
//! - [`particle`]: the belief state, configuration, resampling strategies, and the
//!   [`particle::ParticleFilter`] itself.
//! - [`sim`]: linear-Gaussian reference models and a closed-form Kalman update, used for
//!   simulation studies and for validating the filter against an analytic posterior.
//!
//! ## Batch conventions
//!
//! The filter processes `N` independent estimation tracks jointly. Particle states are
//! conceptually a `(N, M, D)` array (N batch rows, M particles, D state dimensions),
//! stored as `N` matrices of shape `M x D`; log-weights are a single `N x M` matrix.
//! Whenever particles are flattened for a dynamics call, rows are ordered batch-major
//! with the particle index varying fastest, and per-batch controls are expanded by
//! interleaved repetition so each particle receives its row's control.

use thiserror::Error;

pub mod linalg;
pub mod models;
pub mod particle;
pub mod sim;

/// Errors produced by filter construction and stepping.
///
/// All failures are deterministic given the inputs: there is nothing to retry. A failed
/// call never leaves the filter in a partially updated state; the belief from before the
/// failing call remains valid.
#[derive(Debug, Clone, Error)]
pub enum FilterError {
    /// A stepping operation was called before `initialize_beliefs`.
    #[error("filter not initialized: call initialize_beliefs first")]
    NotInitialized,
    /// Input dimensions are inconsistent with the filter or with each other.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },
    /// A covariance matrix failed its Cholesky factorization.
    #[error("covariance for batch row {batch_index} is not positive-definite")]
    CovarianceNotPositiveDefinite { batch_index: usize },
    /// Rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A dynamics or measurement model returned outputs violating its contract.
    #[error("model contract violation: {0}")]
    ModelContract(String),
    /// Particle weights collapsed to an unnormalizable state (all zero or non-finite).
    #[error("degenerate particle weights in batch row {batch_index}")]
    DegenerateWeights { batch_index: usize },
    /// An `InputBatch` was empty or had an inconsistent leading dimension.
    #[error("invalid input batch: {0}")]
    InvalidInput(&'static str),
}
