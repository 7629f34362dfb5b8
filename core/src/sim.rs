//! Linear-Gaussian reference models and a closed-form Kalman update.
//!
//! These models exist for simulation studies and for validating the particle filter:
//! on a linear system with Gaussian noise the exact posterior is available in closed
//! form, so a filter run can be checked against [`kalman_update`] to a statistical
//! tolerance. They also serve as the simplest complete example of implementing the
//! [`DynamicsModel`] and [`MeasurementModel`] traits.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};

use crate::FilterError;
use crate::linalg::{spd_cholesky_factor, symmetrize};
use crate::models::{DynamicsModel, InputBatch, MeasurementModel};

/// Linear state transition with additive Gaussian process noise:
/// `x' ~ N(A x + B u, Q)`.
pub struct LinearGaussianDynamics {
    transition: DMatrix<f64>,
    control: DMatrix<f64>,
    process_noise_tril: DMatrix<f64>,
}

impl LinearGaussianDynamics {
    /// Build the model from a transition matrix `A` (D x D), control matrix `B`
    /// (D x U), and process noise covariance `Q` (D x D, symmetric positive-definite).
    ///
    /// # Errors
    /// [`FilterError::InvalidConfig`] on inconsistent dimensions or a `Q` that fails
    /// its Cholesky factorization.
    pub fn new(
        transition: DMatrix<f64>,
        control: DMatrix<f64>,
        process_noise: DMatrix<f64>,
    ) -> Result<Self, FilterError> {
        let d = transition.nrows();
        if !transition.is_square() || d == 0 {
            return Err(FilterError::InvalidConfig(format!(
                "transition matrix must be square and non-empty, got {} x {}",
                transition.nrows(),
                transition.ncols()
            )));
        }
        if control.nrows() != d {
            return Err(FilterError::InvalidConfig(format!(
                "control matrix must have {} rows, got {}",
                d,
                control.nrows()
            )));
        }
        if process_noise.nrows() != d || process_noise.ncols() != d {
            return Err(FilterError::InvalidConfig(format!(
                "process noise must be {} x {}, got {} x {}",
                d,
                d,
                process_noise.nrows(),
                process_noise.ncols()
            )));
        }
        let process_noise_tril = spd_cholesky_factor(&process_noise).ok_or_else(|| {
            FilterError::InvalidConfig("process noise is not positive-definite".to_string())
        })?;
        Ok(LinearGaussianDynamics {
            transition,
            control,
            process_noise_tril,
        })
    }

    pub fn transition(&self) -> &DMatrix<f64> {
        &self.transition
    }

    pub fn control(&self) -> &DMatrix<f64> {
        &self.control
    }

    /// Process noise covariance, reconstructed from its stored factor.
    pub fn process_noise(&self) -> DMatrix<f64> {
        &self.process_noise_tril * self.process_noise_tril.transpose()
    }
}

impl DynamicsModel for LinearGaussianDynamics {
    fn state_dim(&self) -> usize {
        self.transition.nrows()
    }

    fn propagate(
        &self,
        initial_states: &DMatrix<f64>,
        controls: &InputBatch,
    ) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>), FilterError> {
        let u = controls.dense().ok_or_else(|| {
            FilterError::ModelContract(
                "linear-Gaussian dynamics require a dense control batch".to_string(),
            )
        })?;
        if u.ncols() != self.control.ncols() {
            return Err(FilterError::ModelContract(format!(
                "control batch has {} columns, model expects {}",
                u.ncols(),
                self.control.ncols()
            )));
        }
        if u.nrows() != initial_states.nrows() {
            return Err(FilterError::ModelContract(format!(
                "control batch has {} rows, states have {}",
                u.nrows(),
                initial_states.nrows()
            )));
        }
        let means = initial_states * self.transition.transpose() + u * self.control.transpose();
        let trils = vec![self.process_noise_tril.clone(); initial_states.nrows()];
        Ok((means, trils))
    }
}

/// Linear observation with additive Gaussian noise: `z ~ N(H x, R)`.
///
/// Scores states by the exact multivariate normal log-density of the observation,
/// with the Mahalanobis term evaluated through the Cholesky factor of `R`.
pub struct LinearGaussianMeasurement {
    observation: DMatrix<f64>,
    noise_tril: DMatrix<f64>,
    log_norm: f64,
}

impl LinearGaussianMeasurement {
    /// Build the model from an observation matrix `H` (Z x D) and measurement noise
    /// covariance `R` (Z x Z, symmetric positive-definite).
    ///
    /// # Errors
    /// [`FilterError::InvalidConfig`] on inconsistent dimensions or an `R` that fails
    /// its Cholesky factorization.
    pub fn new(observation: DMatrix<f64>, noise: DMatrix<f64>) -> Result<Self, FilterError> {
        let z = observation.nrows();
        if z == 0 || observation.ncols() == 0 {
            return Err(FilterError::InvalidConfig(format!(
                "observation matrix must be non-empty, got {} x {}",
                observation.nrows(),
                observation.ncols()
            )));
        }
        if noise.nrows() != z || noise.ncols() != z {
            return Err(FilterError::InvalidConfig(format!(
                "measurement noise must be {} x {}, got {} x {}",
                z,
                z,
                noise.nrows(),
                noise.ncols()
            )));
        }
        let noise_tril = spd_cholesky_factor(&noise).ok_or_else(|| {
            FilterError::InvalidConfig("measurement noise is not positive-definite".to_string())
        })?;
        // ln N(z; Hx, R) = -0.5 (z ln 2pi + ln det R) - 0.5 Mahalanobis^2, with
        // ln det R = 2 sum ln L_ii.
        let log_det: f64 = (0..z).map(|i| noise_tril[(i, i)].ln()).sum::<f64>() * 2.0;
        let log_norm = -0.5 * (z as f64 * (2.0 * std::f64::consts::PI).ln() + log_det);
        Ok(LinearGaussianMeasurement {
            observation,
            noise_tril,
            log_norm,
        })
    }

    pub fn observation_matrix(&self) -> &DMatrix<f64> {
        &self.observation
    }

    /// Measurement noise covariance, reconstructed from its stored factor.
    pub fn noise(&self) -> DMatrix<f64> {
        &self.noise_tril * self.noise_tril.transpose()
    }
}

impl MeasurementModel for LinearGaussianMeasurement {
    fn state_dim(&self) -> usize {
        self.observation.ncols()
    }

    fn score(
        &self,
        states: &[DMatrix<f64>],
        observations: &InputBatch,
    ) -> Result<DMatrix<f64>, FilterError> {
        let obs = observations.dense().ok_or_else(|| {
            FilterError::ModelContract(
                "linear-Gaussian measurement requires a dense observation batch".to_string(),
            )
        })?;
        let z_dim = self.observation.nrows();
        if obs.ncols() != z_dim {
            return Err(FilterError::ModelContract(format!(
                "observation batch has {} columns, model expects {}",
                obs.ncols(),
                z_dim
            )));
        }
        if obs.nrows() != states.len() {
            return Err(FilterError::ModelContract(format!(
                "observation batch has {} rows, states have {} batch rows",
                obs.nrows(),
                states.len()
            )));
        }
        let n = states.len();
        let m = states.first().map_or(0, |s| s.nrows());
        let mut ll = DMatrix::zeros(n, m);
        for (b, row_states) in states.iter().enumerate() {
            let z: DVector<f64> = obs.row(b).transpose();
            for j in 0..m {
                let x: DVector<f64> = row_states.row(j).transpose();
                let innovation = &z - &self.observation * x;
                let whitened = self
                    .noise_tril
                    .solve_lower_triangular(&innovation)
                    .ok_or_else(|| {
                        FilterError::ModelContract(
                            "measurement noise factor is singular".to_string(),
                        )
                    })?;
                ll[(b, j)] = self.log_norm - 0.5 * whitened.norm_squared();
            }
        }
        Ok(ll)
    }
}

/// One predict-update cycle of the exact Kalman filter for the same linear-Gaussian
/// system, returning the posterior mean and covariance.
///
/// # Arguments
/// * `prior_mean`, `prior_covariance` - Gaussian prior over the state
/// * `dynamics`, `measurement` - the linear-Gaussian model pair
/// * `control` - control vector `u` for the predict step
/// * `observation` - observation vector `z` for the update step
///
/// # Errors
/// [`FilterError::InvalidConfig`] on dimension mismatches,
/// [`FilterError::CovarianceNotPositiveDefinite`] if the innovation covariance cannot
/// be factored.
pub fn kalman_update(
    prior_mean: &DVector<f64>,
    prior_covariance: &DMatrix<f64>,
    dynamics: &LinearGaussianDynamics,
    control: &DVector<f64>,
    measurement: &LinearGaussianMeasurement,
    observation: &DVector<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>), FilterError> {
    let d = dynamics.state_dim();
    if prior_mean.len() != d || prior_covariance.nrows() != d || prior_covariance.ncols() != d {
        return Err(FilterError::InvalidConfig(
            "prior dimensions disagree with the dynamics model".to_string(),
        ));
    }
    if measurement.state_dim() != d {
        return Err(FilterError::InvalidConfig(
            "measurement state dimension disagrees with the dynamics model".to_string(),
        ));
    }
    if control.len() != dynamics.control().ncols() {
        return Err(FilterError::InvalidConfig(
            "control vector length disagrees with the control matrix".to_string(),
        ));
    }
    let h = measurement.observation_matrix();
    if observation.len() != h.nrows() {
        return Err(FilterError::InvalidConfig(
            "observation vector length disagrees with the observation matrix".to_string(),
        ));
    }

    // Predict.
    let a = dynamics.transition();
    let predicted_mean = a * prior_mean + dynamics.control() * control;
    let predicted_cov = symmetrize(&(a * prior_covariance * a.transpose() + dynamics.process_noise()));

    // Update.
    let innovation = observation - h * &predicted_mean;
    let s = symmetrize(&(h * &predicted_cov * h.transpose() + measurement.noise()));
    let ch = Cholesky::new(s).ok_or(FilterError::CovarianceNotPositiveDefinite {
        batch_index: 0,
    })?;
    // K = P H^T S^-1, computed as (S^-1 H P)^T since P is symmetric.
    let gain = ch.solve(&(h * &predicted_cov)).transpose();
    let posterior_mean = &predicted_mean + &gain * innovation;
    let identity = DMatrix::identity(d, d);
    let posterior_cov = symmetrize(&((identity - &gain * h) * predicted_cov));
    Ok((posterior_mean, posterior_cov))
}

/* =============================== Tests ==================================== */
