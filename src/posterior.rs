//! Composition of a target density with its parameter transform.
//!
//! The sampler works in unconstrained space; [`Posterior`] glues a
//! [`GradientTarget`] (constrained space) to a [`ParameterTransform`] and
//! applies the log-Jacobian correction and its gradient.

use crate::distributions::GradientTarget;
use crate::error::{Error, NonFiniteDensity, Result};
use crate::transform::ParameterTransform;

/// Unconstrained-space view of a target density.
pub struct Posterior<T> {
    target: T,
    transform: ParameterTransform,
}

impl<T: GradientTarget> Posterior<T> {
    /// Pairs a target with its transform; dimensions must agree.
    pub fn new(target: T, transform: ParameterTransform) -> Result<Self> {
        if target.dim() != transform.dim() {
            return Err(Error::InvalidTransform(format!(
                "target has {} parameters but transform covers {}",
                target.dim(),
                transform.dim()
            )));
        }
        Ok(Self { target, transform })
    }

    pub fn dim(&self) -> usize {
        self.transform.dim()
    }

    pub fn transform(&self) -> &ParameterTransform {
        &self.transform
    }

    /// Maps an unconstrained point to constrained space.
    pub fn to_constrained(&self, z: &[f64]) -> Vec<f64> {
        self.transform.to_constrained(z)
    }

    /// Maps a constrained point to unconstrained space.
    pub fn to_unconstrained(&self, theta: &[f64]) -> Vec<f64> {
        self.transform.to_unconstrained(theta)
    }

    /// Log posterior density and gradient in unconstrained space:
    /// `logp(z) = logp_target(T(z)) + log|J(z)|`.
    ///
    /// Any non-finite value or gradient component surfaces as
    /// [`NonFiniteDensity`]; callers decide whether that means a divergent
    /// step or a failed initialization.
    pub fn logp_and_grad(
        &self,
        z: &[f64],
        grad: &mut [f64],
    ) -> std::result::Result<f64, NonFiniteDensity> {
        let theta = self.transform.to_constrained(z);
        let mut grad_theta = vec![0.0; z.len()];
        let logp_theta = self.target.logp_and_grad(&theta, &mut grad_theta);

        let logp = logp_theta + self.transform.log_abs_det_jacobian(z);
        if !logp.is_finite() {
            return Err(NonFiniteDensity);
        }

        let jac = self.transform.jacobian_diag(z);
        let grad_log_jac = self.transform.grad_log_abs_det(z);
        for i in 0..z.len() {
            grad[i] = grad_theta[i] * jac[i] + grad_log_jac[i];
            if !grad[i].is_finite() {
                return Err(NonFiniteDensity);
            }
        }
        Ok(logp)
    }
}
