//! Leapfrog integration of Hamiltonian dynamics with a diagonal metric.

use crate::distributions::GradientTarget;
use crate::error::NonFiniteDensity;
use crate::posterior::Posterior;
use rand::Rng;
use rand_distr::StandardNormal;

/// Diagonal mass matrix.
///
/// Stores the inverse diagonal `M^-1` (the estimated posterior variance) and
/// the momentum standard deviations `sqrt(M)`, which is all the integrator
/// and the momentum refresh ever need.
#[derive(Debug, Clone)]
pub struct MassMatrix {
    inv: Vec<f64>,
    momentum_sd: Vec<f64>,
}

impl MassMatrix {
    /// Unit metric.
    pub fn identity(dim: usize) -> Self {
        Self {
            inv: vec![1.0; dim],
            momentum_sd: vec![1.0; dim],
        }
    }

    /// Metric from per-coordinate posterior variance estimates, which become
    /// the inverse mass diagonal. Variances must be positive; the adapter
    /// guarantees this by clamping.
    pub fn from_variances(var: &[f64]) -> Self {
        Self {
            inv: var.to_vec(),
            momentum_sd: var.iter().map(|&v| 1.0 / v.sqrt()).collect(),
        }
    }

    pub fn dim(&self) -> usize {
        self.inv.len()
    }

    /// Inverse mass diagonal `M^-1`.
    pub fn inv(&self) -> &[f64] {
        &self.inv
    }

    /// Mass diagonal `M`.
    pub fn diagonal(&self) -> Vec<f64> {
        self.inv.iter().map(|&v| 1.0 / v).collect()
    }

    /// Kinetic energy `0.5 * p^T M^-1 p`.
    pub fn kinetic(&self, p: &[f64]) -> f64 {
        0.5 * p
            .iter()
            .zip(&self.inv)
            .map(|(&pi, &mi)| pi * pi * mi)
            .sum::<f64>()
    }

    /// Draws `p ~ N(0, M)` into `out`.
    pub fn sample_momentum(&self, rng: &mut impl Rng, out: &mut [f64]) {
        for (o, &sd) in out.iter_mut().zip(&self.momentum_sd) {
            let n: f64 = rng.sample(StandardNormal);
            *o = sd * n;
        }
    }
}

/// A point in phase space together with the cached potential and its
/// gradient at `q`.
#[derive(Debug, Clone)]
pub struct State {
    pub q: Vec<f64>,
    pub p: Vec<f64>,
    /// `-logp(q)`.
    pub potential: f64,
    /// Gradient of the potential at `q`.
    pub grad_potential: Vec<f64>,
}

impl State {
    /// Total energy `H(q, p) = potential + kinetic`.
    pub fn hamiltonian(&self, mass: &MassMatrix) -> f64 {
        self.potential + mass.kinetic(&self.p)
    }
}

/// Leapfrog integrator bound to a posterior, a step size, and a metric.
pub struct Leapfrog<'a, T> {
    posterior: &'a Posterior<T>,
    pub step_size: f64,
    pub mass: MassMatrix,
}

impl<'a, T: GradientTarget> Leapfrog<'a, T> {
    pub fn new(posterior: &'a Posterior<T>, step_size: f64, mass: MassMatrix) -> Self {
        Self {
            posterior,
            step_size,
            mass,
        }
    }

    /// Evaluates the posterior at `q` and builds a state with zero momentum.
    pub fn init_state(&self, q: Vec<f64>) -> Result<State, NonFiniteDensity> {
        let dim = q.len();
        let mut grad = vec![0.0; dim];
        let logp = self.posterior.logp_and_grad(&q, &mut grad)?;
        for g in &mut grad {
            *g = -*g;
        }
        Ok(State {
            q,
            p: vec![0.0; dim],
            potential: -logp,
            grad_potential: grad,
        })
    }

    /// One leapfrog step of size `direction * step_size` (half kick, drift,
    /// half kick), updating `state` in place.
    ///
    /// On a non-finite evaluation the state is left unchanged and the signal
    /// is passed to the caller, which treats the step as divergent.
    pub fn step_dir(&self, state: &mut State, direction: i32) -> Result<(), NonFiniteDensity> {
        let eps = self.step_size * direction as f64;
        let dim = state.q.len();

        let mut p = state.p.clone();
        for i in 0..dim {
            p[i] -= 0.5 * eps * state.grad_potential[i];
        }

        let mut q = state.q.clone();
        for i in 0..dim {
            q[i] += eps * self.mass.inv()[i] * p[i];
        }

        let mut grad = vec![0.0; dim];
        let logp = self.posterior.logp_and_grad(&q, &mut grad)?;
        for g in &mut grad {
            *g = -*g;
        }

        for i in 0..dim {
            p[i] -= 0.5 * eps * grad[i];
        }

        state.q = q;
        state.p = p;
        state.potential = -logp;
        state.grad_potential = grad;
        Ok(())
    }
}
