//! Target densities and the traits the sampler consumes.
//!
//! The engine only ever sees a [`GradientTarget`]: a log density over the
//! constrained parameters together with its gradient. How that gradient is
//! produced is the caller's business (analytic derivation, an autodiff
//! backend, or the [`NumericalGradient`] fallback below).

/// A log density with externally supplied gradients.
///
/// Implementations may return NaN or `-inf` outside the support; the sampler
/// treats such evaluations as divergent steps rather than errors.
pub trait GradientTarget: Sync {
    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Evaluates the log density at `theta` and writes its gradient into
    /// `grad` (length `dim()`). Returns the log density value.
    fn logp_and_grad(&self, theta: &[f64], grad: &mut [f64]) -> f64;
}

/// A plain log density without gradients.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;
    fn log_density(&self, theta: &[f64]) -> f64;
}

/// Central-difference gradient adapter for value-only targets.
///
/// Turns any [`LogDensity`] into a [`GradientTarget`] at the cost of
/// `2 * dim` extra evaluations per gradient.
pub struct NumericalGradient<F> {
    inner: F,
    step: f64,
}

impl<F: LogDensity> NumericalGradient<F> {
    /// Wraps `inner` with step size `1e-6` per coordinate.
    pub fn new(inner: F) -> Self {
        Self { inner, step: 1e-6 }
    }

    pub fn with_step(inner: F, step: f64) -> Self {
        Self { inner, step }
    }
}

impl<F: LogDensity> GradientTarget for NumericalGradient<F> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn logp_and_grad(&self, theta: &[f64], grad: &mut [f64]) -> f64 {
        let mut point = theta.to_vec();
        for i in 0..theta.len() {
            point[i] = theta[i] + self.step;
            let fp = self.inner.log_density(&point);
            point[i] = theta[i] - self.step;
            let fm = self.inner.log_density(&point);
            point[i] = theta[i];
            grad[i] = (fp - fm) / (2.0 * self.step);
        }
        self.inner.log_density(theta)
    }
}

/// Beta-Binomial model: `s` successes out of `n` trials with a
/// `Beta(alpha, beta)` prior on the success probability.
///
/// The single parameter is the success probability on `(0, 1)`; the
/// normalizing constant is dropped. The conjugate posterior
/// `Beta(alpha + s, beta + n - s)` is exposed through
/// [`Self::posterior_mean`] and [`Self::posterior_sd`] as an analytic
/// reference; the sampler itself never uses it.
#[derive(Debug, Clone, Copy)]
pub struct BetaBinomial {
    pub alpha: f64,
    pub beta: f64,
    pub successes: u64,
    pub trials: u64,
}

impl BetaBinomial {
    pub fn new(alpha: f64, beta: f64, successes: u64, trials: u64) -> Self {
        assert!(successes <= trials);
        Self {
            alpha,
            beta,
            successes,
            trials,
        }
    }

    /// Mean of the conjugate posterior `Beta(alpha + s, beta + n - s)`.
    pub fn posterior_mean(&self) -> f64 {
        let a = self.alpha + self.successes as f64;
        let b = self.beta + (self.trials - self.successes) as f64;
        a / (a + b)
    }

    /// Standard deviation of the conjugate posterior.
    pub fn posterior_sd(&self) -> f64 {
        let a = self.alpha + self.successes as f64;
        let b = self.beta + (self.trials - self.successes) as f64;
        let s = a + b;
        (a * b / (s * s * (s + 1.0))).sqrt()
    }
}

impl GradientTarget for BetaBinomial {
    fn dim(&self) -> usize {
        1
    }

    fn logp_and_grad(&self, theta: &[f64], grad: &mut [f64]) -> f64 {
        let p = theta[0];
        if p <= 0.0 || p >= 1.0 {
            grad[0] = f64::NAN;
            return f64::NEG_INFINITY;
        }
        let a = self.alpha - 1.0 + self.successes as f64;
        let b = self.beta - 1.0 + (self.trials - self.successes) as f64;
        grad[0] = a / p - b / (1.0 - p);
        a * p.ln() + b * (1.0 - p).ln()
    }
}

/// Independent Gaussian with per-coordinate mean and standard deviation,
/// up to the normalizing constant.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    pub mean: Vec<f64>,
    pub sigma: Vec<f64>,
}

impl DiagonalGaussian {
    pub fn new(mean: Vec<f64>, sigma: Vec<f64>) -> Self {
        assert_eq!(mean.len(), sigma.len());
        assert!(sigma.iter().all(|&s| s > 0.0));
        Self { mean, sigma }
    }

    /// Standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            sigma: vec![1.0; dim],
        }
    }
}

impl GradientTarget for DiagonalGaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn logp_and_grad(&self, theta: &[f64], grad: &mut [f64]) -> f64 {
        let mut logp = 0.0;
        for i in 0..theta.len() {
            let z = (theta[i] - self.mean[i]) / self.sigma[i];
            logp -= 0.5 * z * z;
            grad[i] = -z / self.sigma[i];
        }
        logp
    }
}

/// Improper flat density: log density 0 everywhere, zero gradient.
///
/// Useless as a posterior, but on a flat potential the leapfrog integrator
/// is exact, which makes this the reference target for energy-conservation
/// checks.
#[derive(Debug, Clone, Copy)]
pub struct Flat {
    pub dim: usize,
}

impl GradientTarget for Flat {
    fn dim(&self) -> usize {
        self.dim
    }

    fn logp_and_grad(&self, _theta: &[f64], grad: &mut [f64]) -> f64 {
        grad.fill(0.0);
        0.0
    }
}
