//! Convergence diagnostics: split R-hat, effective sample size, divergence
//! and saturation counts, E-BFMI.

use crate::chain::Chain;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::fmt;

/// Summary over the surviving chains of a run.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    /// Split R-hat per coordinate.
    pub split_rhat: Vec<f64>,
    /// Effective sample size per coordinate.
    pub ess: Vec<f64>,
    /// Divergent transitions per chain.
    pub divergences: Vec<usize>,
    pub total_divergences: usize,
    /// Transitions that used the full depth budget.
    pub max_depth_hits: usize,
    /// Energy Bayesian fraction of missing information, per chain.
    pub ebfmi: Vec<f64>,
}

impl Diagnostics {
    pub fn compute(chains: &[Chain]) -> Self {
        let dim = chains.first().map(|c| c.dim()).unwrap_or(0);

        let mut split_rhat = Vec::with_capacity(dim);
        let mut ess_vals = Vec::with_capacity(dim);
        for p in 0..dim {
            let per_chain: Vec<Vec<f64>> = chains.iter().map(|c| c.param_draws(p)).collect();
            let refs: Vec<&[f64]> = per_chain.iter().map(|c| c.as_slice()).collect();
            split_rhat.push(split_r_hat(&refs));
            ess_vals.push(ess(&refs));
        }

        let divergences: Vec<usize> = chains.iter().map(|c| c.divergence_count()).collect();
        let total_divergences = divergences.iter().sum();
        let max_depth_hits = chains.iter().map(|c| c.max_depth_hits()).sum();
        let ebfmi_vals = chains.iter().map(|c| ebfmi(&c.energies())).collect();

        Self {
            split_rhat,
            ess: ess_vals,
            divergences,
            total_divergences,
            max_depth_hits,
            ebfmi: ebfmi_vals,
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "parameter  split_rhat  ess")?;
        for (p, (r, e)) in self.split_rhat.iter().zip(&self.ess).enumerate() {
            writeln!(f, "{p:>9}  {r:>10.4}  {e:>8.1}")?;
        }
        writeln!(f, "divergences: {:?} (total {})", self.divergences, self.total_divergences)?;
        writeln!(f, "max-depth hits: {}", self.max_depth_hits)?;
        write!(f, "e-bfmi: {:?}", self.ebfmi)
    }
}

/// Halves each chain and truncates to a common length.
fn split_halves<'a>(chains: &[&'a [f64]]) -> Option<Vec<&'a [f64]>> {
    if chains.is_empty() {
        return None;
    }
    let mut halves = Vec::with_capacity(chains.len() * 2);
    for c in chains {
        if c.len() < 4 {
            return None;
        }
        let mid = c.len() / 2;
        halves.push(&c[..mid]);
        halves.push(&c[mid..]);
    }
    let min_len = halves.iter().map(|c| c.len()).min()?;
    if min_len < 2 {
        return None;
    }
    Some(halves.into_iter().map(|c| &c[..min_len]).collect())
}

/// Split R-hat (Gelman et al.): each chain is halved, then
/// `R = sqrt(var_hat_plus / W)` with `var_hat_plus = (n-1)/n * W + B/n`.
///
/// Returns NaN for degenerate input (fewer than four draws per chain, or
/// zero within-chain variance).
pub fn split_r_hat(chains: &[&[f64]]) -> f64 {
    let halves = match split_halves(chains) {
        Some(h) => h,
        None => return f64::NAN,
    };

    let m = halves.len() as f64;
    let n = halves[0].len() as f64;

    let means: Vec<f64> = halves
        .iter()
        .map(|c| c.iter().sum::<f64>() / c.len() as f64)
        .collect();
    let grand_mean = means.iter().sum::<f64>() / m;

    let b = means
        .iter()
        .map(|&mu| (mu - grand_mean).powi(2))
        .sum::<f64>()
        * n
        / (m - 1.0);

    let w = halves
        .iter()
        .zip(&means)
        .map(|(c, &mu)| c.iter().map(|&x| (x - mu).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;

    if w < 1e-30 {
        return f64::NAN;
    }

    let var_hat_plus = (n - 1.0) / n * w + b / n;
    (var_hat_plus / w).sqrt()
}

/// Biased autocovariance of `x` for lags `0..max_lag`, computed via FFT.
fn autocovariance(x: &[f64], max_lag: usize) -> Vec<f64> {
    let n = x.len();
    let mean = x.iter().sum::<f64>() / n as f64;

    let padded = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(padded)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(padded).process(&mut buf);
    for v in buf.iter_mut() {
        *v = Complex::new(v.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(padded).process(&mut buf);

    // Inverse transform is unnormalized; the estimator divides by n, not
    // by the number of overlapping terms.
    let scale = 1.0 / (padded as f64 * n as f64);
    (0..=max_lag.min(n - 1)).map(|t| buf[t].re * scale).collect()
}

/// Effective sample size across chains.
///
/// Chains are split in half; lag correlations come from FFT
/// autocovariances combined with the between-chain variance, and the sum is
/// truncated by Geyer's initial monotone positive pair rule. The result is
/// clamped to `[1, total draws]`.
pub fn ess(chains: &[&[f64]]) -> f64 {
    let halves = match split_halves(chains) {
        Some(h) => h,
        None => return 0.0,
    };

    let m = halves.len();
    let n = halves[0].len();
    let total = (m * n) as f64;

    let max_lag = n - 1;
    let autocovs: Vec<Vec<f64>> = halves.iter().map(|c| autocovariance(c, max_lag)).collect();

    // Within-chain variance from the unbiased scaling of lag 0.
    let vars: Vec<f64> = autocovs
        .iter()
        .map(|a| a[0] * n as f64 / (n as f64 - 1.0))
        .collect();
    let w = vars.iter().sum::<f64>() / m as f64;

    let means: Vec<f64> = halves
        .iter()
        .map(|c| c.iter().sum::<f64>() / n as f64)
        .collect();
    let grand_mean = means.iter().sum::<f64>() / m as f64;
    let b = means
        .iter()
        .map(|&mu| (mu - grand_mean).powi(2))
        .sum::<f64>()
        * n as f64
        / (m as f64 - 1.0);

    let var_hat_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    if !var_hat_plus.is_finite() || var_hat_plus < 1e-30 {
        return total;
    }

    // Cross-chain lag correlations.
    let mut rho = Vec::with_capacity(max_lag);
    for lag in 1..=max_lag {
        let c_lag = autocovs.iter().map(|a| a[lag]).sum::<f64>() / m as f64;
        let r = (1.0 - (w - c_lag) / var_hat_plus).clamp(-1.0, 1.0);
        rho.push(r);
    }

    // Geyer: sum consecutive pairs while positive, enforce monotone decay.
    let mut gammas: Vec<f64> = Vec::new();
    let mut i = 0;
    while i + 1 < rho.len() {
        let g = rho[i] + rho[i + 1];
        if g < 0.0 {
            break;
        }
        gammas.push(g);
        i += 2;
    }
    for k in 1..gammas.len() {
        if gammas[k] > gammas[k - 1] {
            gammas[k] = gammas[k - 1];
        }
    }

    let mut tau = 1.0;
    for g in gammas {
        tau += 2.0 * g;
    }
    if !tau.is_finite() || tau <= 0.0 {
        return total;
    }

    (total / tau).clamp(1.0, total)
}

/// E-BFMI of one chain: `mean((E_t - E_{t-1})^2) / var(E)`.
pub fn ebfmi(energies: &[f64]) -> f64 {
    let n = energies.len();
    if n < 4 {
        return f64::NAN;
    }
    let mean = energies.iter().sum::<f64>() / n as f64;
    let var = energies.iter().map(|&e| (e - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    if var < 1e-30 {
        return f64::NAN;
    }
    let num = energies
        .windows(2)
        .map(|w| (w[1] - w[0]).powi(2))
        .sum::<f64>()
        / (n as f64 - 1.0);
    num / var
}
