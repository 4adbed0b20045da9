//! Warmup adaptation: dual-averaging step size and Welford mass matrix.
//!
//! The schedule follows the usual windowed layout: an initial buffer tuning
//! only the step size, a series of doubling "slow" windows collecting
//! variance for the mass matrix, and a terminal buffer that re-settles the
//! step size against the final metric.

use crate::distributions::GradientTarget;
use crate::integrator::{Leapfrog, MassMatrix};
use crate::posterior::Posterior;

/// Smallest admissible posterior variance per coordinate. Anything below
/// (a stuck coordinate, a constant draw sequence) is clamped and flagged.
pub const VARIANCE_FLOOR: f64 = 1e-10;

/// Dual averaging on the log step size (Hoffman & Gelman 2014, Stan variant).
pub struct DualAveraging {
    target_accept: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    step: usize,
}

impl DualAveraging {
    pub fn new(target_accept: f64, init_eps: f64) -> Self {
        let log_eps0 = init_eps.ln();
        Self {
            target_accept,
            log_eps: log_eps0,
            log_eps_bar: log_eps0,
            h_bar: 0.0,
            mu: (10.0 * init_eps).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            step: 0,
        }
    }

    /// Feeds one observed acceptance statistic.
    pub fn update(&mut self, accept_prob: f64) {
        self.step += 1;
        let m = self.step as f64;
        let w = 1.0 / (m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_prob);

        self.log_eps = self.mu - (m.sqrt() / self.gamma) * self.h_bar;
        let m_kappa = m.powf(-self.kappa);
        self.log_eps_bar = m_kappa * self.log_eps + (1.0 - m_kappa) * self.log_eps_bar;
    }

    /// Step size to use while still adapting.
    pub fn current_step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed step size; what the sampling phase freezes to.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    /// Restarts adaptation around a new step size.
    pub fn reset(&mut self, init_eps: f64) {
        self.log_eps = init_eps.ln();
        self.log_eps_bar = init_eps.ln();
        self.h_bar = 0.0;
        self.mu = (10.0 * init_eps).ln();
        self.step = 0;
    }
}

/// Welford online mean/variance per coordinate.
pub struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..x.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = x[i] - self.mean[i];
            self.m2[i] += delta * delta2;
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample variance per coordinate; all ones until two samples are in.
    pub fn variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![1.0; self.mean.len()];
        }
        let n = self.count as f64;
        self.m2.iter().map(|&m| m / (n - 1.0)).collect()
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        self.count = 0;
    }
}

/// Windowed warmup schedule as `(start, end)` iteration ranges.
///
/// Layout for e.g. 1000 warmup iterations: `0..75` step size only,
/// `75..100`, `100..150`, `150..250`, `250..450`, `450..950` doubling slow
/// windows, `950..1000` terminal step-size buffer. Warmup shorter than 50
/// iterations adapts step size only.
pub fn compute_windows(n_warmup: usize) -> Vec<(usize, usize)> {
    if n_warmup < 50 {
        return vec![(0, n_warmup)];
    }

    let init_buffer = 75.min(n_warmup / 5);
    let term_buffer = 50.min(n_warmup / 5);
    let slow_size = n_warmup.saturating_sub(init_buffer + term_buffer);

    let mut windows = vec![(0, init_buffer)];

    if slow_size > 0 {
        let mut start = init_buffer;
        let mut size = slow_size.min(25).max(1);
        while start + size < init_buffer + slow_size {
            let end = (start + size).min(init_buffer + slow_size);
            windows.push((start, end));
            start = end;
            size *= 2;
        }
        // Last slow window absorbs the remainder.
        if start < init_buffer + slow_size {
            windows.push((start, init_buffer + slow_size));
        }
    }

    if term_buffer > 0 {
        windows.push((init_buffer + slow_size, n_warmup));
    }

    windows
}

/// Combined step-size and mass-matrix adaptation over a warmup schedule.
pub struct WarmupAdapter {
    dual_avg: DualAveraging,
    welford: WelfordVariance,
    windows: Vec<(usize, usize)>,
    current_window: usize,
    mass: MassMatrix,
    mass_clamped: bool,
}

impl WarmupAdapter {
    pub fn new(dim: usize, n_warmup: usize, target_accept: f64, init_eps: f64) -> Self {
        Self {
            dual_avg: DualAveraging::new(target_accept, init_eps),
            welford: WelfordVariance::new(dim),
            windows: compute_windows(n_warmup),
            current_window: 0,
            mass: MassMatrix::identity(dim),
            mass_clamped: false,
        }
    }

    /// Feeds one warmup iteration: the post-transition position and the
    /// transition's acceptance statistic.
    ///
    /// Returns `true` when a slow window just closed and the mass matrix was
    /// rebuilt; the chain runner then re-searches the step size.
    pub fn update(&mut self, iter: usize, q: &[f64], accept_prob: f64) -> bool {
        self.dual_avg.update(accept_prob);

        let mut mass_updated = false;

        if self.current_window < self.windows.len() {
            let (_, end) = self.windows[self.current_window];

            // Variance is collected only in slow windows (neither the first
            // nor the last window).
            let is_slow =
                self.current_window > 0 && self.current_window < self.windows.len() - 1;
            if is_slow {
                self.welford.update(q);
            }

            if iter + 1 >= end {
                if is_slow {
                    let mut var = self.welford.variance();
                    for v in &mut var {
                        if !v.is_finite() || *v < VARIANCE_FLOOR {
                            *v = VARIANCE_FLOOR;
                            self.mass_clamped = true;
                        }
                    }
                    self.mass = MassMatrix::from_variances(&var);
                    self.welford.reset();
                    mass_updated = true;
                }

                let eps = self.dual_avg.adapted_step_size();
                self.dual_avg.reset(eps);
                self.current_window += 1;
            }
        }

        mass_updated
    }

    pub fn step_size(&self) -> f64 {
        self.dual_avg.current_step_size()
    }

    pub fn adapted_step_size(&self) -> f64 {
        self.dual_avg.adapted_step_size()
    }

    /// Restarts dual averaging around `eps`, keeping the schedule position.
    pub fn reset_step_size(&mut self, eps: f64) {
        self.dual_avg.reset(eps);
    }

    pub fn mass(&self) -> &MassMatrix {
        &self.mass
    }

    /// Whether any variance estimate had to be clamped to the floor.
    pub fn mass_clamped(&self) -> bool {
        self.mass_clamped
    }
}

/// Doubles or halves a trial step size until the single-step acceptance
/// probability crosses 0.5 (Hoffman & Gelman 2014, Algorithm 4).
///
/// Deterministic: probes with unit momentum so that chain reproducibility
/// does not depend on extra RNG draws.
pub fn find_reasonable_step_size<T: GradientTarget>(
    posterior: &Posterior<T>,
    q: &[f64],
    mass: &MassMatrix,
) -> f64 {
    let probe = Leapfrog::new(posterior, 1.0, mass.clone());
    let mut state = match probe.init_state(q.to_vec()) {
        Ok(s) => s,
        Err(_) => return 0.01,
    };
    for p in &mut state.p {
        *p = 1.0;
    }
    let h0 = state.hamiltonian(mass);

    let test_accept = |eps_test: f64| -> Option<f64> {
        let trial = Leapfrog::new(posterior, eps_test, mass.clone());
        let mut s = state.clone();
        trial.step_dir(&mut s, 1).ok()?;
        let h1 = s.hamiltonian(mass);
        let a = (h0 - h1).exp();
        if a.is_finite() {
            Some(a.min(1.0))
        } else {
            None
        }
    };

    let mut eps = 0.1;
    let accept0 = match test_accept(eps) {
        Some(a) => a,
        None => {
            eps = 0.001;
            match test_accept(eps) {
                Some(a) => a,
                None => return 0.001,
            }
        }
    };

    let direction: f64 = if accept0 > 0.5 { 1.0 } else { -1.0 };

    for _ in 0..50 {
        let new_eps = eps * 2.0_f64.powf(direction);
        if new_eps > 1e3 || new_eps < 1e-10 {
            break;
        }
        match test_accept(new_eps) {
            Some(a) => {
                if direction > 0.0 && a < 0.5 {
                    break;
                }
                if direction < 0.0 && a > 0.5 {
                    break;
                }
                eps = new_eps;
            }
            None => break,
        }
    }

    eps.clamp(1e-8, 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DiagonalGaussian;
    use crate::transform::ParameterTransform;

    #[test]
    fn dual_averaging_stays_finite_at_target() {
        let mut da = DualAveraging::new(0.8, 1.0);
        for _ in 0..100 {
            da.update(0.8);
        }
        let eps = da.adapted_step_size();
        assert!(eps > 0.0 && eps.is_finite());
    }

    #[test]
    fn dual_averaging_moves_in_the_right_direction() {
        let mut da_high = DualAveraging::new(0.8, 0.01);
        for _ in 0..200 {
            da_high.update(0.99);
        }
        let mut da_low = DualAveraging::new(0.8, 1.0);
        for _ in 0..200 {
            da_low.update(0.1);
        }
        assert!(da_high.adapted_step_size() > da_low.adapted_step_size());
    }

    #[test]
    fn welford_recovers_known_variance() {
        let mut w = WelfordVariance::new(2);
        let data = [[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0], [5.0, 50.0]];
        for d in &data {
            w.update(d);
        }
        let var = w.variance();
        assert!((var[0] - 2.5).abs() < 1e-10);
        assert!((var[1] - 250.0).abs() < 1e-10);
    }

    #[test]
    fn windows_are_contiguous_and_cover_warmup() {
        for &n in &[50usize, 137, 500, 1000, 5000] {
            let windows = compute_windows(n);
            assert_eq!(windows[0].0, 0);
            assert_eq!(windows.last().unwrap().1, n);
            for i in 1..windows.len() {
                assert_eq!(windows[i].0, windows[i - 1].1);
            }
        }
    }

    #[test]
    fn short_warmup_adapts_step_size_only() {
        assert_eq!(compute_windows(10), vec![(0, 10)]);
        assert_eq!(compute_windows(49), vec![(0, 49)]);
    }

    #[test]
    fn slow_windows_double_in_size() {
        let windows = compute_windows(1000);
        // 0..75, then 25, 50, 100, 200, remainder, then terminal 50.
        assert_eq!(windows[1].1 - windows[1].0, 25);
        assert_eq!(windows[2].1 - windows[2].0, 50);
        assert_eq!(windows[3].1 - windows[3].0, 100);
        assert_eq!(windows.last().unwrap().1 - windows.last().unwrap().0, 50);
    }

    #[test]
    fn constant_positions_clamp_the_mass_matrix() {
        let mut adapter = WarmupAdapter::new(2, 400, 0.8, 0.5);
        let q = [1.5, -0.5];
        let mut saw_update = false;
        for iter in 0..400 {
            if adapter.update(iter, &q, 0.8) {
                saw_update = true;
            }
        }
        assert!(saw_update);
        assert!(adapter.mass_clamped());
        for &v in adapter.mass().inv() {
            assert!((v - VARIANCE_FLOOR).abs() < 1e-25);
        }
    }

    #[test]
    fn varied_positions_do_not_clamp() {
        let mut adapter = WarmupAdapter::new(1, 400, 0.8, 0.5);
        for iter in 0..400 {
            let q = [(iter as f64 * 0.7).sin() * 2.0];
            adapter.update(iter, &q, 0.8);
        }
        assert!(!adapter.mass_clamped());
        assert!(adapter.mass().inv()[0] > VARIANCE_FLOOR);
    }

    #[test]
    fn reasonable_step_size_is_moderate_for_standard_gaussian() {
        let posterior =
            Posterior::new(DiagonalGaussian::standard(2), ParameterTransform::identity(2)).unwrap();
        let eps = find_reasonable_step_size(&posterior, &[0.5, -0.5], &MassMatrix::identity(2));
        assert!(eps > 1e-4 && eps < 1e3, "eps = {eps}");
    }
}
