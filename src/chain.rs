//! Single-chain driver: warmup with adaptation, then sampling with frozen
//! tuning parameters.

use crate::adapt::{find_reasonable_step_size, WarmupAdapter};
use crate::distributions::GradientTarget;
use crate::error::ChainError;
use crate::integrator::Leapfrog;
use crate::nuts::{transition, TreeStats};
use crate::posterior::Posterior;
use crate::sampler::SamplerConfig;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;

/// Fresh initial points tried before giving up on a chain whose density is
/// non-finite at the start.
const MAX_INIT_RETRIES: usize = 50;

/// Consecutive no-move divergent iterations tolerated before a chain is
/// declared stuck.
const MAX_STUCK_ITERS: usize = 100;

/// Everything one chain produced.
#[derive(Debug, Clone)]
pub struct Chain {
    pub chain_id: usize,
    /// Post-warmup draws in unconstrained space, `num_samples x dim`.
    pub draws: Array2<f64>,
    /// Per-draw trajectory statistics, aligned with `draws` rows.
    pub stats: Vec<TreeStats>,
    /// Step size frozen after warmup.
    pub step_size: f64,
    /// Mass matrix diagonal frozen after warmup.
    pub mass_diag: Vec<f64>,
    /// Set when any variance estimate hit the floor during adaptation.
    pub mass_clamped: bool,
    /// Depth cap the chain ran with.
    pub max_depth: usize,
}

impl Chain {
    pub fn num_draws(&self) -> usize {
        self.draws.nrows()
    }

    pub fn dim(&self) -> usize {
        self.draws.ncols()
    }

    pub fn divergence_count(&self) -> usize {
        self.stats.iter().filter(|s| s.divergent).count()
    }

    pub fn max_depth_hits(&self) -> usize {
        self.stats.iter().filter(|s| s.depth >= self.max_depth).count()
    }

    pub fn energies(&self) -> Vec<f64> {
        self.stats.iter().map(|s| s.energy).collect()
    }

    /// Draws of one coordinate as a contiguous vector.
    pub fn param_draws(&self, p: usize) -> Vec<f64> {
        self.draws.column(p).to_vec()
    }
}

/// Runs one complete chain: initialization with bounded retries, warmup
/// with adaptation, then `num_samples` recorded transitions.
pub(crate) fn run_chain<T: GradientTarget>(
    posterior: &Posterior<T>,
    config: &SamplerConfig,
    chain_id: usize,
    z_init: Vec<f64>,
    mut rng: SmallRng,
    mut on_draw: impl FnMut(),
) -> Result<Chain, ChainError> {
    let dim = posterior.dim();

    // A non-finite start is retried from jittered points near the requested
    // one before the chain is declared fatal.
    let probe = Leapfrog::new(posterior, 1.0, crate::integrator::MassMatrix::identity(dim));
    let mut state = None;
    for attempt in 0..=MAX_INIT_RETRIES {
        let z: Vec<f64> = if attempt == 0 {
            z_init.clone()
        } else {
            z_init
                .iter()
                .map(|&z| z + rng.gen_range(-1.0..1.0))
                .collect()
        };
        if let Ok(s) = probe.init_state(z) {
            state = Some(s);
            break;
        }
    }
    let mut state = state.ok_or(ChainError::NonFiniteStart {
        attempts: MAX_INIT_RETRIES + 1,
    })?;

    let mut adapter = WarmupAdapter::new(
        dim,
        config.num_warmup,
        config.target_accept_prob,
        find_reasonable_step_size(posterior, &state.q, &crate::integrator::MassMatrix::identity(dim)),
    );

    let mut stuck = 0usize;

    for iter in 0..config.num_warmup {
        let integrator = Leapfrog::new(posterior, adapter.step_size(), adapter.mass().clone());
        let t = transition(
            &integrator,
            &state,
            config.max_tree_depth,
            config.divergence_threshold,
            &mut rng,
        );

        let moved = t.q != state.q;
        state.q = t.q;
        state.potential = t.potential;
        state.grad_potential = t.grad_potential;

        if t.stats.divergent && !moved {
            stuck += 1;
            if stuck >= MAX_STUCK_ITERS {
                return Err(ChainError::StuckChain { iterations: stuck });
            }
        } else {
            stuck = 0;
        }

        if adapter.update(iter, &state.q, t.stats.accept_prob) {
            // New metric; re-bracket the step size against it.
            let eps = find_reasonable_step_size(posterior, &state.q, adapter.mass());
            adapter.reset_step_size(eps);
        }

        on_draw();
    }

    let step_size = if config.num_warmup > 0 {
        adapter.adapted_step_size()
    } else {
        adapter.step_size()
    };
    let mass = adapter.mass().clone();
    let integrator = Leapfrog::new(posterior, step_size, mass.clone());

    let mut draws = Array2::zeros((config.num_samples, dim));
    let mut stats = Vec::with_capacity(config.num_samples);

    for i in 0..config.num_samples {
        let t = transition(
            &integrator,
            &state,
            config.max_tree_depth,
            config.divergence_threshold,
            &mut rng,
        );

        let moved = t.q != state.q;
        state.q = t.q;
        state.potential = t.potential;
        state.grad_potential = t.grad_potential;

        if t.stats.divergent && !moved {
            stuck += 1;
            if stuck >= MAX_STUCK_ITERS {
                return Err(ChainError::StuckChain { iterations: stuck });
            }
        } else {
            stuck = 0;
        }

        for (j, &qj) in state.q.iter().enumerate() {
            draws[(i, j)] = qj;
        }
        stats.push(t.stats);
        on_draw();
    }

    Ok(Chain {
        chain_id,
        draws,
        stats,
        step_size,
        mass_diag: mass.diagonal(),
        mass_clamped: adapter.mass_clamped(),
        max_depth: config.max_tree_depth,
    })
}
