//! Multi-chain NUTS front end: configuration, the rayon worker pool, and
//! pooled output.

use crate::chain::{run_chain, Chain};
use crate::distributions::GradientTarget;
use crate::error::{ChainFailure, Error, Result};
use crate::posterior::Posterior;
use crate::transform::{Bound, ParameterTransform};
use indicatif::{MultiProgress, ProgressStyle};
use ndarray::{Array3, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Run configuration, validated when the sampler is built.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Post-warmup draws recorded per chain.
    pub num_samples: usize,
    /// Warmup iterations per chain (adaptation, discarded).
    pub num_warmup: usize,
    /// Number of independent chains.
    pub num_chains: usize,
    /// Dual-averaging target acceptance probability.
    pub target_accept_prob: f64,
    /// Maximum number of trajectory doublings.
    pub max_tree_depth: usize,
    /// Energy error above which a transition is flagged divergent.
    pub divergence_threshold: f64,
    /// Master seed; chain `i` derives its own generator from it.
    pub seed: u64,
    /// Optional explicit starting points in constrained space, one per
    /// chain. Defaults to a jittered transform origin.
    pub initial_positions: Option<Vec<Vec<f64>>>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_samples: 1000,
            num_warmup: 1000,
            num_chains: 4,
            target_accept_prob: 0.8,
            max_tree_depth: 10,
            divergence_threshold: 1000.0,
            seed: 0,
            initial_positions: None,
        }
    }
}

impl SamplerConfig {
    fn validate(&self, dim: usize) -> Result<()> {
        if dim == 0 {
            return Err(Error::InvalidConfig("target has zero parameters".into()));
        }
        if self.num_samples == 0 {
            return Err(Error::InvalidConfig("num_samples must be positive".into()));
        }
        if self.num_chains == 0 {
            return Err(Error::InvalidConfig("num_chains must be at least 1".into()));
        }
        if !(self.target_accept_prob > 0.0 && self.target_accept_prob < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "target_accept_prob must lie in (0, 1), got {}",
                self.target_accept_prob
            )));
        }
        if self.max_tree_depth == 0 {
            return Err(Error::InvalidConfig("max_tree_depth must be at least 1".into()));
        }
        if !(self.divergence_threshold.is_finite() && self.divergence_threshold > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "divergence_threshold must be finite and positive, got {}",
                self.divergence_threshold
            )));
        }
        if let Some(inits) = &self.initial_positions {
            if inits.len() != self.num_chains {
                return Err(Error::InvalidConfig(format!(
                    "initial_positions has {} entries for {} chains",
                    inits.len(),
                    self.num_chains
                )));
            }
            for (i, point) in inits.iter().enumerate() {
                if point.len() != dim {
                    return Err(Error::InvalidConfig(format!(
                        "initial position {} has dimension {}, expected {}",
                        i,
                        point.len(),
                        dim
                    )));
                }
                if point.iter().any(|x| !x.is_finite()) {
                    return Err(Error::InvalidConfig(format!(
                        "initial position {i} contains a non-finite value"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Result of a multi-chain run. Chains that failed are reported in
/// `failures` and excluded from everything else.
#[derive(Debug)]
pub struct RunOutput {
    pub chains: Vec<Chain>,
    pub failures: Vec<ChainFailure>,
    transform: ParameterTransform,
}

impl RunOutput {
    /// Pooled draws mapped back to constrained space,
    /// `surviving chains x draws x dim`.
    pub fn constrained_draws(&self) -> Array3<f64> {
        let n_chains = self.chains.len();
        let (n, d) = (self.chains[0].num_draws(), self.chains[0].dim());
        let mut out = Array3::zeros((n_chains, n, d));
        for (c, chain) in self.chains.iter().enumerate() {
            for i in 0..n {
                let z: Vec<f64> = chain.draws.row(i).to_vec();
                let theta = self.transform.to_constrained(&z);
                for (j, &t) in theta.iter().enumerate() {
                    out[(c, i, j)] = t;
                }
            }
        }
        out
    }

    /// Mean of one constrained coordinate over all surviving chains.
    pub fn pooled_mean(&self, p: usize) -> f64 {
        let draws = self.constrained_draws();
        draws.index_axis(Axis(2), p).mean().unwrap_or(f64::NAN)
    }

    /// Standard deviation of one constrained coordinate over all surviving
    /// chains.
    pub fn pooled_sd(&self, p: usize) -> f64 {
        let draws = self.constrained_draws();
        let col = draws.index_axis(Axis(2), p);
        let n = col.len() as f64;
        let mean = col.mean().unwrap_or(f64::NAN);
        (col.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    }

    pub fn total_divergences(&self) -> usize {
        self.chains.iter().map(|c| c.divergence_count()).sum()
    }

    /// Whether any chain had its mass matrix clamped during adaptation.
    pub fn mass_clamped(&self) -> bool {
        self.chains.iter().any(|c| c.mass_clamped)
    }
}

/// Multi-chain No-U-Turn sampler over a [`GradientTarget`].
pub struct NutsSampler<T> {
    posterior: Posterior<T>,
    config: SamplerConfig,
}

impl<T: GradientTarget> NutsSampler<T> {
    /// Builds the sampler; the configuration and transform are validated
    /// here, never during the run.
    pub fn new(target: T, transform: ParameterTransform, config: SamplerConfig) -> Result<Self> {
        config.validate(transform.dim())?;
        let posterior = Posterior::new(target, transform)?;
        Ok(Self { posterior, config })
    }

    /// Deterministic starting point in unconstrained space: the image of the
    /// transform origin (interval midpoints, lower bound + 1, zero for free
    /// coordinates).
    fn origin_unconstrained(&self) -> Vec<f64> {
        let theta: Vec<f64> = self
            .posterior
            .transform()
            .bounds()
            .iter()
            .map(|b| match *b {
                Bound::Free => 0.0,
                Bound::Lower(a) => a + 1.0,
                Bound::Interval(a, b) => 0.5 * (a + b),
            })
            .collect();
        self.posterior.to_unconstrained(&theta)
    }

    /// Runs all chains on the rayon pool and joins them.
    ///
    /// A failed chain is reported in [`RunOutput::failures`] without
    /// aborting its siblings; only a run in which every chain failed is an
    /// error. Output is bit-identical across runs for a fixed config.
    pub fn run(&self) -> Result<RunOutput> {
        self.run_inner(None)
    }

    /// Like [`Self::run`], with an indicatif progress bar per chain.
    pub fn run_with_progress(&self) -> Result<RunOutput> {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        self.run_inner(Some((multi, style)))
    }

    fn run_inner(&self, progress: Option<(MultiProgress, ProgressStyle)>) -> Result<RunOutput> {
        let total_iters = (self.config.num_warmup + self.config.num_samples) as u64;
        let origin = self.origin_unconstrained();

        let results: Vec<std::result::Result<Chain, ChainFailure>> = (0..self.config.num_chains)
            .into_par_iter()
            .map(|i| {
                let mut rng = SmallRng::seed_from_u64(self.config.seed.wrapping_add(i as u64 + 1));

                let z_init: Vec<f64> = match &self.config.initial_positions {
                    Some(inits) => self.posterior.to_unconstrained(&inits[i]),
                    // Spread default starts with a uniform jitter so chains
                    // do not share a trajectory.
                    None => origin
                        .iter()
                        .map(|&z| z + rng.gen_range(-1.0..1.0))
                        .collect(),
                };

                let pb = progress.as_ref().map(|(multi, style)| {
                    let pb = multi.add(indicatif::ProgressBar::new(total_iters));
                    pb.set_prefix(format!("Chain {i}"));
                    pb.set_style(style.clone());
                    pb
                });

                let result = run_chain(&self.posterior, &self.config, i, z_init, rng, || {
                    if let Some(pb) = &pb {
                        pb.inc(1);
                    }
                });

                if let Some(pb) = &pb {
                    match &result {
                        Ok(chain) => pb.finish_with_message(format!(
                            "done ({} divergent)",
                            chain.divergence_count()
                        )),
                        Err(e) => pb.abandon_with_message(format!("failed: {e}")),
                    }
                }

                result.map_err(|source| ChainFailure { chain_id: i, source })
            })
            .collect();

        let mut chains = Vec::new();
        let mut failures = Vec::new();
        for r in results {
            match r {
                Ok(c) => chains.push(c),
                Err(f) => failures.push(f),
            }
        }

        if chains.is_empty() {
            return Err(Error::AllChainsFailed(failures));
        }

        Ok(RunOutput {
            chains,
            failures,
            transform: self.posterior.transform().clone(),
        })
    }
}
