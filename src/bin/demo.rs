//! Samples the Beta-Binomial posterior with four NUTS chains and prints a
//! diagnostic summary.

use mini_nuts::diagnostics::Diagnostics;
use mini_nuts::distributions::BetaBinomial;
use mini_nuts::error::Result;
use mini_nuts::sampler::{NutsSampler, SamplerConfig};
use mini_nuts::transform::{Bound, ParameterTransform};

fn main() -> Result<()> {
    // 70 successes out of 100 trials, uniform prior on the success rate.
    let target = BetaBinomial::new(1.0, 1.0, 70, 100);
    let transform = ParameterTransform::new(vec![Bound::Interval(0.0, 1.0)])?;

    let config = SamplerConfig {
        num_samples: 2000,
        num_warmup: 1000,
        num_chains: 4,
        seed: 42,
        ..SamplerConfig::default()
    };

    let sampler = NutsSampler::new(target, transform, config)?;
    let output = sampler.run_with_progress()?;

    println!(
        "posterior mean: {:.4} (conjugate: {:.4})",
        output.pooled_mean(0),
        target.posterior_mean()
    );
    println!(
        "posterior sd:   {:.4} (conjugate: {:.4})",
        output.pooled_sd(0),
        target.posterior_sd()
    );
    for failure in &output.failures {
        println!("{failure}");
    }

    println!("{}", Diagnostics::compute(&output.chains));
    Ok(())
}
