//! No-U-Turn trajectory building.
//!
//! One transition doubles a trajectory of leapfrog steps in randomly chosen
//! directions until the path bends back on itself, diverges, or hits the
//! depth cap. The returned draw is selected by multinomial (biased
//! progressive) sampling among the visited states, weighted by
//! `exp(-(H - H0))`.

use crate::distributions::GradientTarget;
use crate::integrator::{Leapfrog, State};
use rand::Rng;

/// Per-transition record kept for every draw.
#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    /// Number of doublings performed (0 means a single leapfrog step).
    pub depth: usize,
    /// Mean Metropolis acceptance statistic over all leapfrog steps.
    pub accept_prob: f64,
    /// Whether any leaf exceeded the divergence threshold.
    pub divergent: bool,
    /// Hamiltonian at trajectory start (after momentum refresh).
    pub energy: f64,
}

/// Result of one NUTS transition.
pub struct Transition {
    pub q: Vec<f64>,
    pub potential: f64,
    pub grad_potential: Vec<f64>,
    pub stats: TreeStats,
    pub n_leapfrog: usize,
}

struct Tree {
    left: State,
    right: State,
    q_proposal: Vec<f64>,
    potential_proposal: f64,
    grad_proposal: Vec<f64>,
    log_sum_weight: f64,
    n_leapfrog: usize,
    sum_accept: f64,
    divergent: bool,
    turning: bool,
}

/// No-U-turn check: stop once the trajectory starts shrinking towards
/// itself at either end, measured with inverse-mass-weighted dot products.
fn is_turning(dq: &[f64], p_left: &[f64], p_right: &[f64], inv_mass: &[f64]) -> bool {
    let dot_left: f64 = dq
        .iter()
        .zip(p_left)
        .zip(inv_mass)
        .map(|((&d, &p), &m)| d * p * m)
        .sum();
    let dot_right: f64 = dq
        .iter()
        .zip(p_right)
        .zip(inv_mass)
        .map(|((&d, &p), &m)| d * p * m)
        .sum();
    dot_left < 0.0 || dot_right < 0.0
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// One leapfrog step turned into a single-leaf tree.
fn build_leaf<T: GradientTarget>(
    integrator: &Leapfrog<'_, T>,
    state: &State,
    direction: i32,
    h0: f64,
    divergence_threshold: f64,
) -> Tree {
    let mut new_state = state.clone();

    if integrator.step_dir(&mut new_state, direction).is_err() {
        // Off the support: a zero-weight divergent leaf. The edges are never
        // used because the caller stops at a divergent subtree.
        return Tree {
            left: new_state.clone(),
            right: new_state,
            q_proposal: state.q.clone(),
            potential_proposal: state.potential,
            grad_proposal: state.grad_potential.clone(),
            log_sum_weight: f64::NEG_INFINITY,
            n_leapfrog: 1,
            sum_accept: 0.0,
            divergent: true,
            turning: false,
        };
    }

    let h = new_state.hamiltonian(&integrator.mass);
    let energy_error = h - h0;
    let divergent = !(energy_error <= divergence_threshold);
    let log_weight = if divergent {
        f64::NEG_INFINITY
    } else {
        -energy_error
    };
    let accept = (-energy_error).exp().min(1.0);

    Tree {
        q_proposal: new_state.q.clone(),
        potential_proposal: new_state.potential,
        grad_proposal: new_state.grad_potential.clone(),
        left: new_state.clone(),
        right: new_state,
        log_sum_weight: log_weight,
        n_leapfrog: 1,
        sum_accept: if accept.is_finite() { accept } else { 0.0 },
        divergent,
        turning: false,
    }
}

/// Builds a balanced subtree of `depth` doublings in one direction.
fn build_tree<T: GradientTarget>(
    integrator: &Leapfrog<'_, T>,
    state: &State,
    depth: usize,
    direction: i32,
    h0: f64,
    divergence_threshold: f64,
    rng: &mut impl Rng,
) -> Tree {
    if depth == 0 {
        return build_leaf(integrator, state, direction, h0, divergence_threshold);
    }

    let mut inner = build_tree(
        integrator,
        state,
        depth - 1,
        direction,
        h0,
        divergence_threshold,
        rng,
    );
    if inner.divergent || inner.turning {
        return inner;
    }

    let edge = if direction > 0 {
        inner.right.clone()
    } else {
        inner.left.clone()
    };
    let outer = build_tree(
        integrator,
        &edge,
        depth - 1,
        direction,
        h0,
        divergence_threshold,
        rng,
    );

    let total = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
    let accept_outer = (outer.log_sum_weight - total).exp();
    if rng.gen::<f64>() < accept_outer {
        inner.q_proposal = outer.q_proposal;
        inner.potential_proposal = outer.potential_proposal;
        inner.grad_proposal = outer.grad_proposal;
    }

    inner.log_sum_weight = total;
    inner.n_leapfrog += outer.n_leapfrog;
    inner.sum_accept += outer.sum_accept;
    inner.divergent = inner.divergent || outer.divergent;

    if direction > 0 {
        inner.right = outer.right;
    } else {
        inner.left = outer.left;
    }

    let dq: Vec<f64> = inner
        .right
        .q
        .iter()
        .zip(&inner.left.q)
        .map(|(&r, &l)| r - l)
        .collect();
    inner.turning = inner.turning
        || outer.turning
        || is_turning(&dq, &inner.left.p, &inner.right.p, integrator.mass.inv());

    inner
}

/// Runs one NUTS transition from `current`.
///
/// Refreshes the momentum, then doubles the trajectory until a U-turn, a
/// divergence, or `max_depth` doublings. Never fails: non-finite leaves are
/// absorbed as divergent subtrees.
pub fn transition<T: GradientTarget>(
    integrator: &Leapfrog<'_, T>,
    current: &State,
    max_depth: usize,
    divergence_threshold: f64,
    rng: &mut impl Rng,
) -> Transition {
    let mut state = current.clone();
    integrator.mass.sample_momentum(rng, &mut state.p);
    let h0 = state.hamiltonian(&integrator.mass);

    let mut tree = Tree {
        left: state.clone(),
        right: state.clone(),
        q_proposal: state.q.clone(),
        potential_proposal: state.potential,
        grad_proposal: state.grad_potential.clone(),
        log_sum_weight: 0.0,
        n_leapfrog: 0,
        sum_accept: 0.0,
        divergent: false,
        turning: false,
    };

    let mut depth = 0;
    while depth < max_depth {
        let direction: i32 = if rng.gen::<bool>() { 1 } else { -1 };
        let edge = if direction > 0 {
            tree.right.clone()
        } else {
            tree.left.clone()
        };

        let subtree = build_tree(
            integrator,
            &edge,
            depth,
            direction,
            h0,
            divergence_threshold,
            rng,
        );

        let divergent = subtree.divergent;
        let turning = subtree.turning;

        // A broken subtree contributes nothing; the current candidate stays.
        if !divergent && !turning {
            let total = log_sum_exp(tree.log_sum_weight, subtree.log_sum_weight);
            let accept_subtree = (subtree.log_sum_weight - total).exp();
            if rng.gen::<f64>() < accept_subtree {
                tree.q_proposal = subtree.q_proposal;
                tree.potential_proposal = subtree.potential_proposal;
                tree.grad_proposal = subtree.grad_proposal;
            }
            tree.log_sum_weight = total;

            if direction > 0 {
                tree.right = subtree.right;
            } else {
                tree.left = subtree.left;
            }
        }

        tree.n_leapfrog += subtree.n_leapfrog;
        tree.sum_accept += subtree.sum_accept;
        tree.divergent = tree.divergent || divergent;

        if divergent || turning {
            break;
        }

        depth += 1;

        let dq: Vec<f64> = tree
            .right
            .q
            .iter()
            .zip(&tree.left.q)
            .map(|(&r, &l)| r - l)
            .collect();
        if is_turning(&dq, &tree.left.p, &tree.right.p, integrator.mass.inv()) {
            break;
        }
    }

    let accept_prob = tree.sum_accept / tree.n_leapfrog.max(1) as f64;

    Transition {
        q: tree.q_proposal,
        potential: tree.potential_proposal,
        grad_potential: tree.grad_proposal,
        stats: TreeStats {
            depth,
            accept_prob,
            divergent: tree.divergent,
            energy: h0,
        },
        n_leapfrog: tree.n_leapfrog,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DiagonalGaussian;
    use crate::integrator::MassMatrix;
    use crate::posterior::Posterior;
    use crate::transform::ParameterTransform;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn gaussian_integrator(
        posterior: &Posterior<DiagonalGaussian>,
        step_size: f64,
    ) -> Leapfrog<'_, DiagonalGaussian> {
        Leapfrog::new(posterior, step_size, MassMatrix::identity(posterior.dim()))
    }

    #[test]
    fn turning_detected_on_opposing_momenta() {
        // Spanning vector pointing right, both momenta pointing left.
        let dq = [1.0, 0.0];
        let p = [-1.0, 0.0];
        assert!(is_turning(&dq, &p, &p, &[1.0, 1.0]));

        // Momenta aligned with the spanning vector: no U-turn.
        let p_fwd = [1.0, 0.0];
        assert!(!is_turning(&dq, &p_fwd, &p_fwd, &[1.0, 1.0]));
    }

    #[test]
    fn log_sum_exp_handles_neg_infinity() {
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert!((log_sum_exp(0.0, f64::NEG_INFINITY) - 0.0).abs() < 1e-12);
        assert!((log_sum_exp(0.0, 0.0) - 2.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn transition_respects_depth_cap() {
        let posterior =
            Posterior::new(DiagonalGaussian::standard(2), ParameterTransform::identity(2)).unwrap();
        let integrator = gaussian_integrator(&posterior, 0.05);
        let state = integrator.init_state(vec![0.2, -0.4]).unwrap();

        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..50 {
            let t = transition(&integrator, &state, 4, 1000.0, &mut rng);
            assert!(t.stats.depth <= 4);
            assert!(t.n_leapfrog <= (1 << 5));
            assert!(t.stats.accept_prob >= 0.0 && t.stats.accept_prob <= 1.0);
        }
    }

    #[test]
    fn transition_is_deterministic_given_the_rng() {
        let posterior =
            Posterior::new(DiagonalGaussian::standard(3), ParameterTransform::identity(3)).unwrap();
        let integrator = gaussian_integrator(&posterior, 0.2);
        let state = integrator.init_state(vec![1.0, 0.0, -1.0]).unwrap();

        let mut rng1 = SmallRng::seed_from_u64(42);
        let mut rng2 = SmallRng::seed_from_u64(42);
        let t1 = transition(&integrator, &state, 10, 1000.0, &mut rng1);
        let t2 = transition(&integrator, &state, 10, 1000.0, &mut rng2);

        assert_eq!(t1.q, t2.q);
        assert_eq!(t1.stats.depth, t2.stats.depth);
        assert_eq!(t1.stats.energy, t2.stats.energy);
    }

    #[test]
    fn huge_step_size_flags_divergence() {
        // sigma = 0.01 with step size 10 blows the energy up immediately.
        let target = DiagonalGaussian::new(vec![0.0], vec![0.01]);
        let posterior = Posterior::new(target, ParameterTransform::identity(1)).unwrap();
        let integrator = Leapfrog::new(&posterior, 10.0, MassMatrix::identity(1));
        let state = integrator.init_state(vec![0.0]).unwrap();

        let mut rng = SmallRng::seed_from_u64(1);
        let mut saw_divergence = false;
        for _ in 0..20 {
            let t = transition(&integrator, &state, 10, 1000.0, &mut rng);
            if t.stats.divergent {
                saw_divergence = true;
            }
            assert!(t.q[0].is_finite());
        }
        assert!(saw_divergence);
    }

    #[test]
    fn non_finite_region_is_absorbed_as_divergence() {
        struct HalfLine;
        impl crate::distributions::GradientTarget for HalfLine {
            fn dim(&self) -> usize {
                1
            }
            fn logp_and_grad(&self, theta: &[f64], grad: &mut [f64]) -> f64 {
                grad[0] = -theta[0];
                if theta[0] < -1.0 {
                    f64::NAN
                } else {
                    -0.5 * theta[0] * theta[0]
                }
            }
        }

        let posterior = Posterior::new(HalfLine, ParameterTransform::identity(1)).unwrap();
        let integrator = Leapfrog::new(&posterior, 0.5, MassMatrix::identity(1));
        let state = integrator.init_state(vec![-0.9]).unwrap();

        // Close to the hole, some trajectories must step into it; none of
        // them may panic or yield a non-finite draw.
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..100 {
            let t = transition(&integrator, &state, 8, 1000.0, &mut rng);
            assert!(t.q[0].is_finite());
        }
    }
}
