//! Error types for the sampler.

use thiserror::Error;

/// Signal raised when a log-density evaluation produced a NaN or infinite
/// value or gradient component.
///
/// This is a local control-flow signal: the trajectory builder treats the
/// offending leapfrog step as divergent and continues. It only turns into a
/// hard failure when a chain cannot find any finite starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonFiniteDensity;

/// Why a single chain gave up.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// No finite starting point was found within the retry budget.
    #[error("no finite log density at any of {attempts} initial positions")]
    NonFiniteStart { attempts: usize },

    /// The chain spent too many consecutive iterations unable to leave a
    /// region where every proposed step evaluated non-finite.
    #[error("chain stuck on non-finite density for {iterations} consecutive iterations")]
    StuckChain { iterations: usize },
}

/// A chain failure annotated with the chain that produced it.
#[derive(Debug, Clone, Error)]
#[error("chain {chain_id} failed: {source}")]
pub struct ChainFailure {
    pub chain_id: usize,
    #[source]
    pub source: ChainError,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parameter bounds rejected at transform construction.
    #[error("invalid transform: {0}")]
    InvalidTransform(String),

    /// Every chain of a run failed; per-chain causes attached.
    #[error("all {} chains failed", .0.len())]
    AllChainsFailed(Vec<ChainFailure>),
}

pub type Result<T> = std::result::Result<T, Error>;
