pub mod adapt;
pub mod chain;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod integrator;
pub mod nuts;
pub mod posterior;
pub mod sampler;
pub mod transform;
