//! stats
#![deny(missing_docs)]

mod moments;
mod reservoir_sampling;
pub use moments::{mean_var, median};
pub use reservoir_sampling::WeightedReservoirSampler;
