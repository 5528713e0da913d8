pub mod aggregator;
pub mod config;
pub mod enricher;
pub mod error;
pub mod lookup;
pub mod pipeline;
pub mod subscription;
pub mod writer;

#[cfg(test)]
mod test_utils;
