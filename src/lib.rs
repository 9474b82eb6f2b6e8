pub mod config;
pub mod error;
pub mod normalizer;
pub mod persistence;
pub mod results;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;
