//! Built-in strategies
//!
//! Strategies are selected by name in the `strategies` list of the
//! configuration and chained in that order.
//!
//! - print:  logs every context
//! - echo:   logs a fixed marker per message
//! - latest: keeps the latest value per call / channel

mod echo;
mod latest;
mod print;

pub use echo::Echo;
pub use latest::Latest;
pub use print::Print;

use crate::error::ConfigError;
use crate::pipeline::{Pipeline, Strategy};

/// Names accepted in `strategies`.
pub const SUPPORTED: &[&str] = &["print", "echo", "latest"];

/// Builds one strategy by configured name.
pub fn build(name: &str) -> Option<Box<dyn Strategy>> {
    match name {
        "print" => Some(Box::new(Print)),
        "echo" => Some(Box::new(Echo)),
        "latest" => Some(Box::new(Latest::default())),
        _ => None,
    }
}

/// Builds the pipeline for the configured strategy names.
///
/// An unknown name is a configuration error.
pub fn pipeline(names: &[String]) -> Result<Pipeline, ConfigError> {
    let mut pipeline = Pipeline::default();
    for (i, name) in names.iter().enumerate() {
        let stage = build(name).ok_or_else(|| ConfigError::Invalid {
            key: format!("strategies[{i}]"),
            reason: format!("unknown strategy '{name}', expected one of {SUPPORTED:?}"),
        })?;
        pipeline.push(stage);
    }
    Ok(pipeline)
}
