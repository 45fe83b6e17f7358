use gdpa::GdpaError;
use thiserror::Error;

use crate::operator::Mode;

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("Unknown operator {0}")]
    UnknownOperator(String),
    #[error("Operator {operator} has no {mode} pass")]
    UnsupportedMode {
        operator: &'static str,
        mode: Mode,
    },
    #[error("Invalid parameters for {operator}: {reason}")]
    InvalidParams {
        operator: &'static str,
        reason: String,
    },
    #[error("Invalid shape for {operator}: {reason}")]
    InvalidShape {
        operator: &'static str,
        reason: String,
    },
    #[error("Unknown backend {backend} for operator {operator}")]
    UnknownBackend {
        operator: &'static str,
        backend: String,
    },
    #[error("No candidate configuration of {backend} fits shape {shape}")]
    NoValidConfig {
        backend: &'static str,
        shape: String,
    },
    #[error("Backend {backend} failed: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: GdpaError,
    },
    #[error("Task needs at least one timed iteration")]
    NoIterations,
    #[error("System clock error: {0}")]
    Clock(#[from] std::time::SystemTimeError),
}
