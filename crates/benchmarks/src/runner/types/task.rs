use gdpa::DeviceLimits;
use serde::{Deserialize, Serialize};

use crate::operator::{GdpaOperator, Mode, Operator};

/// A benchmark sweep as read from a task file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub identifier: String,
    #[serde(default = "default_operator")]
    pub operator: String,
    #[serde(default)]
    pub mode: Mode,
    /// Sweep points in the operator's shape format; its built-in sweep when
    /// empty.
    #[serde(default)]
    pub shapes: Vec<serde_json::Value>,
    /// Operator parameters; the operator's defaults when absent.
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub device: DeviceLimits,
    /// Backends to run; all of the operator's backends when empty.
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default = "default_warmup")]
    pub warmup: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_operator() -> String {
    GdpaOperator::NAME.to_string()
}

fn default_warmup() -> usize {
    1
}

fn default_iterations() -> usize {
    5
}
