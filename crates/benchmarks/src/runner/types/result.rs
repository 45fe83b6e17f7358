use serde::{Deserialize, Serialize};

use crate::{
    operator::{Accuracy, Mode},
    runner::{helpers::LatencyStats, types::Device},
};

/// Measurement of one backend on one shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    pub task_identifier: String,
    pub device: Device,
    pub engine_version: String,
    pub timestamp: u64,
    pub operator: String,
    pub mode: Mode,
    /// The sweep point in the operator's shape format.
    pub shape: serde_json::Value,
    /// The sweep point as printed in reports.
    pub shape_name: String,
    pub backend: String,
    pub config: Option<serde_json::Value>,
    pub latency: LatencyStats,
    /// Absent for operators that do not count floating point work.
    pub tflops: Option<f64>,
    pub gbps: Option<f64>,
    /// Deviation from the baseline backend; absent for the baseline itself.
    pub accuracy: Option<Accuracy>,
}
