use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub os_name: Option<String>,
    pub cpu_name: Option<String>,
    pub cpu_count: usize,
    pub memory_total: u64,
    /// Persistent units the kernels were launched with.
    pub multiprocessor_count: usize,
}
