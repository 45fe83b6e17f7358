use serde::{Deserialize, Serialize};

use super::DeviceLimits;
use crate::{DataType, error::ConfigError};

/// On-chip footprint of one persistent unit for a given problem shape.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone)]
pub struct ResourceUsage {
    pub shared_memory_bytes: usize,
    pub tensor_memory_columns: usize,
    pub tensor_memory_lanes: usize,
}

impl ResourceUsage {
    fn check(
        self,
        limits: &DeviceLimits,
    ) -> Result<Self, ConfigError> {
        if self.tensor_memory_lanes > limits.tensor_memory_lanes {
            return Err(ConfigError::TensorMemoryLanesExceeded {
                required: self.tensor_memory_lanes,
                available: limits.tensor_memory_lanes,
            });
        }
        if self.tensor_memory_columns > limits.tensor_memory_columns {
            return Err(ConfigError::TensorMemoryExceeded {
                required: self.tensor_memory_columns,
                available: limits.tensor_memory_columns,
            });
        }
        if self.shared_memory_bytes > limits.shared_memory_bytes {
            return Err(ConfigError::SharedMemoryExceeded {
                required: self.shared_memory_bytes,
                available: limits.shared_memory_bytes,
            });
        }
        Ok(self)
    }
}

fn require_positive(
    value: usize,
    error: ConfigError,
) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(error);
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone)]
#[serde(default)]
pub struct ForwardConfig {
    /// Query rows per tile, split evenly between the two activation partitions.
    pub block_m: usize,
    /// Key rows per inner step.
    pub block_n: usize,
    pub num_buffers_q: usize,
    pub num_buffers_kv: usize,
    pub num_buffers_qk: usize,
    pub num_buffers_o: usize,
    pub pingpong: bool,
    pub merge_epilogue: bool,
    pub sort_by_seq_length: bool,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            block_m: 256,
            block_n: 128,
            num_buffers_q: 1,
            num_buffers_kv: 3,
            num_buffers_qk: 1,
            num_buffers_o: 1,
            pingpong: false,
            merge_epilogue: false,
            sort_by_seq_length: false,
        }
    }
}

impl ForwardConfig {
    pub fn half_block_m(&self) -> usize {
        self.block_m / 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive(
            self.block_m,
            ConfigError::ZeroBlockSize {
                name: "BLOCK_M",
            },
        )?;
        require_positive(
            self.block_n,
            ConfigError::ZeroBlockSize {
                name: "BLOCK_N",
            },
        )?;
        if self.block_m % 2 != 0 {
            return Err(ConfigError::OddBlockM(self.block_m));
        }
        for (name, count) in [
            ("NUM_BUFFERS_Q", self.num_buffers_q),
            ("NUM_BUFFERS_QK", self.num_buffers_qk),
            ("NUM_BUFFERS_O", self.num_buffers_o),
        ] {
            require_positive(
                count,
                ConfigError::ZeroBufferCount {
                    name,
                },
            )?;
        }
        if self.num_buffers_kv < 2 {
            return Err(ConfigError::KeyValueRingTooSmall(self.num_buffers_kv));
        }
        Ok(())
    }

    pub fn resource_usage(
        &self,
        head_dim: usize,
        head_dim_v: usize,
        data_type: DataType,
    ) -> ResourceUsage {
        let half = self.half_block_m();
        let q_elements = 2 * self.num_buffers_q * half * head_dim;
        let kv_elements =
            self.num_buffers_kv * self.block_n * head_dim.max(head_dim_v);
        let o_staging_elements = if self.merge_epilogue {
            0
        } else {
            2 * half * head_dim_v
        };
        ResourceUsage {
            shared_memory_bytes: (q_elements + kv_elements + o_staging_elements)
                * data_type.size_in_bytes(),
            tensor_memory_columns: 2 * self.num_buffers_qk * self.block_n
                + 2 * self.num_buffers_o * head_dim_v,
            tensor_memory_lanes: half,
        }
    }

    pub fn check_resources(
        &self,
        limits: &DeviceLimits,
        head_dim: usize,
        head_dim_v: usize,
        data_type: DataType,
    ) -> Result<ResourceUsage, ConfigError> {
        self.validate()?;
        self.resource_usage(head_dim, head_dim_v, data_type).check(limits)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone)]
#[serde(default)]
pub struct BackwardConfig {
    /// Query rows per inner step.
    pub block_m1: usize,
    /// Key rows per tile.
    pub block_n1: usize,
    pub num_buffers_kv: usize,
    pub num_buffers_q: usize,
    pub num_buffers_do: usize,
    pub num_buffers_ds: usize,
    pub num_buffers_tmem: usize,
    pub sort_by_seq_length: bool,
}

impl Default for BackwardConfig {
    fn default() -> Self {
        Self {
            block_m1: 128,
            block_n1: 128,
            num_buffers_kv: 1,
            num_buffers_q: 1,
            num_buffers_do: 1,
            num_buffers_ds: 1,
            num_buffers_tmem: 1,
            sort_by_seq_length: false,
        }
    }
}

impl BackwardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive(
            self.block_m1,
            ConfigError::ZeroBlockSize {
                name: "BLOCK_M1",
            },
        )?;
        require_positive(
            self.block_n1,
            ConfigError::ZeroBlockSize {
                name: "BLOCK_N1",
            },
        )?;
        if self.block_n1 % self.block_m1 != 0 {
            return Err(ConfigError::BlockNotMultiple {
                block_m1: self.block_m1,
                block_n1: self.block_n1,
            });
        }
        for (name, count) in [
            ("NUM_BUFFERS_KV", self.num_buffers_kv),
            ("NUM_BUFFERS_Q", self.num_buffers_q),
            ("NUM_BUFFERS_DO", self.num_buffers_do),
            ("NUM_BUFFERS_DS", self.num_buffers_ds),
            ("NUM_BUFFERS_TMEM", self.num_buffers_tmem),
        ] {
            require_positive(
                count,
                ConfigError::ZeroBufferCount {
                    name,
                },
            )?;
        }
        Ok(())
    }

    pub fn resource_usage(
        &self,
        head_dim: usize,
        head_dim_v: usize,
        data_type: DataType,
    ) -> ResourceUsage {
        let kv_elements =
            self.num_buffers_kv * self.block_n1 * (head_dim + head_dim_v);
        let q_elements = self.num_buffers_q * self.block_m1 * head_dim;
        let do_elements = self.num_buffers_do * self.block_m1 * head_dim_v;
        let ds_elements = self.num_buffers_ds * self.block_n1 * self.block_m1;
        ResourceUsage {
            shared_memory_bytes: (kv_elements
                + q_elements
                + do_elements
                + ds_elements)
                * data_type.size_in_bytes(),
            // dpT shares the columns of qkT.
            tensor_memory_columns: self.num_buffers_tmem
                * (self.block_m1 + head_dim)
                + head_dim
                + head_dim_v,
            tensor_memory_lanes: self.block_n1.max(self.block_m1),
        }
    }

    pub fn check_resources(
        &self,
        limits: &DeviceLimits,
        head_dim: usize,
        head_dim_v: usize,
        data_type: DataType,
    ) -> Result<ResourceUsage, ConfigError> {
        self.validate()?;
        self.resource_usage(head_dim, head_dim_v, data_type).check(limits)
    }
}
