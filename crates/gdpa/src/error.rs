use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Block size {name} must be positive")]
    ZeroBlockSize {
        name: &'static str,
    },
    #[error("Buffer count {name} must be positive")]
    ZeroBufferCount {
        name: &'static str,
    },
    #[error("BLOCK_M {0} must be even so it splits into two query halves")]
    OddBlockM(usize),
    #[error(
        "Key/value ring needs at least 2 buffers to keep K and V resident, got {0}"
    )]
    KeyValueRingTooSmall(usize),
    #[error("BLOCK_N1 {block_n1} must be a multiple of BLOCK_M1 {block_m1}")]
    BlockNotMultiple {
        block_m1: usize,
        block_n1: usize,
    },
    #[error(
        "Shared memory exhausted: {required} bytes requested, {available} available"
    )]
    SharedMemoryExceeded {
        required: usize,
        available: usize,
    },
    #[error(
        "Tensor memory exhausted: {required} columns requested, {available} available"
    )]
    TensorMemoryExceeded {
        required: usize,
        available: usize,
    },
    #[error(
        "Accumulator tile needs {required} tensor memory lanes, {available} available"
    )]
    TensorMemoryLanesExceeded {
        required: usize,
        available: usize,
    },
    #[error("Device must expose at least one multiprocessor")]
    NoMultiprocessors,
}

impl ConfigError {
    /// Resource exhaustion depends on the problem shape, everything else is a
    /// static property of the configuration.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            ConfigError::SharedMemoryExceeded { .. }
                | ConfigError::TensorMemoryExceeded { .. }
                | ConfigError::TensorMemoryLanesExceeded { .. }
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaggedError {
    #[error("Offsets must contain at least one entry")]
    Empty,
    #[error("First offset must be 0, got {0}")]
    NonZeroStart(i64),
    #[error("Offsets decrease at index {index}: {previous} > {current}")]
    NotMonotonic {
        index: usize,
        previous: i64,
        current: i64,
    },
    #[error("Offsets cover {covered} rows but the packed tensor has {rows}")]
    RowCountMismatch {
        covered: i64,
        rows: usize,
    },
    #[error("Query offsets describe {query} sequences, key offsets {key}")]
    BatchMismatch {
        query: usize,
        key: usize,
    },
    #[error("Sequence index must be a permutation of 0..{0}")]
    InvalidSequenceIndex(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{tensor} has shape {actual:?}, expected {expected}")]
    Mismatch {
        tensor: &'static str,
        actual: [usize; 3],
        expected: String,
    },
    #[error("{heads} query heads are not divisible by {kv_heads} key/value heads")]
    HeadsNotDivisible {
        heads: usize,
        kv_heads: usize,
    },
    #[error("Head dimension of {tensor} must be positive")]
    ZeroHeadDim {
        tensor: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error(
        "Barrier {barrier} never completed phase parity {parity} within {timeout_ms} ms"
    )]
    BarrierTimeout {
        barrier: String,
        parity: u32,
        timeout_ms: u128,
    },
    #[error("Slot {0} was accessed by two parties at once")]
    SlotContention(String),
    #[error("Slot {slot} cannot go from {from} to {to}")]
    IllegalSlotTransition {
        slot: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("Engine {0} stopped accepting work")]
    EngineDisconnected(&'static str),
    #[error("Launch aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum GdpaError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid ragged offsets: {0}")]
    Ragged(#[from] RaggedError),
    #[error("Invalid input shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Kernel failed: {0}")]
    Kernel(#[from] KernelError),
}
