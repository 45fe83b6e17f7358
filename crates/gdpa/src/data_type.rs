use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Element type of the tensors a kernel launch reads and writes.
///
/// Values always travel through the kernel as `f32`; the element type decides
/// where they are rounded: when a tile is loaded, when the activated scores
/// are written back for the second matmul, and when a result is stored.
#[derive(
    Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Copy, Clone,
)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    BF16,
    F16,
    F32,
}

impl DataType {
    pub fn size_in_bits(&self) -> usize {
        match self {
            DataType::BF16 => 16,
            DataType::F16 => 16,
            DataType::F32 => 32,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        (self.size_in_bits() + 7) / 8
    }

    pub fn quantize(
        &self,
        value: f32,
    ) -> f32 {
        match self {
            DataType::BF16 => bf16::from_f32(value).to_f32(),
            DataType::F16 => f16::from_f32(value).to_f32(),
            DataType::F32 => value,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::BF16
    }
}

impl std::fmt::Display for DataType {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let name = match self {
            DataType::BF16 => "bf16",
            DataType::F16 => "f16",
            DataType::F32 => "f32",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bf16" => Ok(DataType::BF16),
            "f16" => Ok(DataType::F16),
            "f32" => Ok(DataType::F32),
            _ => Err(format!("Unknown data type: {value}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DataType::BF16.size_in_bytes(), 2);
        assert_eq!(DataType::F16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
    }

    #[test]
    fn test_quantize_rounds_to_representable_values() {
        let value = 1.0f32 + 1.0 / 1024.0;
        assert_eq!(DataType::F32.quantize(value), value);
        assert_eq!(DataType::F16.quantize(value), value);
        assert_eq!(DataType::BF16.quantize(value), 1.0);
    }

    #[test]
    fn test_data_type_serde() {
        let data_type: DataType = serde_json::from_str("\"bf16\"").unwrap();
        assert_eq!(data_type, DataType::BF16);
        assert_eq!(serde_json::to_string(&DataType::F32).unwrap(), "\"f32\"");
        assert_eq!("f16".parse::<DataType>(), Ok(DataType::F16));
        assert!("fp8".parse::<DataType>().is_err());
    }
}
