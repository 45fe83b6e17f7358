use std::f32::consts::{FRAC_1_SQRT_2, PI};

use serde::{Deserialize, Serialize};

const FAST_GELU_CUBIC: f32 = 0.0356774081;
const FAST_GELU_LINEAR: f32 = 0.7978845608;

/// Elementwise nonlinearity applied to the scores in place of a softmax.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[serde(alias = "raw")]
    Identity,
    Gelu,
    /// `x * tanh(c1 * x^3 + c0 * x) + x`, twice the tanh approximation of gelu.
    #[default]
    FastGelu,
}

impl Activation {
    pub fn apply(
        &self,
        x: f32,
    ) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Gelu => 0.5 * x * (1.0 + erf(x * FRAC_1_SQRT_2)),
            Activation::FastGelu => {
                let inner = FAST_GELU_CUBIC * x * x * x + FAST_GELU_LINEAR * x;
                x * inner.tanh() + x
            },
        }
    }

    /// Derivative of [`Activation::apply`] with respect to its input.
    pub fn derivative(
        &self,
        x: f32,
    ) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Gelu => {
                let cdf = 0.5 * (1.0 + erf(x * FRAC_1_SQRT_2));
                let pdf = (-0.5 * x * x).exp() / (2.0 * PI).sqrt();
                cdf + x * pdf
            },
            Activation::FastGelu => {
                let inner = FAST_GELU_CUBIC * x * x * x + FAST_GELU_LINEAR * x;
                let tanh = inner.tanh();
                let inner_derivative =
                    3.0 * FAST_GELU_CUBIC * x * x + FAST_GELU_LINEAR;
                tanh + x * (1.0 - tanh * tanh) * inner_derivative + 1.0
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Identity => "identity",
            Activation::Gelu => "gelu",
            Activation::FastGelu => "fast_gelu",
        }
    }
}

impl std::str::FromStr for Activation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "identity" | "raw" => Ok(Activation::Identity),
            "gelu" => Ok(Activation::Gelu),
            "fast_gelu" => Ok(Activation::FastGelu),
            _ => Err(format!("Unknown activation: {value}")),
        }
    }
}

// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let polynomial = t
        * (0.254829592
            + t * (-0.284496736
                + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - polynomial * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numerical_derivative(
        activation: Activation,
        x: f32,
    ) -> f32 {
        let eps = 1e-3;
        (activation.apply(x + eps) - activation.apply(x - eps)) / (2.0 * eps)
    }

    #[test]
    fn test_zero_maps_to_zero() {
        for activation in
            [Activation::Identity, Activation::Gelu, Activation::FastGelu]
        {
            assert_eq!(activation.apply(0.0), 0.0);
        }
    }

    #[test]
    fn test_fast_gelu_is_twice_tanh_gelu() {
        for x in [-3.0f32, -1.0, -0.25, 0.5, 2.0] {
            let tanh_gelu = 0.5
                * x
                * (1.0 + (FAST_GELU_LINEAR * (x + 0.044715 * x * x * x)).tanh());
            assert!((Activation::FastGelu.apply(x) - 2.0 * tanh_gelu).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gelu_matches_known_values() {
        assert!((Activation::Gelu.apply(1.0) - 0.8413447).abs() < 1e-5);
        assert!((Activation::Gelu.apply(-1.0) + 0.1586553).abs() < 1e-5);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        for activation in
            [Activation::Identity, Activation::Gelu, Activation::FastGelu]
        {
            for x in [-2.5f32, -0.7, 0.0, 0.3, 1.9] {
                let expected = numerical_derivative(activation, x);
                let actual = activation.derivative(x);
                assert!(
                    (expected - actual).abs() < 1e-2,
                    "{activation:?} at {x}: {actual} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn test_activation_serde() {
        let activation: Activation =
            serde_json::from_str("\"fast_gelu\"").unwrap();
        assert_eq!(activation, Activation::FastGelu);
        let activation: Activation = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(activation, Activation::Identity);
    }
}
