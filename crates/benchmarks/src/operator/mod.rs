mod addmm;
mod attention;
mod int4_gemm;
mod layer_norm;
mod shape;
mod welford;

use std::fmt;

pub use addmm::{AddmmInput, AddmmOperator, AddmmParams, AddmmShape};
pub use attention::{AttentionInput, AttentionOutput, GdpaOperator};
use gdpa::DeviceLimits;
pub use int4_gemm::{
    Int4GemmInput, Int4GemmOperator, Int4GemmParams, Int4GemmShape, pack_int4,
};
pub use layer_norm::{
    LayerNormOperator, LayerNormOutput, LayerNormParams, NormInput, NormShape,
};
use ndarray::{ArrayView, Dimension, Zip};
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
pub use shape::{AttentionShape, visible_pairs};
pub use welford::{WelfordOperator, WelfordOutput, WelfordParams, WelfordState};

use crate::BenchmarkError;

/// Direction of a benchmarked pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    #[serde(rename = "fwd")]
    Forward,
    #[serde(rename = "bwd")]
    Backward,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Forward => "fwd",
            Mode::Backward => "bwd",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fwd" | "forward" => Ok(Mode::Forward),
            "bwd" | "backward" => Ok(Mode::Backward),
            _ => Err(format!("Unknown mode: {value}")),
        }
    }
}

/// Worst deviation of a backend from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Accuracy {
    pub max_abs_diff: f32,
    pub passed: bool,
}

impl Accuracy {
    pub const MISMATCH: Self = Self {
        max_abs_diff: f32::INFINITY,
        passed: false,
    };

    /// Element-wise `|a - b| <= atol + rtol * |b|` over two equally shaped
    /// arrays.
    pub fn compare<D: Dimension>(
        actual: ArrayView<'_, f32, D>,
        expected: ArrayView<'_, f32, D>,
        rtol: f32,
        atol: f32,
    ) -> Self {
        if actual.shape() != expected.shape() {
            return Self::MISMATCH;
        }
        let mut max_abs_diff = 0.0f32;
        let mut passed = true;
        Zip::from(&actual).and(&expected).for_each(|a, b| {
            let diff = (a - b).abs();
            max_abs_diff = max_abs_diff.max(diff);
            passed &= diff <= atol + rtol * b.abs();
        });
        Self {
            max_abs_diff,
            passed,
        }
    }

    pub fn merge(
        self,
        other: Self,
    ) -> Self {
        Self {
            max_abs_diff: self.max_abs_diff.max(other.max_abs_diff),
            passed: self.passed && other.passed,
        }
    }
}

pub type BackendFn<'a, T> = Box<dyn Fn() -> Result<T, BenchmarkError> + 'a>;

/// A backend bound to one input, ready to be timed.
pub struct BoundBackend<'a, T> {
    pub name: &'static str,
    /// Serialized configuration the backend settled on, if it has one.
    pub config: Option<serde_json::Value>,
    pub run: BackendFn<'a, T>,
}

impl<'a, T> BoundBackend<'a, T> {
    pub fn new(
        name: &'static str,
        run: impl Fn() -> Result<T, BenchmarkError> + 'a,
    ) -> Self {
        Self {
            name,
            config: None,
            run: Box::new(run),
        }
    }

    pub fn with_config<C: Serialize>(
        mut self,
        config: &C,
    ) -> Self {
        self.config = serde_json::to_value(config).ok();
        self
    }
}

/// A benchmarked operation with interchangeable implementations.
pub trait Operator: Sized {
    /// Name tasks select the operator by.
    const NAME: &'static str;

    /// One point of the operator's sweep, as written in task files.
    type Shape: Clone + fmt::Display + Serialize + DeserializeOwned;
    /// Operator settings shared by every shape of a task.
    type Params: Default + DeserializeOwned;
    type Input;
    type Output;

    /// Fails with [`BenchmarkError::UnsupportedMode`] for passes the operator
    /// has no backends for.
    fn new(
        mode: Mode,
        params: Self::Params,
        limits: DeviceLimits,
    ) -> Result<Self, BenchmarkError>;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mode(&self) -> Mode;

    fn backends(&self) -> Vec<&'static str>;

    /// Backend every other backend is checked against.
    fn baseline(&self) -> &'static str;

    /// Sweep used when a task names no shapes.
    fn builtin_shapes(&self) -> Vec<Self::Shape>;

    fn prepare(
        &self,
        shape: &Self::Shape,
        seed: u64,
    ) -> Result<Self::Input, BenchmarkError>;

    fn bind<'a>(
        &'a self,
        backend: &str,
        input: &'a Self::Input,
    ) -> Result<BoundBackend<'a, Self::Output>, BenchmarkError>;

    /// Floating point operations of one call, when the operator counts them.
    fn flops(
        &self,
        input: &Self::Input,
    ) -> Option<f64>;

    /// Global memory traffic of one call, when the operator counts it.
    fn bytes(
        &self,
        input: &Self::Input,
    ) -> Option<f64>;

    fn check_accuracy(
        &self,
        actual: &Self::Output,
        expected: &Self::Output,
    ) -> Accuracy;
}

/// Every operator a task can name.
pub const OPERATORS: [&str; 5] = [
    GdpaOperator::NAME,
    AddmmOperator::NAME,
    LayerNormOperator::NAME,
    WelfordOperator::NAME,
    Int4GemmOperator::NAME,
];

/// Receives an operator built from its name.
pub trait OperatorVisitor {
    type Output;

    fn visit<O: Operator>(
        self,
        operator: O,
    ) -> Self::Output;
}

/// Builds the operator called `name` with `params` (its defaults when null)
/// and hands it to `visitor`.
pub fn dispatch<V: OperatorVisitor>(
    name: &str,
    mode: Mode,
    params: &serde_json::Value,
    limits: DeviceLimits,
    visitor: V,
) -> Result<V::Output, BenchmarkError> {
    match name {
        GdpaOperator::NAME => {
            Ok(visitor.visit(build::<GdpaOperator>(mode, params, limits)?))
        },
        AddmmOperator::NAME => {
            Ok(visitor.visit(build::<AddmmOperator>(mode, params, limits)?))
        },
        LayerNormOperator::NAME => {
            Ok(visitor.visit(build::<LayerNormOperator>(mode, params, limits)?))
        },
        WelfordOperator::NAME => {
            Ok(visitor.visit(build::<WelfordOperator>(mode, params, limits)?))
        },
        Int4GemmOperator::NAME => {
            Ok(visitor.visit(build::<Int4GemmOperator>(mode, params, limits)?))
        },
        _ => Err(BenchmarkError::UnknownOperator(name.to_string())),
    }
}

fn build<O: Operator>(
    mode: Mode,
    params: &serde_json::Value,
    limits: DeviceLimits,
) -> Result<O, BenchmarkError> {
    let params = if params.is_null() {
        <O::Params as Default>::default()
    } else {
        <O::Params as Deserialize>::deserialize(params).map_err(|error| {
            BenchmarkError::InvalidParams {
                operator: O::NAME,
                reason: error.to_string(),
            }
        })?
    };
    O::new(mode, params, limits)
}

/// What `list` shows for one operator and pass.
#[derive(Debug, Clone)]
pub struct OperatorSummary {
    pub name: &'static str,
    pub mode: Mode,
    pub backends: Vec<&'static str>,
    pub baseline: &'static str,
    pub shapes: Vec<String>,
}

struct Summarize;

impl OperatorVisitor for Summarize {
    type Output = OperatorSummary;

    fn visit<O: Operator>(
        self,
        operator: O,
    ) -> OperatorSummary {
        OperatorSummary {
            name: operator.name(),
            mode: operator.mode(),
            backends: operator.backends(),
            baseline: operator.baseline(),
            shapes: operator
                .builtin_shapes()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Every supported operator and pass with default parameters.
pub fn catalog() -> Vec<OperatorSummary> {
    OPERATORS
        .iter()
        .flat_map(|name| {
            [Mode::Forward, Mode::Backward].into_iter().filter_map(|mode| {
                dispatch(
                    name,
                    mode,
                    &serde_json::Value::Null,
                    DeviceLimits::default(),
                    Summarize,
                )
                .ok()
            })
        })
        .collect()
}

/// Standard normal sample (Box-Muller).
pub(crate) fn standard_normal(rng: &mut StdRng) -> f32 {
    let radius: f32 = rng.random_range(f32::EPSILON..1.0);
    let angle: f32 = rng.random_range(0.0..std::f32::consts::TAU);
    (-2.0 * radius.ln()).sqrt() * angle.cos()
}

/// Hands `items` out round-robin to `units` scoped workers.
pub(crate) fn for_each_strided<T: Send>(
    items: impl IntoIterator<Item = T>,
    units: usize,
    work: impl Fn(T) + Sync,
) {
    let units = units.max(1);
    let mut queues: Vec<Vec<T>> = (0..units).map(|_| Vec::new()).collect();
    for (index, item) in items.into_iter().enumerate() {
        queues[index % units].push(item);
    }
    let work = &work;
    std::thread::scope(|scope| {
        for queue in queues.into_iter().filter(|queue| !queue.is_empty()) {
            scope.spawn(move || queue.into_iter().for_each(work));
        }
    });
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_catalog_lists_every_operator() {
        let catalog = catalog();
        for name in OPERATORS {
            assert!(catalog.iter().any(|summary| summary.name == name));
        }
        let passes = |name: &str| {
            catalog
                .iter()
                .filter(|summary| summary.name == name)
                .map(|summary| summary.mode)
                .collect::<Vec<_>>()
        };
        assert_eq!(passes("gdpa"), vec![Mode::Forward, Mode::Backward]);
        assert_eq!(passes("layer_norm"), vec![Mode::Forward, Mode::Backward]);
        assert_eq!(passes("welford"), vec![Mode::Forward]);
        assert_eq!(passes("int4_gemm"), vec![Mode::Forward]);
        for summary in &catalog {
            assert!(summary.backends.contains(&summary.baseline));
            assert!(!summary.shapes.is_empty());
        }
    }

    #[test]
    fn test_dispatch_errors() {
        let unknown = dispatch(
            "softmax",
            Mode::Forward,
            &serde_json::Value::Null,
            DeviceLimits::default(),
            Summarize,
        );
        assert!(matches!(unknown, Err(BenchmarkError::UnknownOperator(_))));

        let unsupported = dispatch(
            "welford",
            Mode::Backward,
            &serde_json::Value::Null,
            DeviceLimits::default(),
            Summarize,
        );
        assert!(matches!(
            unsupported,
            Err(BenchmarkError::UnsupportedMode { .. })
        ));

        let invalid = dispatch(
            "addmm",
            Mode::Forward,
            &serde_json::json!({ "data_type": "f64" }),
            DeviceLimits::default(),
            Summarize,
        );
        assert!(matches!(invalid, Err(BenchmarkError::InvalidParams { .. })));
    }

    #[test]
    fn test_accuracy_compare() {
        let expected = array![1.0f32, -2.0, 100.0];
        let actual = array![1.0f32, -2.001, 100.5];
        let accuracy = Accuracy::compare(actual.view(), expected.view(), 1e-2, 1e-2);
        assert!(accuracy.passed);
        assert!((accuracy.max_abs_diff - 0.5).abs() < 1e-6);

        let strict = Accuracy::compare(actual.view(), expected.view(), 0.0, 1e-2);
        assert!(!strict.passed);
        assert!(!accuracy.merge(strict).passed);

        let shorter = array![1.0f32, -2.0];
        assert_eq!(
            Accuracy::compare(shorter.view(), expected.view(), 1.0, 1.0),
            Accuracy::MISMATCH
        );
    }

    #[test]
    fn test_standard_normal_moments() {
        let mut rng = StdRng::seed_from_u64(5);
        let samples: Vec<f32> = (0..20_000).map(|_| standard_normal(&mut rng)).collect();
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>()
            / samples.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((variance - 1.0).abs() < 0.05, "variance {variance}");
    }

    #[test]
    fn test_strided_work_visits_every_item() {
        let seen = std::sync::Mutex::new(Vec::new());
        for_each_strided(0..10, 3, |item| {
            seen.lock().unwrap().push(item);
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
