//! Dense f32 oracle for the attention kernels.
//!
//! Computes every sequence and head independently with plain matrix
//! products, applying the same masks and truncation as the kernels but no
//! intermediate rounding.

use ndarray::{Array2, Array3, ArrayView2, s};

use crate::{AttentionParams, GdpaInputs, Gradients, error::GdpaError};

struct Scores {
    /// `scale · Q·Kᵀ` before the activation.
    raw: Array2<f32>,
    visible: Array2<bool>,
}

fn scores(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    params: &AttentionParams,
) -> Scores {
    let raw = query.dot(&key.t()) * params.qk_scale;
    let visible = Array2::from_shape_fn(raw.dim(), |(row, column)| {
        params.is_visible(row, column)
    });
    Scores {
        raw,
        visible,
    }
}

/// Packed row range of a sequence after truncation to `max_len`.
fn rows(
    begin: usize,
    len: usize,
    max_len: usize,
) -> (usize, usize) {
    (begin, begin + len.min(max_len))
}

pub fn reference_forward(
    inputs: &GdpaInputs,
    params: &AttentionParams,
) -> Result<Array3<f32>, GdpaError> {
    let shape = inputs.validate()?;
    let mut output = Array3::zeros((
        inputs.query_offsets.total_rows(),
        shape.heads,
        shape.head_dim_v,
    ));

    for batch in 0..shape.batch {
        let (q_begin, q_end) = rows(
            inputs.query_offsets.begin(batch),
            inputs.query_offsets.len(batch),
            inputs.max_seq_len_q,
        );
        let (k_begin, k_end) = rows(
            inputs.key_offsets.begin(batch),
            inputs.key_offsets.len(batch),
            inputs.max_seq_len_kv,
        );
        for head in 0..shape.heads {
            let kv_head = head / shape.group_size;
            let query = inputs.query.slice(s![q_begin..q_end, head, ..]);
            let key = inputs.key.slice(s![k_begin..k_end, kv_head, ..]);
            let value = inputs.value.slice(s![k_begin..k_end, kv_head, ..]);

            let Scores {
                raw,
                visible,
            } = scores(query, key, params);
            let mut probabilities = raw;
            ndarray::Zip::from(&mut probabilities).and(&visible).for_each(
                |score, visible| {
                    *score = if *visible {
                        params.activation.apply(*score)
                    } else {
                        0.0
                    };
                },
            );
            output
                .slice_mut(s![q_begin..q_end, head, ..])
                .assign(&probabilities.dot(&value));
        }
    }
    Ok(output)
}

pub fn reference_backward(
    inputs: &GdpaInputs,
    d_output: &Array3<f32>,
    params: &AttentionParams,
) -> Result<Gradients, GdpaError> {
    let shape = inputs.validate()?;
    let mut d_query = Array3::zeros(inputs.query.dim());
    let mut d_key = Array3::zeros(inputs.key.dim());
    let mut d_value = Array3::zeros(inputs.value.dim());

    for batch in 0..shape.batch {
        let (q_begin, q_end) = rows(
            inputs.query_offsets.begin(batch),
            inputs.query_offsets.len(batch),
            inputs.max_seq_len_q,
        );
        let (k_begin, k_end) = rows(
            inputs.key_offsets.begin(batch),
            inputs.key_offsets.len(batch),
            inputs.max_seq_len_kv,
        );
        for head in 0..shape.heads {
            let kv_head = head / shape.group_size;
            let query = inputs.query.slice(s![q_begin..q_end, head, ..]);
            let key = inputs.key.slice(s![k_begin..k_end, kv_head, ..]);
            let value = inputs.value.slice(s![k_begin..k_end, kv_head, ..]);
            let d_out = d_output.slice(s![q_begin..q_end, head, ..]);

            let Scores {
                raw,
                visible,
            } = scores(query, key, params);
            let probabilities = Array2::from_shape_fn(raw.dim(), |index| {
                if visible[index] {
                    params.activation.apply(raw[index])
                } else {
                    0.0
                }
            });
            let d_probabilities = d_out.dot(&value.t());
            let d_scores = Array2::from_shape_fn(raw.dim(), |index| {
                if visible[index] {
                    params.activation.derivative(raw[index])
                        * d_probabilities[index]
                        * params.qk_scale
                } else {
                    0.0
                }
            });

            d_query
                .slice_mut(s![q_begin..q_end, head, ..])
                .assign(&d_scores.dot(&key));
            let mut d_key_rows = d_key.slice_mut(s![k_begin..k_end, kv_head, ..]);
            d_key_rows += &d_scores.t().dot(&query);
            let mut d_value_rows = d_value.slice_mut(s![k_begin..k_end, kv_head, ..]);
            d_value_rows += &probabilities.t().dot(&d_out);
        }
    }
    Ok(Gradients {
        d_query,
        d_key,
        d_value,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::{Activation, RaggedOffsets};

    fn inputs() -> GdpaInputs {
        let query = Array3::from_shape_fn((5, 1, 3), |(row, _, column)| {
            ((row * 3 + column) as f32 * 0.37).sin() * 0.5
        });
        let key = Array3::from_shape_fn((6, 1, 3), |(row, _, column)| {
            ((row * 5 + column) as f32 * 0.21).cos() * 0.5
        });
        let value = Array3::from_shape_fn((6, 1, 2), |(row, _, column)| {
            ((row + 2 * column) as f32 * 0.13).sin()
        });
        GdpaInputs::new(
            query,
            key,
            value,
            RaggedOffsets::from_lengths(&[2, 3]),
            RaggedOffsets::from_lengths(&[4, 2]),
        )
    }

    fn loss(
        inputs: &GdpaInputs,
        weights: &Array3<f32>,
        params: &AttentionParams,
    ) -> f32 {
        let output = reference_forward(inputs, params).unwrap();
        (&output * weights).sum()
    }

    #[test]
    fn test_identity_activation_without_mask_is_plain_matmul() {
        let inputs = inputs();
        let params = AttentionParams {
            activation: Activation::Identity,
            ..AttentionParams::default()
        };
        let output = reference_forward(&inputs, &params).unwrap();
        let query: ArrayView2<f32> = inputs.query.slice(s![0..2, 0, ..]);
        let key: ArrayView2<f32> = inputs.key.slice(s![0..4, 0, ..]);
        let value: ArrayView2<f32> = inputs.value.slice(s![0..4, 0, ..]);
        let scores: Array2<f32> = query.dot(&key.t());
        let expected: Array2<f32> = scores.dot(&value);
        for ((row, column), expected) in expected.indexed_iter() {
            assert!((output[[row, 0, column]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut inputs = inputs();
        let params = AttentionParams {
            activation: Activation::FastGelu,
            causal: true,
            qk_scale: 0.8,
            ..AttentionParams::default()
        };
        let weights = Array3::from_shape_fn((5, 1, 2), |(row, _, column)| {
            1.0 + 0.1 * row as f32 - 0.3 * column as f32
        });
        let gradients = reference_backward(&inputs, &weights, &params).unwrap();

        let eps = 1e-2f32;
        for index in [[1, 0, 2], [3, 0, 0], [4, 0, 1]] {
            let saved = inputs.query[index];
            inputs.query[index] = saved + eps;
            let plus = loss(&inputs, &weights, &params);
            inputs.query[index] = saved - eps;
            let minus = loss(&inputs, &weights, &params);
            inputs.query[index] = saved;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - gradients.d_query[index]).abs() < 1e-2);
        }
        for index in [[0, 0, 1], [5, 0, 2]] {
            let saved = inputs.key[index];
            inputs.key[index] = saved + eps;
            let plus = loss(&inputs, &weights, &params);
            inputs.key[index] = saved - eps;
            let minus = loss(&inputs, &weights, &params);
            inputs.key[index] = saved;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - gradients.d_key[index]).abs() < 1e-2);
        }
        for index in [[2, 0, 0], [4, 0, 1]] {
            let saved = inputs.value[index];
            inputs.value[index] = saved + eps;
            let plus = loss(&inputs, &weights, &params);
            inputs.value[index] = saved - eps;
            let minus = loss(&inputs, &weights, &params);
            inputs.value[index] = saved;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - gradients.d_value[index]).abs() < 1e-2);
        }
    }
}
