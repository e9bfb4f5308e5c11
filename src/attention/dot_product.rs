//! Reference scaled dot-product attention.

use candle_core::{DType, Tensor};

use super::{DOT_MASK_VALUE, mask_scores, merge_heads, segment_mask, split_heads};
use crate::Result;

/// `softmax(Q·Kᵗ · scale) · V` with the score product in f32.
///
/// With `segment_ids`, a query only attends to keys carrying the same id;
/// every other score is replaced by [`DOT_MASK_VALUE`] before the softmax.
pub fn attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    segment_ids: Option<&Tensor>,
    heads: usize,
    scale: f64,
) -> Result<Tensor> {
    let dtype = query.dtype();
    let v = split_heads(value, heads)?.contiguous()?;
    let probs = attention_weights(query, key, segment_ids, heads, scale)?.to_dtype(v.dtype())?;
    let out = probs.matmul(&v)?;
    merge_heads(&out)?.to_dtype(dtype).map_err(Into::into)
}

/// Softmax attention weights `[B, H, Sq, Sk]` in f32.
pub fn attention_weights(
    query: &Tensor,
    key: &Tensor,
    segment_ids: Option<&Tensor>,
    heads: usize,
    scale: f64,
) -> Result<Tensor> {
    let q = split_heads(query, heads)?.to_dtype(DType::F32)?.contiguous()?;
    let k = split_heads(key, heads)?.to_dtype(DType::F32)?;
    let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
    let scores = match segment_ids {
        Some(segments) => mask_scores(&scores, &segment_mask(segments, segments)?, DOT_MASK_VALUE)?,
        None => scores,
    };
    candle_nn::ops::softmax_last_dim(&scores).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn output_shape_matches_query() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 6, 16), &dev).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 9, 16), &dev).unwrap();
        let v = Tensor::randn(0f32, 1.0, (2, 9, 16), &dev).unwrap();
        let out = attention(&q, &k, &v, None, 4, 0.5).unwrap();
        assert_eq!(out.dims(), &[2, 6, 16]);
    }

    #[test]
    fn cross_segment_weight_is_zero() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 6, 8), &dev).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 6, 8), &dev).unwrap();
        let segments = Tensor::new(&[[1u32, 1, 1, 2, 2, 0]], &dev).unwrap();
        let weights = attention_weights(&q, &k, Some(&segments), 2, 0.5).unwrap();
        let heads: Vec<Vec<Vec<f32>>> = (0..2)
            .map(|h| weights.get(0).unwrap().get(h).unwrap().to_vec2().unwrap())
            .collect();
        let ids = [1, 1, 1, 2, 2, 0];
        for head in &heads {
            for (i, row) in head.iter().enumerate() {
                let total: f32 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-5);
                for (j, w) in row.iter().enumerate() {
                    if ids[i] != ids[j] {
                        assert_eq!(*w, 0.0, "query {i} leaked onto key {j}");
                    }
                }
            }
        }
    }

    #[test]
    fn uniform_keys_average_values() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 3, 4), &dev).unwrap();
        let k = Tensor::zeros((1, 5, 4), DType::F32, &dev).unwrap();
        let v = Tensor::arange(0f32, 20.0, &dev).unwrap().reshape((1, 5, 4)).unwrap();
        let out = attention(&q, &k, &v, None, 1, 1.0).unwrap();
        // Equal scores → mean over the 5 value rows.
        let first: Vec<f32> = out.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert!((first[0] - 8.0).abs() < 1e-4);
        assert!((first[3] - 11.0).abs() < 1e-4);
    }
}
