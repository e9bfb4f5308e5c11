//! Chunked attention with an online softmax.
//!
//! Queries are processed in chunks of `query_chunk_size`; for each query
//! chunk the keys are streamed in chunks of `key_chunk_size`, keeping a
//! running maximum, a running softmax denominator and a running weighted sum
//! of values:
//!
//! ```text
//! m' = max(m, max_j s_j)
//! l' = l·exp(m − m') + Σ_j exp(s_j − m')
//! o' = o·exp(m − m') + Σ_j exp(s_j − m')·v_j
//! out = o / l
//! ```
//!
//! Peak memory is `O(query_chunk × key_chunk)` per head instead of
//! `O(Sq × Sk)`.

use candle_core::{D, DType, Tensor};

use super::{DOT_MASK_VALUE, mask_scores, merge_heads, segment_mask, split_heads};
use crate::Result;

pub const DEFAULT_QUERY_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_KEY_CHUNK_SIZE: usize = 4096;

/// Running statistics for one query chunk.
struct Accumulator {
    /// Σ exp(s − max) · v, `[B, H, q, D]`
    values: Tensor,
    /// Σ exp(s − max), `[B, H, q, 1]`
    weights: Tensor,
    /// running max, `[B, H, q, 1]`
    max: Tensor,
}

impl Accumulator {
    fn merge(self, values: Tensor, weights: Tensor, max: Tensor) -> Result<Self> {
        let new_max = self.max.maximum(&max)?;
        let old_scale = (self.max - &new_max)?.exp()?;
        let new_scale = (max - &new_max)?.exp()?;
        Ok(Self {
            values: (self.values.broadcast_mul(&old_scale)? + values.broadcast_mul(&new_scale)?)?,
            weights: ((self.weights * &old_scale)? + (weights * &new_scale)?)?,
            max: new_max,
        })
    }
}

/// Chunked softmax attention, numerically equal to the dot-product kernel.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    segment_ids: Option<&Tensor>,
    heads: usize,
    scale: f64,
    query_chunk_size: usize,
    key_chunk_size: usize,
) -> Result<Tensor> {
    let dtype = query.dtype();
    let q = split_heads(query, heads)?.to_dtype(DType::F32)?;
    let k = split_heads(key, heads)?.to_dtype(DType::F32)?;
    let v = split_heads(value, heads)?.to_dtype(DType::F32)?;
    let out = online_softmax(
        &q,
        &k,
        &v,
        segment_ids,
        scale,
        query_chunk_size,
        key_chunk_size,
        DOT_MASK_VALUE,
    )?;
    merge_heads(&out)?.to_dtype(dtype).map_err(Into::into)
}

/// Online-softmax attention over f32 `[B, H, S, D]` tensors.
///
/// `segment_ids` is `[B, S]` and requires `Sq == Sk`; masked scores are
/// replaced by `mask_value`.
#[allow(clippy::too_many_arguments)]
pub(super) fn online_softmax(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    segment_ids: Option<&Tensor>,
    scale: f64,
    query_chunk_size: usize,
    key_chunk_size: usize,
    mask_value: f64,
) -> Result<Tensor> {
    let q_len = q.dim(2)?;
    let kv_len = k.dim(2)?;
    let query_chunk_size = query_chunk_size.max(1);
    let key_chunk_size = key_chunk_size.max(1);

    let mut chunks = Vec::with_capacity(q_len.div_ceil(query_chunk_size));
    for q_start in (0..q_len).step_by(query_chunk_size) {
        let q_size = query_chunk_size.min(q_len - q_start);
        let q_chunk = q.narrow(2, q_start, q_size)?.contiguous()?;
        let q_segments = segment_ids
            .map(|segments| segments.narrow(1, q_start, q_size))
            .transpose()?;

        let mut acc: Option<Accumulator> = None;
        for k_start in (0..kv_len).step_by(key_chunk_size) {
            let k_size = key_chunk_size.min(kv_len - k_start);
            let k_chunk = k.narrow(2, k_start, k_size)?;
            let v_chunk = v.narrow(2, k_start, k_size)?.contiguous()?;

            let scores = q_chunk.matmul(&k_chunk.transpose(2, 3)?.contiguous()?)?;
            let scores = if scale == 1.0 { scores } else { (scores * scale)? };
            let scores = match (&q_segments, segment_ids) {
                (Some(q_segments), Some(segments)) => {
                    let k_segments = segments.narrow(1, k_start, k_size)?;
                    mask_scores(&scores, &segment_mask(q_segments, &k_segments)?, mask_value)?
                }
                _ => scores,
            };

            let max = scores.max_keepdim(D::Minus1)?;
            let exp = scores.broadcast_sub(&max)?.exp()?;
            let weights = exp.sum_keepdim(D::Minus1)?;
            let values = exp.matmul(&v_chunk)?;

            acc = Some(match acc {
                None => Accumulator {
                    values,
                    weights,
                    max,
                },
                Some(acc) => acc.merge(values, weights, max)?,
            });
        }

        if let Some(acc) = acc {
            chunks.push(acc.values.broadcast_div(&acc.weights)?);
        }
    }

    Tensor::cat(&chunks, 2).map_err(Into::into)
}
