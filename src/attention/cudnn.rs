//! Fused attention in `[batch, seq, heads, head_dim]` layout.
//!
//! With the `flash-attn` feature the per-shard call goes to
//! `candle_flash_attn::flash_attn` (CUDA, f16/bf16). Without it the same
//! unmasked softmax attention is computed with candle ops. No mask is
//! applied in either case.

use candle_core::Tensor;

use crate::Result;
use crate::mesh::{LogicalAxis, Mesh};

/// Unmasked attention, batch-sharded over the mesh.
pub fn attention(
    mesh: &Mesh,
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    heads: usize,
    scale: f64,
) -> Result<Tensor> {
    let (batch, q_len, depth) = query.dims3()?;
    let kv_len = key.dim(1)?;
    let head_dim = depth / heads;

    // [B, S, H, D]
    let q = query.reshape((batch, q_len, heads, head_dim))?;
    let k = key.reshape((batch, kv_len, heads, head_dim))?;
    let v = value.reshape((batch, kv_len, heads, head_dim))?;

    let q_shards = mesh.split(&q, LogicalAxis::Batch)?;
    let k_shards = mesh.split(&k, LogicalAxis::Batch)?;
    let v_shards = mesh.split(&v, LogicalAxis::Batch)?;

    let mut outputs = Vec::with_capacity(q_shards.len());
    for ((q, k), v) in q_shards.iter().zip(&k_shards).zip(&v_shards) {
        outputs.push(fused(q, k, v, scale)?);
    }

    let out = Mesh::gather(&outputs, query.device())?;
    out.reshape((batch, q_len, depth)).map_err(Into::into)
}

#[cfg(feature = "flash-attn")]
fn fused(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    candle_flash_attn::flash_attn(q, k, v, scale as f32, false).map_err(Into::into)
}

#[cfg(not(feature = "flash-attn"))]
fn fused(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    use candle_core::DType;

    let dtype = q.dtype();
    let q = q.transpose(1, 2)?.to_dtype(DType::F32)?.contiguous()?;
    let k = k.transpose(1, 2)?.to_dtype(DType::F32)?;
    let v = v.transpose(1, 2)?.to_dtype(DType::F32)?.contiguous()?;
    let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    // [B, H, S, D] → [B, S, H, D]
    probs
        .matmul(&v)?
        .transpose(1, 2)?
        .to_dtype(dtype)
        .map_err(Into::into)
}
