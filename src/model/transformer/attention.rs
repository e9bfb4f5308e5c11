//! Multi-head attention layers.
//!
//! - [`Attention`]: split `to_q`/`to_k`/`to_v` projections, optional
//!   cross-attention context, segment-gated RoPE, output projection and
//!   segment masking. Used by the DiT and the cross-attention block.
//! - [`JointAttention`]: fused `i_qkv` projection with an optional encoder
//!   stream (`e_qkv`); Q/K are RMS-normalised per head and the encoder tokens
//!   are placed in front of the latent tokens before attention.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, RmsNorm, VarBuilder};

use super::rope::{RopeTables, RotaryEmbedding};
use crate::Result;
use crate::attention::{AttentionKernel, AttentionOp, merge_heads, split_heads};

/// `x [B, S, C] * segment_ids [B, S]`
pub(crate) fn mask_by_segments(x: &Tensor, segment_ids: &Tensor) -> Result<Tensor> {
    let mask = segment_ids.to_dtype(x.dtype())?.unsqueeze(2)?;
    x.broadcast_mul(&mask).map_err(Into::into)
}

/// Split-projection multi-head attention.
#[derive(Debug, Clone)]
pub struct Attention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    op: AttentionOp,
}

impl Attention {
    /// - `context_dim`: width of the key/value source; `None` for
    ///   self-attention
    pub fn new(
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        qkv_bias: bool,
        kernel: AttentionKernel,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: candle_nn::linear_b(query_dim, inner_dim, qkv_bias, vb.pp("to_q"))?,
            to_k: candle_nn::linear_b(context_dim, inner_dim, qkv_bias, vb.pp("to_k"))?,
            to_v: candle_nn::linear_b(context_dim, inner_dim, qkv_bias, vb.pp("to_v"))?,
            to_out: candle_nn::linear(inner_dim, query_dim, vb.pp("to_out.0"))?,
            op: AttentionOp::new(kernel, heads, dim_head),
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, S, query_dim]`
    /// - `context`: `[B, S_ctx, context_dim]`, keys/values come from here
    ///   when present
    /// - `rope`: tables from [`RotaryEmbedding::tables`], applied to queries
    ///   and keys
    /// - `segment_ids`: `[B, S]`; restricts attention to equal ids and zeroes
    ///   the output where the id is 0
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        context: Option<&Tensor>,
        rope: Option<&RopeTables>,
        segment_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        let context = context.unwrap_or(hidden_states);
        let q = self.to_q.forward(hidden_states)?;
        let k = self.to_k.forward(context)?;
        let v = self.to_v.forward(context)?;

        let (q, k) = match rope {
            Some(tables) => {
                let heads = self.op.heads();
                let rotate = |x: &Tensor| -> Result<Tensor> {
                    let x = split_heads(x, heads)?;
                    merge_heads(&RotaryEmbedding::apply(&x, tables)?)
                };
                (rotate(&q)?, rotate(&k)?)
            }
            None => (q, k),
        };

        let out = self.op.apply(&q, &k, &v, segment_ids)?;
        let out = self.to_out.forward(&out)?;
        match segment_ids {
            Some(segments) => mask_by_segments(&out, segments),
            None => Ok(out),
        }
    }
}

/// Fused-QKV attention with an optional encoder stream.
#[derive(Debug, Clone)]
pub struct JointAttention {
    i_qkv: Linear,
    i_proj: Linear,
    query_norm: RmsNorm,
    key_norm: RmsNorm,
    encoder: Option<EncoderStream>,
    op: AttentionOp,
}

#[derive(Debug, Clone)]
struct EncoderStream {
    e_qkv: Linear,
    e_proj: Linear,
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

/// Epsilon of the per-head Q/K RMS norms.
const QK_NORM_EPS: f64 = 1e-6;

impl JointAttention {
    pub fn new(
        query_dim: usize,
        heads: usize,
        dim_head: usize,
        qkv_bias: bool,
        with_encoder: bool,
        kernel: AttentionKernel,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let encoder = if with_encoder {
            Some(EncoderStream {
                e_qkv: candle_nn::linear_b(query_dim, inner_dim * 3, qkv_bias, vb.pp("e_qkv"))?,
                e_proj: candle_nn::linear(inner_dim, query_dim, vb.pp("e_proj"))?,
                query_norm: candle_nn::rms_norm(dim_head, QK_NORM_EPS, vb.pp("encoder_query_norm"))?,
                key_norm: candle_nn::rms_norm(dim_head, QK_NORM_EPS, vb.pp("encoder_key_norm"))?,
            })
        } else {
            None
        };
        Ok(Self {
            i_qkv: candle_nn::linear_b(query_dim, inner_dim * 3, qkv_bias, vb.pp("i_qkv"))?,
            i_proj: candle_nn::linear(inner_dim, query_dim, vb.pp("i_proj"))?,
            query_norm: candle_nn::rms_norm(dim_head, QK_NORM_EPS, vb.pp("query_norm"))?,
            key_norm: candle_nn::rms_norm(dim_head, QK_NORM_EPS, vb.pp("key_norm"))?,
            encoder,
            op: AttentionOp::new(kernel, heads, dim_head),
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, S, query_dim]`
    /// - `encoder_hidden_states`: `[B, E, query_dim]`, requires the encoder
    ///   stream
    /// - `rope`: tables covering the joint sequence (`E + S` positions)
    ///
    /// Returns `(latent_out [B, S, query_dim], encoder_out [B, E, query_dim])`
    /// when encoder states are given, otherwise `(attention [B, S, H·D], None)`
    /// with neither output projection applied.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        rope: Option<&RopeTables>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let heads = self.op.heads();
        let (mut q, mut k, mut v) =
            fused_qkv(&self.i_qkv, &self.query_norm, &self.key_norm, hidden_states, heads)?;

        let encoder_len = match (encoder_hidden_states, &self.encoder) {
            (Some(enc), Some(stream)) => {
                let (eq, ek, ev) =
                    fused_qkv(&stream.e_qkv, &stream.query_norm, &stream.key_norm, enc, heads)?;
                q = Tensor::cat(&[&eq, &q], 2)?;
                k = Tensor::cat(&[&ek, &k], 2)?;
                v = Tensor::cat(&[&ev, &v], 2)?;
                Some(enc.dim(1)?)
            }
            (Some(_), None) => {
                return Err(crate::Error::Config(
                    "encoder states passed to a joint attention without an encoder stream".into(),
                ));
            }
            _ => None,
        };

        if let Some(tables) = rope {
            q = RotaryEmbedding::apply(&q, tables)?;
            k = RotaryEmbedding::apply(&k, tables)?;
        }

        let out = self.op.apply(&merge_heads(&q)?, &merge_heads(&k)?, &merge_heads(&v)?, None)?;

        match (encoder_len, &self.encoder) {
            (Some(enc_len), Some(stream)) => {
                let total = out.dim(1)?;
                let context = stream.e_proj.forward(&out.narrow(1, 0, enc_len)?)?;
                let latent = self.i_proj.forward(&out.narrow(1, enc_len, total - enc_len)?)?;
                Ok((latent, Some(context)))
            }
            // Without an encoder stream the heads come back unprojected.
            _ => Ok((out, None)),
        }
    }
}

/// Project with a fused `[3·H·D]` layer and normalise Q/K per head.
/// Returns Q, K, V as `[B, H, S, D]`.
fn fused_qkv(
    qkv: &Linear,
    query_norm: &RmsNorm,
    key_norm: &RmsNorm,
    x: &Tensor,
    heads: usize,
) -> Result<(Tensor, Tensor, Tensor)> {
    let (b, s, _) = x.dims3()?;
    let proj = qkv.forward(x)?;
    let dim_head = proj.dim(2)? / (3 * heads);
    // [B, S, 3, H, D] → 3 × [B, H, S, D]
    let proj = proj.reshape((b, s, 3, heads, dim_head))?;
    let take = |i: usize| -> Result<Tensor> {
        Ok(proj.narrow(2, i, 1)?.squeeze(2)?.transpose(1, 2)?.contiguous()?)
    };
    let q = query_norm.forward(&take(0)?)?;
    let k = key_norm.forward(&take(1)?)?;
    Ok((q, k, take(2)?))
}
