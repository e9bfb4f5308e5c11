//! Transformer block types.
//!
//! - [`DiTBlock`]: AdaLN-zero self-attention + feed-forward, modulated by the
//!   timestep embedding
//! - [`BasicTransformerBlock`]: LayerNorm self-attention, cross-attention to a
//!   context, GEGLU feed-forward
//! - [`AdaLayerNormZero`] / [`AdaLayerNormFinal`]: timestep-driven
//!   scale/shift/gate producers

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::Attention;
use super::feed_forward::{GegluFeedForward, GeluFeedForward};
use super::rope::RopeTables;
use crate::Result;
use crate::attention::AttentionKernel;

/// LayerNorm without learned affine parameters, computed in f32.
pub(crate) fn layer_norm(x: &Tensor, eps: f64) -> Result<Tensor> {
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let out = centered.broadcast_div(&(var + eps)?.sqrt()?)?;
    out.to_dtype(dtype).map_err(Into::into)
}

/// `x · (1 + scale) + shift`, with `scale`/`shift` of shape `[B, C]`.
fn modulate(x: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let scale = (scale.unsqueeze(1)? + 1.0)?;
    Ok(x.broadcast_mul(&scale)?.broadcast_add(&shift.unsqueeze(1)?)?)
}

/// Modulation produced by [`AdaLayerNormZero`] for one block.
pub struct Modulation {
    /// `LayerNorm(x) · (1 + scale_msa) + shift_msa`
    pub normed: Tensor,
    pub gate_msa: Tensor,
    pub shift_mlp: Tensor,
    pub scale_mlp: Tensor,
    pub gate_mlp: Tensor,
}

/// `SiLU → Linear(dim → 6·dim)` producing the six AdaLN-zero parameters.
#[derive(Debug, Clone)]
pub struct AdaLayerNormZero {
    linear: Linear,
    eps: f64,
}

impl AdaLayerNormZero {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: candle_nn::linear(dim, dim * 6, vb.pp("linear"))?,
            eps,
        })
    }

    /// - `x`: `[B, S, dim]`
    /// - `emb`: timestep embedding `[B, dim]`
    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Modulation> {
        let params = self.linear.forward(&emb.silu()?)?;
        let chunks = params.chunk(6, D::Minus1)?;
        let normed = modulate(&layer_norm(x, self.eps)?, &chunks[0], &chunks[1])?;
        Ok(Modulation {
            normed,
            gate_msa: chunks[2].clone(),
            shift_mlp: chunks[3].clone(),
            scale_mlp: chunks[4].clone(),
            gate_mlp: chunks[5].clone(),
        })
    }
}

/// Final `SiLU → Linear(dim → 2·dim)` modulation before `proj_out`.
#[derive(Debug, Clone)]
pub struct AdaLayerNormFinal {
    linear: Linear,
    eps: f64,
}

impl AdaLayerNormFinal {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: candle_nn::linear(dim, dim * 2, vb.pp("linear"))?,
            eps,
        })
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let params = self.linear.forward(&emb.silu()?)?;
        // Order is (scale, shift).
        let chunks = params.chunk(2, D::Minus1)?;
        modulate(&layer_norm(x, self.eps)?, &chunks[1], &chunks[0])
    }
}

/// F5 DiT block.
///
/// ```text
/// m     = attn_norm(x, t)
/// x     = x + gate_msa · attn(m.normed, rope, segments)
/// x     = x + gate_mlp · ff(LayerNorm(x) · (1 + scale_mlp) + shift_mlp)
/// ```
#[derive(Debug, Clone)]
pub struct DiTBlock {
    attn_norm: AdaLayerNormZero,
    attn: Attention,
    ff: GeluFeedForward,
    eps: f64,
}

impl DiTBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        heads: usize,
        dim_head: usize,
        ff_mult: usize,
        qkv_bias: bool,
        eps: f64,
        kernel: AttentionKernel,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attn_norm: AdaLayerNormZero::new(dim, eps, vb.pp("attn_norm"))?,
            attn: Attention::new(dim, None, heads, dim_head, qkv_bias, kernel, vb.pp("attn"))?,
            ff: GeluFeedForward::new(dim, ff_mult, vb.pp("ff"))?,
            eps,
        })
    }

    /// - `x`: `[B, S, dim]`
    /// - `t`: timestep embedding `[B, dim]`
    /// - `rope`: segment-gated tables for `S` positions
    /// - `segment_ids`: `[B, S]` duration mask
    pub fn forward(
        &self,
        x: &Tensor,
        t: &Tensor,
        rope: Option<&RopeTables>,
        segment_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        let m = self.attn_norm.forward(x, t)?;
        let attn = self.attn.forward(&m.normed, None, rope, segment_ids)?;
        let x = (x + attn.broadcast_mul(&m.gate_msa.unsqueeze(1)?)?)?;

        let normed = modulate(&layer_norm(&x, self.eps)?, &m.shift_mlp, &m.scale_mlp)?;
        let ff = self.ff.forward(&normed)?;
        Ok((x + ff.broadcast_mul(&m.gate_mlp.unsqueeze(1)?)?)?)
    }
}

/// LayerNorm epsilon of [`BasicTransformerBlock`].
const BASIC_BLOCK_NORM_EPS: f64 = 1e-5;

/// Self-attention, cross-attention and GEGLU feed-forward, each pre-normed
/// with an affine LayerNorm and added back residually.
#[derive(Debug, Clone)]
pub struct BasicTransformerBlock {
    norm1: LayerNorm,
    attn1: Attention,
    norm2: LayerNorm,
    attn2: Attention,
    norm3: LayerNorm,
    ff: GegluFeedForward,
}

impl BasicTransformerBlock {
    pub fn new(
        dim: usize,
        context_dim: usize,
        heads: usize,
        dim_head: usize,
        kernel: AttentionKernel,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(dim, BASIC_BLOCK_NORM_EPS, vb.pp("norm1"))?,
            attn1: Attention::new(dim, None, heads, dim_head, false, kernel.clone(), vb.pp("attn1"))?,
            norm2: candle_nn::layer_norm(dim, BASIC_BLOCK_NORM_EPS, vb.pp("norm2"))?,
            attn2: Attention::new(
                dim,
                Some(context_dim),
                heads,
                dim_head,
                false,
                kernel,
                vb.pp("attn2"),
            )?,
            norm3: candle_nn::layer_norm(dim, BASIC_BLOCK_NORM_EPS, vb.pp("norm3"))?,
            ff: GegluFeedForward::new(dim, vb.pp("ff"))?,
        })
    }

    /// - `x`: `[B, S, dim]`
    /// - `context`: `[B, S_ctx, context_dim]`
    pub fn forward(&self, x: &Tensor, context: &Tensor) -> Result<Tensor> {
        let h = (self.attn1.forward(&self.norm1.forward(x)?, None, None, None)? + x)?;
        let h = (self.attn2.forward(&self.norm2.forward(&h)?, Some(context), None, None)? + &h)?;
        Ok((self.ff.forward(&self.norm3.forward(&h)?)? + &h)?)
    }
}
