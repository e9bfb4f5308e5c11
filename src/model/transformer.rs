//! F5 diffusion transformer (DiT).
//!
//! A single-stream DiT over mel frames with:
//! - Sinusoidal timestep embedding → MLP, driving AdaLN-zero in every block
//! - Input embedding fusing noisy latent, audio condition and text embedding,
//!   plus a convolutional position embedding
//! - Segment-gated rotary self-attention
//! - GELU(tanh) feed-forward
//!
//! ## Config (base checkpoint)
//!
//! ```text
//! dim:        1024
//! depth:      22
//! heads:      16
//! dim_head:   64
//! ff_mult:    2
//! mel_dim:    100
//! text_dim:   512
//! ```
//!
//! ## Weight names
//!
//! ```text
//! time_embed.time_mlp.{0,2}
//! input_embed.proj, input_embed.conv_pos_embed.conv1d.{0,2}
//! transformer_blocks.{i}.attn_norm.linear
//! transformer_blocks.{i}.attn.{to_q,to_k,to_v,to_out.0}
//! transformer_blocks.{i}.ff.ff.{0.0,2}
//! norm_out.linear, proj_out
//! ```

pub mod attention;
pub mod feed_forward;
pub mod input;
pub mod layers;
pub mod rope;
pub mod timestep;

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::Result;
use crate::attention::AttentionKernel;
use crate::config::F5Config;
use crate::sampler::Denoiser;
use input::InputEmbedding;
use layers::{AdaLayerNormFinal, DiTBlock};
use rope::RotaryEmbedding;
use timestep::TimestepEmbedding;

/// Complete F5 transformer.
#[derive(Debug, Clone)]
pub struct F5Transformer {
    time_embed: TimestepEmbedding,
    input_embed: InputEmbedding,
    rotary_embed: RotaryEmbedding,
    transformer_blocks: Vec<DiTBlock>,
    norm_out: AdaLayerNormFinal,
    proj_out: Linear,
    config: F5Config,
}

impl F5Transformer {
    pub fn new(cfg: &F5Config, kernel: AttentionKernel, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let transformer_blocks = (0..cfg.depth)
            .map(|i| {
                DiTBlock::new(
                    cfg.dim,
                    cfg.heads,
                    cfg.dim_head,
                    cfg.ff_mult,
                    cfg.qkv_bias,
                    cfg.norm_eps,
                    kernel.clone(),
                    vb.pp(format!("transformer_blocks.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            depth = cfg.depth,
            dim = cfg.dim,
            kernel = kernel.kind().name(),
            "built F5 transformer"
        );

        Ok(Self {
            time_embed: TimestepEmbedding::new(cfg.dim, vb.pp("time_embed"))?,
            input_embed: InputEmbedding::new(
                cfg.mel_dim,
                cfg.text.text_dim,
                cfg.dim,
                vb.pp("input_embed"),
            )?,
            rotary_embed: RotaryEmbedding::new(cfg.dim_head, cfg.rope_theta),
            transformer_blocks,
            norm_out: AdaLayerNormFinal::new(cfg.dim, cfg.norm_eps, vb.pp("norm_out"))?,
            proj_out: candle_nn::linear(cfg.dim, cfg.mel_dim, vb.pp("proj_out"))?,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &F5Config {
        &self.config
    }

    /// Predict the flow at `time`.
    ///
    /// - `x`: noisy latent `[B, S, mel_dim]`
    /// - `cond`: masked reference mel `[B, S, mel_dim]`
    /// - `text_embed`: `[B, S, text_dim]`
    /// - `time`: `[B]` (or a scalar, broadcast over the batch)
    /// - `segment_ids`: `[B, S]`, 1 inside the target duration
    ///
    /// Returns `[B, S, mel_dim]` in the dtype of `x`.
    pub fn forward(
        &self,
        x: &Tensor,
        cond: &Tensor,
        text_embed: &Tensor,
        time: &Tensor,
        segment_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        let out_dtype = x.dtype();
        let dtype = self.proj_out.weight().dtype();
        let (batch, seq_len, _) = x.dims3()?;
        let time = match time.rank() {
            0 => time.broadcast_as(batch)?.contiguous()?,
            _ => time.clone(),
        };

        let t = self.time_embed.forward(&time)?;
        let mut h = self.input_embed.forward(
            &x.to_dtype(dtype)?,
            &cond.to_dtype(dtype)?,
            &text_embed.to_dtype(dtype)?,
        )?;
        let rope = self
            .rotary_embed
            .tables(seq_len, segment_ids, x.device())?;

        for block in &self.transformer_blocks {
            h = block.forward(&h, &t, Some(&rope), segment_ids)?;
        }

        let h = self.norm_out.forward(&h, &t)?;
        self.proj_out
            .forward(&h)?
            .to_dtype(out_dtype)
            .map_err(Into::into)
    }
}

impl Denoiser for F5Transformer {
    fn predict(
        &self,
        latents: &Tensor,
        cond: &Tensor,
        text_embed: &Tensor,
        time: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<Tensor> {
        self.forward(latents, cond, text_embed, time, Some(segment_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TextEmbeddingConfig;
    use crate::sampler::lens_to_mask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> F5Config {
        F5Config {
            dim: 32,
            depth: 2,
            heads: 4,
            dim_head: 8,
            ff_mult: 2,
            mel_dim: 6,
            text: TextEmbeddingConfig {
                text_num_embeds: 10,
                text_dim: 8,
                conv_layers: 1,
                conv_mult: 2,
                max_pos: 64,
            },
            ..F5Config::default()
        }
    }

    #[test]
    fn forward_shape_and_dtype() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = tiny_config();
        let model = F5Transformer::new(&cfg, AttentionKernel::DotProduct, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 20, 6), &device).unwrap();
        let cond = Tensor::zeros((2, 20, 6), DType::F32, &device).unwrap();
        let text = Tensor::randn(0f32, 1.0, (2, 20, 8), &device).unwrap();
        let time = Tensor::new(0.5f32, &device).unwrap();
        let segments = lens_to_mask(&[20, 14], 20, DType::U32, &device).unwrap();
        let out = model
            .forward(&x, &cond, &text, &time, Some(&segments))
            .unwrap();
        assert_eq!(out.dims(), &[2, 20, 6]);
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn invalid_config_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let cfg = F5Config {
            dim: 30,
            ..tiny_config()
        };
        assert!(F5Transformer::new(&cfg, AttentionKernel::DotProduct, vb).is_err());
    }
}
