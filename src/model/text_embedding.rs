//! Character/pinyin text embedder.
//!
//! ```text
//! ids [B, S] → text_embed (text_num_embeds + 1, text_dim)
//!            + sinusoidal positions [cos | sin]
//!            → ConvNeXt-V2 × conv_layers (padding re-zeroed after each)
//!            → [B, S, text_dim]
//! ```
//!
//! Ids are already shifted by one (0 is the filler token), so they index the
//! table directly.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Embedding, LayerNorm, Linear, VarBuilder};

use crate::Result;
use crate::config::TextEmbeddingConfig;

const CONVNEXT_KERNEL: usize = 7;
const CONVNEXT_NORM_EPS: f64 = 1e-6;
const GRN_EPS: f64 = 1e-6;

/// Global response normalisation over the sequence axis.
///
/// `Gx = ‖x‖₂ over S`, `Nx = Gx / (mean_C(Gx) + ε)`, `γ·(x·Nx) + β + x`.
#[derive(Debug, Clone)]
struct Grn {
    gamma: Tensor,
    beta: Tensor,
}

impl Grn {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gamma: vb.get((1, 1, dim), "gamma")?,
            beta: vb.get((1, 1, dim), "beta")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gx = x.sqr()?.sum_keepdim(1)?.sqrt()?;
        let nx = gx.broadcast_div(&(gx.mean_keepdim(D::Minus1)? + GRN_EPS)?)?;
        let scaled = x.broadcast_mul(&nx)?.broadcast_mul(&self.gamma)?;
        Ok(scaled.broadcast_add(&self.beta)?.add(x)?)
    }
}

/// Depthwise conv → LayerNorm → pointwise MLP with GRN, residual.
#[derive(Debug, Clone)]
struct ConvNeXtV2Block {
    dwconv: Conv1d,
    norm: LayerNorm,
    pwconv1: Linear,
    grn: Grn,
    pwconv2: Linear,
}

impl ConvNeXtV2Block {
    fn new(dim: usize, intermediate_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: CONVNEXT_KERNEL / 2,
            groups: dim,
            ..Default::default()
        };
        Ok(Self {
            dwconv: candle_nn::conv1d(dim, dim, CONVNEXT_KERNEL, cfg, vb.pp("dwconv"))?,
            norm: candle_nn::layer_norm(dim, CONVNEXT_NORM_EPS, vb.pp("norm"))?,
            pwconv1: candle_nn::linear(dim, intermediate_dim, vb.pp("pwconv1"))?,
            grn: Grn::new(intermediate_dim, vb.pp("grn"))?,
            pwconv2: candle_nn::linear(intermediate_dim, dim, vb.pp("pwconv2"))?,
        })
    }

    /// `[B, S, dim]` → `[B, S, dim]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self
            .dwconv
            .forward(&x.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?;
        let h = self.norm.forward(&h)?;
        let h = self.pwconv1.forward(&h)?.gelu_erf()?;
        let h = self.grn.forward(&h)?;
        let h = self.pwconv2.forward(&h)?;
        Ok((x + h)?)
    }
}

/// `[cos(p·f_i) | sin(p·f_i)]` for `p in 0..end`, `f_i = θ^(-2i/dim)`.
pub fn precompute_freqs_cis(dim: usize, end: usize, theta: f64, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (1.0 / theta.powf(2.0 * i as f64 / dim as f64)) as f32)
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half), device)?;
    let positions = Tensor::arange(0u32, end as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((end, 1))?;
    let angles = positions.broadcast_mul(&freqs)?;
    Tensor::cat(&[&angles.cos()?, &angles.sin()?], 1).map_err(Into::into)
}

/// Text embedder (`text_embed` tree).
#[derive(Debug, Clone)]
pub struct TextEmbedding {
    text_embed: Embedding,
    freqs_cis: Tensor,
    text_blocks: Vec<ConvNeXtV2Block>,
    max_pos: usize,
}

impl TextEmbedding {
    pub fn new(cfg: &TextEmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let text_blocks = (0..cfg.conv_layers)
            .map(|i| {
                ConvNeXtV2Block::new(
                    cfg.text_dim,
                    cfg.text_dim * cfg.conv_mult,
                    vb.pp(format!("text_blocks.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            text_embed: candle_nn::embedding(
                cfg.text_num_embeds + 1,
                cfg.text_dim,
                vb.pp("text_embed"),
            )?,
            freqs_cis: precompute_freqs_cis(cfg.text_dim, cfg.max_pos, 10_000.0, vb.device())?
                .to_dtype(vb.dtype())?,
            text_blocks,
            max_pos: cfg.max_pos,
        })
    }

    /// - `text`: token ids `[B, S]` (u32)
    /// - `text_segment_ids`: `[B, S]`, 1 on real tokens; positions with 0
    ///   are zeroed after every ConvNeXt block
    ///
    /// Returns `[B, S, text_dim]`.
    pub fn forward(&self, text: &Tensor, text_segment_ids: Option<&Tensor>) -> Result<Tensor> {
        let (_, seq_len) = text.dims2()?;
        let h = self.text_embed.forward(&text.to_dtype(DType::U32)?)?;

        // Positions past the table reuse its last row.
        let positions: Vec<u32> = (0..seq_len)
            .map(|p| p.min(self.max_pos - 1) as u32)
            .collect();
        let positions = Tensor::new(positions.as_slice(), text.device())?;
        let pos = self.freqs_cis.index_select(&positions, 0)?.unsqueeze(0)?;
        let mut h = h.broadcast_add(&pos)?;

        let mask = text_segment_ids
            .map(|segments| -> Result<Tensor> {
                Ok(segments.to_dtype(h.dtype())?.unsqueeze(2)?)
            })
            .transpose()?;
        for block in &self.text_blocks {
            h = block.forward(&h)?;
            if let Some(mask) = &mask {
                h = h.broadcast_mul(mask)?;
            }
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny() -> TextEmbeddingConfig {
        TextEmbeddingConfig {
            text_num_embeds: 12,
            text_dim: 8,
            conv_layers: 2,
            conv_mult: 2,
            max_pos: 16,
        }
    }

    #[test]
    fn freqs_cis_layout() {
        let f: Vec<Vec<f32>> = precompute_freqs_cis(4, 3, 10_000.0, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        // Position 0: cos = 1, sin = 0.
        assert_eq!(f[0], vec![1.0, 1.0, 0.0, 0.0]);
        assert!((f[1][0] - 1f32.cos()).abs() < 1e-6);
        assert!((f[1][2] - 1f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn output_shape_beyond_max_pos() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = TextEmbedding::new(&tiny(), vb).unwrap();
        let ids = Tensor::zeros((2, 20), DType::U32, &device).unwrap();
        assert_eq!(embed.forward(&ids, None).unwrap().dims(), &[2, 20, 8]);
    }

    #[test]
    fn padding_is_zeroed() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = TextEmbedding::new(&tiny(), vb).unwrap();
        let ids = Tensor::new(&[[3u32, 5, 7, 0, 0]], &device).unwrap();
        let segments = ids.ne(0u32).unwrap();
        let out = embed.forward(&ids, Some(&segments)).unwrap();
        let tail: f32 = out
            .narrow(1, 3, 2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn grn_with_zero_params_is_identity() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let grn = Grn::new(4, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 5, 4), &device).unwrap();
        let y = grn.forward(&x).unwrap();
        let diff: f32 = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }
}
