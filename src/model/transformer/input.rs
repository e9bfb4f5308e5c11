//! Input embedding of the DiT.
//!
//! ```text
//! cat(x [B,S,mel], cond [B,S,mel], text [B,S,text_dim]) → proj → h
//! h + ConvPositionEmbedding(h)
//! ConvPositionEmbedding: Conv1d(k=31, groups=16) → Mish → Conv1d(k=31, groups=16) → Mish
//! ```

use candle_core::{D, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};

use crate::Result;

const CONV_POS_KERNEL: usize = 31;
const CONV_POS_GROUPS: usize = 16;

/// `x · tanh(softplus(x))`
fn mish(x: &Tensor) -> Result<Tensor> {
    let softplus = (x.exp()? + 1.0)?.log()?;
    Ok((x * softplus.tanh()?)?)
}

/// Two grouped convolutions over the sequence axis.
#[derive(Debug, Clone)]
pub struct ConvPositionEmbedding {
    conv1: Conv1d,
    conv2: Conv1d,
}

impl ConvPositionEmbedding {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: CONV_POS_KERNEL / 2,
            groups: CONV_POS_GROUPS,
            ..Default::default()
        };
        Ok(Self {
            conv1: candle_nn::conv1d(dim, dim, CONV_POS_KERNEL, cfg, vb.pp("conv1d.0"))?,
            conv2: candle_nn::conv1d(dim, dim, CONV_POS_KERNEL, cfg, vb.pp("conv1d.2"))?,
        })
    }

    /// `[B, S, dim]` → `[B, S, dim]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = x.transpose(1, 2)?.contiguous()?;
        let h = mish(&self.conv1.forward(&h)?)?;
        let h = mish(&self.conv2.forward(&h)?)?;
        h.transpose(1, 2).map_err(Into::into)
    }
}

/// Fuses the noisy latent, the audio condition and the text embedding.
#[derive(Debug, Clone)]
pub struct InputEmbedding {
    proj: Linear,
    conv_pos_embed: ConvPositionEmbedding,
}

impl InputEmbedding {
    pub fn new(mel_dim: usize, text_dim: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: candle_nn::linear(mel_dim * 2 + text_dim, dim, vb.pp("proj"))?,
            conv_pos_embed: ConvPositionEmbedding::new(dim, vb.pp("conv_pos_embed"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, cond: &Tensor, text_embed: &Tensor) -> Result<Tensor> {
        let h = Tensor::cat(&[x, cond, text_embed], D::Minus1)?;
        let h = self.proj.forward(&h)?;
        Ok((self.conv_pos_embed.forward(&h)? + h)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn mish_values() {
        let x = Tensor::new(&[0f32, 1.0, -1.0], &Device::Cpu).unwrap();
        let y: Vec<f32> = mish(&x).unwrap().to_vec1().unwrap();
        assert_eq!(y[0], 0.0);
        assert!((y[1] - 0.865_098).abs() < 1e-5);
        assert!((y[2] + 0.303_401).abs() < 1e-5);
    }

    #[test]
    fn input_embedding_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let embed = InputEmbedding::new(4, 6, 32, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 40, 4), &device).unwrap();
        let cond = Tensor::zeros((2, 40, 4), DType::F32, &device).unwrap();
        let text = Tensor::randn(0f32, 1.0, (2, 40, 6), &device).unwrap();
        assert_eq!(embed.forward(&x, &cond, &text).unwrap().dims(), &[2, 40, 32]);
    }
}
