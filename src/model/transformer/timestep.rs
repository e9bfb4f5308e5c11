//! Sinusoidal timestep embedding for flow-matching conditioning.
//!
//! ```text
//! t [B] → sinusoidal(256, scale 1000) → time_mlp.0 → SiLU → time_mlp.2 → [B, dim]
//! ```

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::Result;

/// Width of the sinusoidal features.
pub const FREQ_EMBED_DIM: usize = 256;

/// Timestep embedding module (`time_embed`).
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
    freq_embed_dim: usize,
    scale: f64,
}

impl TimestepEmbedding {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_1: candle_nn::linear(FREQ_EMBED_DIM, dim, vb.pp("time_mlp.0"))?,
            linear_2: candle_nn::linear(dim, dim, vb.pp("time_mlp.2"))?,
            freq_embed_dim: FREQ_EMBED_DIM,
            scale: 1000.0,
        })
    }

    /// `[sin(scale·t·f_i), cos(scale·t·f_i)]` with
    /// `f_i = exp(-i · ln(10000) / (half − 1))`.
    pub fn sinusoidal(&self, t: &Tensor, device: &Device) -> Result<Tensor> {
        let half = self.freq_embed_dim / 2;
        let step = 10_000f64.ln() / (half as f64 - 1.0);
        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(i as f64) * step).exp() as f32)
            .collect();
        let freqs = Tensor::new(freqs.as_slice(), device)?.unsqueeze(0)?;
        let args = (t.to_dtype(DType::F32)?.unsqueeze(1)? * self.scale)?.broadcast_mul(&freqs)?;
        Tensor::cat(&[&args.sin()?, &args.cos()?], 1).map_err(Into::into)
    }

    /// `t [B]` → `[B, dim]` in the module's weight dtype.
    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let dtype = self.linear_1.weight().dtype();
        let emb = self.sinusoidal(t, t.device())?.to_dtype(dtype)?;
        let emb = self.linear_1.forward(&emb)?.silu()?;
        self.linear_2.forward(&emb).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinusoidal_at_zero() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let emb = TimestepEmbedding::new(32, vb).unwrap();
        let t = Tensor::new(&[0f32], &device).unwrap();
        let s: Vec<Vec<f32>> = emb.sinusoidal(&t, &device).unwrap().to_vec2().unwrap();
        assert_eq!(s[0].len(), FREQ_EMBED_DIM);
        // sin half is 0, cos half is 1.
        assert!(s[0][..128].iter().all(|v| *v == 0.0));
        assert!(s[0][128..].iter().all(|v| *v == 1.0));
    }

    #[test]
    fn forward_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let emb = TimestepEmbedding::new(64, vb).unwrap();
        let t = Tensor::new(&[0.1f32, 0.7], &device).unwrap();
        assert_eq!(emb.forward(&t).unwrap().dims(), &[2, 64]);
    }

    #[test]
    fn first_frequency_is_scale() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let emb = TimestepEmbedding::new(8, vb).unwrap();
        let t = Tensor::new(&[0.001f32], &device).unwrap();
        let s: Vec<Vec<f32>> = emb.sinusoidal(&t, &device).unwrap().to_vec2().unwrap();
        // f_0 = 1, so the first feature is sin(1000 · 0.001) = sin(1).
        assert!((s[0][0] - 1f32.sin()).abs() < 1e-4);
    }
}
