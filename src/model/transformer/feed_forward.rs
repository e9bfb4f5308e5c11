//! Feed-forward layers.
//!
//! ```text
//! GegluFeedForward:  x → net.0.proj (dim → 2·inner) → a · gelu(g) → net.2 (inner → dim)
//! GeluFeedForward:   x → ff.0.0 (dim → inner) → gelu_tanh → ff.2 (inner → dim)
//! ```

use candle_core::{D, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::Result;

/// Gated-GELU feed-forward of the cross-attention block.
#[derive(Debug, Clone)]
pub struct GegluFeedForward {
    proj: Linear,
    out: Linear,
}

impl GegluFeedForward {
    /// Inner width is `4 · dim`.
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let inner = dim * 4;
        Ok(Self {
            proj: candle_nn::linear(dim, inner * 2, vb.pp("net.0.proj"))?,
            out: candle_nn::linear(inner, dim, vb.pp("net.2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.proj.forward(x)?;
        let chunks = h.chunk(2, D::Minus1)?;
        let h = (&chunks[0] * chunks[1].gelu()?)?;
        self.out.forward(&h).map_err(Into::into)
    }
}

/// Linear → GELU (tanh approximation) → Linear, used by the DiT blocks.
#[derive(Debug, Clone)]
pub struct GeluFeedForward {
    project_in: Linear,
    project_out: Linear,
}

impl GeluFeedForward {
    pub fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let inner = dim * mult;
        Ok(Self {
            project_in: candle_nn::linear(dim, inner, vb.pp("ff.0.0"))?,
            project_out: candle_nn::linear(inner, dim, vb.pp("ff.2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.project_in.forward(x)?.gelu()?;
        self.project_out.forward(&h).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn geglu_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let ff = GegluFeedForward::new(8, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        assert_eq!(ff.forward(&x).unwrap().dims(), &[2, 3, 8]);
    }

    #[test]
    fn gelu_ff_with_zero_weights_is_zero() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let ff = GeluFeedForward::new(8, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device).unwrap();
        let sum: f32 = ff
            .forward(&x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(sum, 0.0);
    }
}
