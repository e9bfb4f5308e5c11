//! Rotary position embedding (RoPE), x-transformers layout.
//!
//! Frequencies are interleaved, each one repeated for the two channels of a
//! rotation pair:
//!
//! ```text
//! inv_freq = 1 / theta^(2i / rot_dim)          i in 0..rot_dim/2
//! freqs[p] = [p·f0, p·f0, p·f1, p·f1, ...]
//! rotate_half([x0, x1, x2, x3, ...]) = [-x1, x0, -x3, x2, ...]
//! ```
//!
//! Only the first `rot_dim` channels of each head rotate; the rest pass
//! through. When segment ids are given the frequencies are multiplied by the
//! segment mask, so padded positions get `cos = 1, sin = 0` (no rotation).

use candle_core::{D, DType, Device, Tensor};

use crate::Result;

/// Rotary embedding over the first `rot_dim` channels of each head.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    rot_dim: usize,
    theta: f64,
}

/// `cos`/`sin` tables broadcastable against `[B, H, S, rot_dim]`.
#[derive(Debug, Clone)]
pub struct RopeTables {
    pub cos: Tensor,
    pub sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(rot_dim: usize, theta: f64) -> Self {
        Self { rot_dim, theta }
    }

    pub fn rot_dim(&self) -> usize {
        self.rot_dim
    }

    /// Interleaved frequencies `[seq_len, rot_dim]` in f32.
    pub fn freqs(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let half = self.rot_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .flat_map(|i| {
                let f = 1.0 / self.theta.powf(2.0 * i as f64 / self.rot_dim as f64);
                [f as f32, f as f32]
            })
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, self.rot_dim), device)?;
        let positions = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        positions.broadcast_mul(&inv_freq).map_err(Into::into)
    }

    /// Tables for positions `0..seq_len`.
    ///
    /// Without segment ids the tables are `[1, 1, S, rot_dim]`; with `[B, S]`
    /// segment ids they are `[B, 1, S, rot_dim]` and positions whose id is 0
    /// are left unrotated.
    pub fn tables(
        &self,
        seq_len: usize,
        segment_ids: Option<&Tensor>,
        device: &Device,
    ) -> Result<RopeTables> {
        let freqs = self.freqs(seq_len, device)?.unsqueeze(0)?;
        let freqs = match segment_ids {
            Some(segments) => {
                let gate = segments.to_dtype(DType::F32)?.unsqueeze(2)?;
                freqs.broadcast_mul(&gate)?
            }
            None => freqs,
        };
        // [B|1, S, R] → [B|1, 1, S, R]
        let freqs = freqs.unsqueeze(1)?;
        Ok(RopeTables {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate `x` of shape `[B, H, S, D]`, `D >= rot_dim`.
    pub fn apply(x: &Tensor, tables: &RopeTables) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let head_dim = x.dim(D::Minus1)?;
        let rot_dim = tables.cos.dim(D::Minus1)?;

        let rotated = x.narrow(D::Minus1, 0, rot_dim)?;
        let rotated = (rotated.broadcast_mul(&tables.cos)?
            + rotate_half(&rotated)?.broadcast_mul(&tables.sin)?)?;

        let out = if rot_dim < head_dim {
            let pass = x.narrow(D::Minus1, rot_dim, head_dim - rot_dim)?;
            Tensor::cat(&[&rotated, &pass], D::Minus1)?
        } else {
            rotated
        };
        out.to_dtype(dtype).map_err(Into::into)
    }
}

/// `[x0, x1, x2, x3, ...] → [-x1, x0, -x3, x2, ...]`
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let last = dims[dims.len() - 1];
    let mut paired = dims.clone();
    paired.pop();
    paired.extend([last / 2, 2]);
    let x = x.reshape(paired)?;
    let x1 = x.narrow(D::Minus1, 0, 1)?;
    let x2 = x.narrow(D::Minus1, 1, 1)?;
    let out = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    out.reshape(dims).map_err(Into::into)
}
