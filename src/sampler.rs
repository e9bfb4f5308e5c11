//! Guided Euler sampling of mel latents.
//!
//! Each step evaluates the flow twice at the same time:
//!
//! ```text
//! v_c = f(x, cond, text)                     conditional
//! v_u = f(x, 0, null_text)                   unconditional
//! v   = v_c + (v_c - v_u) · cfg_strength     guidance
//! x  ← x + (t_prev - t_curr) · v             Euler
//! ```
//!
//! After the last step the reference region is copied back from the
//! condition so the vocoder sees the real reference mel there.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::InferenceConfig;
use crate::mesh::Mesh;
use crate::scheduler::Scheduler;
use crate::scheduler::euler::EulerScheduler;
use crate::{Error, Result};

/// A flow predictor.
pub trait Denoiser {
    /// - `latents`, `cond`: `[B, S, mel_dim]`
    /// - `text_embed`: `[B, S, text_dim]`
    /// - `time`: `[B]`
    /// - `segment_ids`: `[B, S]`, 1 inside the target duration
    ///
    /// Returns the predicted flow `[B, S, mel_dim]`.
    fn predict(
        &self,
        latents: &Tensor,
        cond: &Tensor,
        text_embed: &Tensor,
        time: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<Tensor>;
}

impl<T: Denoiser + ?Sized> Denoiser for &T {
    fn predict(
        &self,
        latents: &Tensor,
        cond: &Tensor,
        text_embed: &Tensor,
        time: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<Tensor> {
        (**self).predict(latents, cond, text_embed, time, segment_ids)
    }
}

/// `[B, length]` mask, 1 at positions below each length.
pub fn lens_to_mask(lens: &[usize], length: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let values: Vec<u8> = lens
        .iter()
        .flat_map(|&len| (0..length).map(move |pos| u8::from(pos < len)))
        .collect();
    Ok(Tensor::from_vec(values, (lens.len(), length), device)?.to_dtype(dtype)?)
}

/// Classifier-free guidance: `cond + (cond - uncond) · scale`.
pub fn guidance(pred_cond: &Tensor, pred_uncond: &Tensor, scale: f64) -> Result<Tensor> {
    let delta = (pred_cond - pred_uncond)?;
    Ok((pred_cond + (delta * scale)?)?)
}

/// Standard-normal `[batch, frames, channels]` noise from a seeded ChaCha
/// stream, so a seed reproduces the same latents on any device.
pub fn initial_noise(
    shape: (usize, usize, usize),
    seed: u64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let count = shape.0 * shape.1 * shape.2;
    let values: Vec<f32> = (0..count)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
}

/// Everything the denoiser sees besides the latents. Read-only during the
/// loop.
#[derive(Debug, Clone)]
pub struct Conditioning {
    cond: Tensor,
    null_cond: Tensor,
    cond_mask: Tensor,
    text_embed: Tensor,
    null_text_embed: Tensor,
    segment_ids: Tensor,
}

impl Conditioning {
    /// - `cond`: reference mel `[B, S, mel_dim]` (positions outside
    ///   `cond_mask` are zeroed here)
    /// - `cond_mask`: `[B, S]`, nonzero inside the reference
    /// - `text_embed`, `null_text_embed`: `[B, S, text_dim]`
    /// - `segment_ids`: `[B, S]`
    pub fn new(
        cond: &Tensor,
        cond_mask: &Tensor,
        text_embed: Tensor,
        null_text_embed: Tensor,
        segment_ids: Tensor,
    ) -> Result<Self> {
        let (batch, seq_len, _) = cond.dims3()?;
        let check = |name: &str, t: &Tensor, rank: usize| -> Result<()> {
            let dims = t.dims();
            if dims.len() != rank || dims[0] != batch || dims[1] != seq_len {
                return Err(Error::ShapeMismatch(format!(
                    "{name} is {dims:?}, expected rank {rank} with leading [{batch}, {seq_len}]"
                )));
            }
            Ok(())
        };
        check("cond_mask", cond_mask, 2)?;
        check("text_embed", &text_embed, 3)?;
        check("null_text_embed", &null_text_embed, 3)?;
        check("segment_ids", &segment_ids, 2)?;
        if text_embed.dims() != null_text_embed.dims() {
            return Err(Error::ShapeMismatch(format!(
                "text_embed {:?} vs null_text_embed {:?}",
                text_embed.dims(),
                null_text_embed.dims()
            )));
        }

        let cond_mask = cond_mask.ne(0u32)?;
        let mask3 = cond_mask.unsqueeze(2)?.broadcast_as(cond.shape())?;
        let null_cond = cond.zeros_like()?;
        let cond = mask3.where_cond(cond, &null_cond)?;
        Ok(Self {
            cond,
            null_cond,
            cond_mask,
            text_embed,
            null_text_embed,
            segment_ids,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.cond.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.cond.dims()[1]
    }

    pub fn mel_dim(&self) -> usize {
        self.cond.dims()[2]
    }

    /// Masked reference mel.
    pub fn cond(&self) -> &Tensor {
        &self.cond
    }

    /// `[B, S]` u8 reference mask.
    pub fn cond_mask(&self) -> &Tensor {
        &self.cond_mask
    }

    pub fn text_embed(&self) -> &Tensor {
        &self.text_embed
    }

    pub fn null_text_embed(&self) -> &Tensor {
        &self.null_text_embed
    }

    pub fn segment_ids(&self) -> &Tensor {
        &self.segment_ids
    }

    /// Replace the reference region of `latents` with the condition.
    pub fn restore_reference(&self, latents: &Tensor) -> Result<Tensor> {
        let mask3 = self.cond_mask.unsqueeze(2)?.broadcast_as(latents.shape())?;
        let cond = self.cond.to_dtype(latents.dtype())?;
        Ok(mask3.where_cond(&cond, latents)?)
    }
}

/// Latents between steps.
#[derive(Debug, Clone)]
pub struct SamplerState {
    latents: Tensor,
    step: usize,
}

impl SamplerState {
    pub fn new(latents: Tensor) -> Self {
        Self { latents, step: 0 }
    }

    pub fn latents(&self) -> &Tensor {
        &self.latents
    }

    /// Number of steps taken so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn into_latents(self) -> Tensor {
        self.latents
    }
}

/// Fixed-step guided Euler sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    scheduler: EulerScheduler,
    cfg_strength: f64,
    mesh: Arc<Mesh>,
}

impl Sampler {
    pub fn new(config: &InferenceConfig, mesh: Arc<Mesh>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: EulerScheduler::sway(config.num_inference_steps, config.sway_sampling_coef)?,
            cfg_strength: config.cfg_strength,
            mesh,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.scheduler.schedule().len()
    }

    pub fn scheduler(&self) -> &EulerScheduler {
        &self.scheduler
    }

    /// One guided Euler step.
    pub fn step<D: Denoiser + ?Sized>(
        &self,
        state: SamplerState,
        denoiser: &D,
        conditioning: &Conditioning,
    ) -> Result<SamplerState> {
        let SamplerState { latents, step } = state;
        let (t, _) = self.scheduler.schedule().step_bounds(step)?;
        let batch = latents.dim(0)?;
        if batch != conditioning.batch_size() {
            return Err(Error::ShapeMismatch(format!(
                "latent batch {batch} vs conditioning batch {}",
                conditioning.batch_size()
            )));
        }
        let time = Tensor::full(t, batch, latents.device())?.to_dtype(latents.dtype())?;

        let pred = denoiser.predict(
            &latents,
            conditioning.cond(),
            conditioning.text_embed(),
            &time,
            conditioning.segment_ids(),
        )?;
        let null_pred = denoiser.predict(
            &latents,
            &conditioning.null_cond,
            conditioning.null_text_embed(),
            &time,
            conditioning.segment_ids(),
        )?;
        let flow = guidance(&pred, &null_pred, self.cfg_strength)?;
        let latents = self.scheduler.step(&flow, &latents, step)?;
        Ok(SamplerState {
            latents,
            step: step + 1,
        })
    }

    /// Integrate from `noise` through every step, then restore the
    /// reference region.
    pub fn run<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        conditioning: &Conditioning,
        noise: Tensor,
    ) -> Result<Tensor> {
        let span = tracing::info_span!(
            "sample",
            mesh = %self.mesh,
            steps = self.num_steps(),
            batch = conditioning.batch_size(),
            frames = conditioning.seq_len(),
        );
        let _enter = span.enter();

        let start = std::time::Instant::now();
        let mut state = SamplerState::new(noise);
        for _ in 0..self.num_steps() {
            state = self.step(state, denoiser, conditioning)?;
            tracing::trace!(step = state.step(), "sampler step");
        }
        tracing::info!(
            elapsed_s = start.elapsed().as_secs_f64(),
            "denoising finished"
        );
        conditioning.restore_reference(&state.into_latents())
    }
}
