//! Euler flow-matching scheduler.
//!
//! ```text
//! x_next = x + (t_prev - t_curr) · v
//! ```
//!
//! computed in f32 and cast back to the latent dtype.

use candle_core::{DType, Tensor};

use super::{Scheduler, TimestepSchedule};
use crate::Result;

/// First-order Euler integrator.
#[derive(Debug, Clone)]
pub struct EulerScheduler {
    schedule: TimestepSchedule,
}

impl EulerScheduler {
    pub fn new(schedule: TimestepSchedule) -> Self {
        Self { schedule }
    }

    /// Euler scheduler over a sway-sampled schedule.
    pub fn sway(steps: usize, coef: f64) -> Result<Self> {
        Ok(Self::new(TimestepSchedule::sway(steps, coef)?))
    }
}

impl Scheduler for EulerScheduler {
    fn schedule(&self) -> &TimestepSchedule {
        &self.schedule
    }

    fn step(&self, model_output: &Tensor, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let (t, t_prev) = self.schedule.step_bounds(step_index)?;
        let dt = (t_prev - t) as f64;
        let next = (sample.to_dtype(DType::F32)? + (model_output.to_dtype(DType::F32)? * dt)?)?;
        Ok(next.to_dtype(sample.dtype())?)
    }
}
