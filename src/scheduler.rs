//! Flow-matching timestep schedules.
//!
//! Sampling integrates the flow from noise (`t = 0`) to data (`t = 1`):
//!
//! ```text
//! x_{t'} = x_t + (t' - t) · v(x_t, t)
//! ```
//!
//! Steps follow a sway-sampled grid: a uniform grid of `steps + 1` points
//! bent by
//!
//! ```text
//! t' = t + coef · (cos(π/2 · t) - 1 + t)
//! ```
//!
//! Negative coefficients spend more steps near the noise end.

pub mod euler;

use candle_core::Tensor;

use crate::{Error, Result};

/// Aligned step boundaries: step `i` integrates from `current[i]` to
/// `previous[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestepSchedule {
    current: Vec<f32>,
    previous: Vec<f32>,
}

impl TimestepSchedule {
    /// Sway-sampled schedule of `steps` steps.
    pub fn sway(steps: usize, coef: f64) -> Result<Self> {
        if steps == 0 {
            return Err(Error::Config("num_inference_steps must be > 0".into()));
        }
        let coef = coef as f32;
        let half_pi = std::f32::consts::FRAC_PI_2;
        let grid: Vec<f32> = (0..=steps)
            .map(|i| {
                let t = i as f32 / steps as f32;
                (t + coef * ((half_pi * t).cos() - 1.0 + t)).clamp(0.0, 1.0)
            })
            .collect();

        Ok(Self {
            current: grid[..steps].to_vec(),
            previous: grid[1..].to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn current(&self) -> &[f32] {
        &self.current
    }

    pub fn previous(&self) -> &[f32] {
        &self.previous
    }

    /// `(t_curr, t_prev)` of step `index`.
    pub fn step_bounds(&self, index: usize) -> Result<(f32, f32)> {
        match (self.current.get(index), self.previous.get(index)) {
            (Some(&t), Some(&t_prev)) => Ok((t, t_prev)),
            _ => Err(Error::Config(format!(
                "step {index} is outside a schedule of {} steps",
                self.len()
            ))),
        }
    }
}

/// A fixed-step integrator over a [`TimestepSchedule`].
pub trait Scheduler {
    fn schedule(&self) -> &TimestepSchedule;

    /// Advance `sample` by one step given the predicted flow.
    fn step(&self, model_output: &Tensor, sample: &Tensor, step_index: usize) -> Result<Tensor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_and_previous_are_aligned() {
        let schedule = TimestepSchedule::sway(32, -1.0).unwrap();
        assert_eq!(schedule.len(), 32);
        assert_eq!(schedule.previous().len(), 32);
        for i in 0..31 {
            assert_eq!(schedule.current()[i + 1], schedule.previous()[i]);
        }
    }

    #[test]
    fn sway_is_monotone_in_unit_interval() {
        for coef in [-1.0, -0.5, 0.0, 0.5] {
            let schedule = TimestepSchedule::sway(16, coef).unwrap();
            let all: Vec<f32> = schedule
                .current()
                .iter()
                .chain(schedule.previous().last())
                .copied()
                .collect();
            assert_eq!(all[0], 0.0);
            assert!((all[16] - 1.0).abs() < 1e-6);
            for pair in all.windows(2) {
                assert!(pair[0] <= pair[1], "{coef}: {pair:?}");
            }
        }
    }

    #[test]
    fn zero_coef_is_uniform() {
        let schedule = TimestepSchedule::sway(4, 0.0).unwrap();
        assert_eq!(schedule.current(), &[0.0, 0.25, 0.5, 0.75]);
        assert_eq!(schedule.previous(), &[0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn negative_coef_front_loads() {
        let schedule = TimestepSchedule::sway(8, -1.0).unwrap();
        // First step is shorter than the uniform 1/8.
        assert!(schedule.previous()[0] < 0.125);
    }

    #[test]
    fn zero_steps_rejected() {
        assert!(TimestepSchedule::sway(0, -1.0).is_err());
        assert!(TimestepSchedule::sway(2, 0.0).unwrap().step_bounds(2).is_err());
    }
}
