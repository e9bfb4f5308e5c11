//! Sample-rate conversion with rubato.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::Result;

/// Resample mono audio from `from_sr` to `to_sr`. Equal rates copy.
pub fn resample(samples: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
    if from_sr == to_sr || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_sr as f64 / from_sr as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)?;

    // Flush the filter delay with a zero-filled partial chunk, then drop it.
    let delay = resampler.output_delay();
    let mut output = resampler.process(&[samples], None)?.remove(0);
    output.extend(
        resampler
            .process_partial(None::<&[Vec<f32>]>, None)?
            .remove(0),
    );

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let end = (delay + expected).min(output.len());
    tracing::debug!(from_sr, to_sr, input = samples.len(), output = expected, "resampled");
    Ok(output[delay.min(end)..end].to_vec())
}
