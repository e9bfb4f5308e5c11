//! Audio utilities.
//!
//! Reference WAV loading (mono, resampled to the model rate), the log-mel
//! featurizer, and WAV output.

pub mod mel;
mod resample;
mod wav;

pub use mel::MelSpectrogram;
pub use resample::resample;
pub use wav::{WavAudio, read_wav, write_wav};

use std::path::Path;

use crate::Result;

/// Load a reference clip as mono samples at `sample_rate`.
pub fn load_reference(path: impl AsRef<Path>, sample_rate: u32) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let audio = read_wav(path)?;
    tracing::info!(
        path = %path.display(),
        sample_rate = audio.sample_rate,
        channels = audio.channels,
        secs = audio.duration_secs(),
        "loaded reference audio"
    );
    resample(&audio.to_mono(), audio.sample_rate, sample_rate)
}
