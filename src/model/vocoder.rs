//! Mel spectrogram → waveform interface.
//!
//! The vocoder network itself lives outside this crate; the pipeline only
//! needs something that maps `[B, frames, n_mels]` to `[B, samples]` with
//! `samples = frames × hop_length` at 24 kHz.

use candle_core::Tensor;

use crate::Result;

/// A mel-to-waveform decoder.
pub trait Vocoder {
    /// `[B, frames, n_mels]` → `[B, samples]`
    fn decode(&self, mel: &Tensor) -> Result<Tensor>;
}

impl<V: Vocoder + ?Sized> Vocoder for &V {
    fn decode(&self, mel: &Tensor) -> Result<Tensor> {
        (**self).decode(mel)
    }
}

impl<V: Vocoder + ?Sized> Vocoder for Box<V> {
    fn decode(&self, mel: &Tensor) -> Result<Tensor> {
        (**self).decode(mel)
    }
}
