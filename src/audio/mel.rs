//! Log-mel spectrogram via STFT + mel filterbank.
//!
//! Defaults (see [`MelConfig`]):
//! - Sample rate: 24000 Hz
//! - FFT size: 1024 (giving 513 frequency bins)
//! - Window: symmetric Hann, length 1024
//! - Hop length: 256
//! - Mel bins: 100, range 0 Hz to Nyquist
//! - Mel scale: HTK, no filter normalisation
//! - Padding: centered, reflect, `n_fft / 2` each side
//! - Magnitude (power 1), log compression `ln(max(mel, 1e-7))`

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use crate::Result;
use crate::config::MelConfig;

/// Mel spectrogram processor.
///
/// Pre-computes the window, FFT plan and filterbank on construction. Call
/// [`MelSpectrogram::process`] for a `[frames, n_mels]` log-mel matrix.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: Arc<dyn rustfft::Fft<f64>>,
}

impl std::fmt::Debug for MelSpectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelSpectrogram")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        config.validate()?;
        let window = centered_window(config.win_length, config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max(),
        );
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);
        Ok(Self {
            config,
            window,
            filterbank,
            fft,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of frames produced for `num_samples` input samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let padded = num_samples + 2 * (self.config.n_fft / 2);
        frames_in(padded, self.config.n_fft, self.config.hop_length)
    }

    /// Mono samples at the configured rate → `[frames, n_mels]` log-mel.
    pub fn process(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let samples: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&samples, pad);
        let floor = self.config.log_floor;

        self.stft(&padded)
            .iter()
            .map(|magnitudes| {
                self.filterbank
                    .iter()
                    .map(|filter| {
                        let energy: f64 = filter
                            .iter()
                            .zip(magnitudes)
                            .filter(|(w, _)| **w > 0.0)
                            .map(|(w, m)| w * m)
                            .sum();
                        energy.max(floor).ln() as f32
                    })
                    .collect()
            })
            .collect()
    }

    /// `[1, frames, n_mels]` f32 tensor on `device`.
    pub fn to_tensor(&self, samples: &[f32], device: &Device) -> Result<Tensor> {
        let mel = self.process(samples);
        let frames = mel.len();
        let flat: Vec<f32> = mel.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (1, frames, self.config.n_mels), device)?)
    }

    /// One-sided magnitude spectra, one per hop.
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;
        let num_frames = frames_in(padded.len(), n_fft, hop);

        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        (0..num_frames)
            .map(|frame| {
                let start = frame * hop;
                for (i, slot) in buffer.iter_mut().enumerate() {
                    *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
                }
                self.fft.process(&mut buffer);
                buffer[..num_bins].iter().map(|c| c.norm()).collect()
            })
            .collect()
    }
}

/// Whole windows of `n_fft` that fit in `len` samples at stride `hop`.
fn frames_in(len: usize, n_fft: usize, hop: usize) -> usize {
    len.checked_sub(n_fft).map_or(0, |rest| rest / hop + 1)
}

/// Symmetric Hann window: `0.5 - 0.5·cos(2πn / (N - 1))`.
fn hann_window(length: usize) -> Vec<f64> {
    if length == 1 {
        return vec![1.0];
    }
    let denom = (length - 1) as f64;
    (0..length)
        .map(|n| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / denom).cos())
        .collect()
}

/// Hann window of `win_length` zero-padded to `n_fft`, centered.
fn centered_window(win_length: usize, n_fft: usize) -> Vec<f64> {
    let left = (n_fft - win_length) / 2;
    let mut window = vec![0.0; n_fft];
    window[left..left + win_length].copy_from_slice(&hann_window(win_length));
    window
}

/// Mirror index into `0..len` without repeating the edge sample.
fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let i = i.rem_euclid(period);
    if i < len as isize {
        i as usize
    } else {
        (period - i) as usize
    }
}

/// Reflect-pad `pad` samples on both sides.
fn reflect_pad(signal: &[f64], pad: usize) -> Vec<f64> {
    if signal.is_empty() {
        return vec![0.0; 2 * pad];
    }
    let len = signal.len();
    (-(pad as isize)..(len + pad) as isize)
        .map(|i| signal[reflect_index(i, len)])
        .collect()
}

/// HTK mel scale.
fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular HTK filterbank without area normalisation.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| nyquist * i as f64 / (num_bins - 1).max(1) as f64)
        .collect();

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);
    let hz_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
            bin_freqs
                .iter()
                .map(|&f| {
                    let rising = (f - left) / (center - left);
                    let falling = (right - f) / (right - center);
                    rising.min(falling).max(0.0)
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn htk_mel_roundtrip() {
        for freq in [0.0, 100.0, 440.0, 1000.0, 12000.0] {
            let back = mel_to_hz(hz_to_mel(freq));
            assert!((freq - back).abs() < 1e-6, "{freq} Hz came back as {back}");
        }
        assert!((hz_to_mel(700.0) - 2595.0 * 2f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn hann_window_is_symmetric() {
        let w = hann_window(1024);
        assert!(w[0].abs() < 1e-12);
        assert!(w[1023].abs() < 1e-12);
        for i in 0..512 {
            assert!((w[i] - w[1023 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn short_window_centered() {
        let w = centered_window(4, 8);
        assert_eq!(&w[..2], &[0.0, 0.0]);
        assert_eq!(&w[6..], &[0.0, 0.0]);
        assert!(w[3] > 0.0);
    }

    #[test]
    fn reflect_pad_excludes_edge() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn reflect_pad_longer_than_signal() {
        let padded = reflect_pad(&[1.0, 2.0], 3);
        assert_eq!(padded, vec![2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn filterbank_shape_and_peaks() {
        let fb = mel_filterbank(1024, 100, 24000, 0.0, 12000.0);
        assert_eq!(fb.len(), 100);
        assert_eq!(fb[0].len(), 513);
        for filter in &fb {
            assert!(filter.iter().all(|&w| (0.0..=1.0).contains(&w)));
        }
        assert!(fb.iter().skip(1).all(|f| f.iter().any(|&w| w > 0.0)));
    }

    #[test]
    fn frame_count_and_floor() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let out = mel.process(&vec![0.0f32; 24_000]);
        assert_eq!(out.len(), 24_000 / 256 + 1);
        assert_eq!(out.len(), mel.num_frames(24_000));
        assert_eq!(out[0].len(), 100);
        let floor = (1e-7f64).ln() as f32;
        assert!(out.iter().flatten().all(|&v| v == floor));
    }

    #[test]
    fn sine_energy_lands_in_low_bands() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let samples: Vec<f32> = (0..4800)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 24_000.0).sin() as f32)
            .collect();
        let out = mel.process(&samples);
        let frame = &out[out.len() / 2];
        let (peak, _) = frame
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        assert!(peak < 30, "440 Hz peaked in mel band {peak}");
    }

    #[test]
    fn odd_fft_on_empty_input_has_no_frames() {
        let mel = MelSpectrogram::new(MelConfig {
            n_fft: 5,
            win_length: 5,
            hop_length: 2,
            n_mels: 2,
            ..MelConfig::default()
        })
        .unwrap();
        assert!(mel.process(&[]).is_empty());
        assert_eq!(mel.num_frames(0), 0);
        assert_eq!(mel.process(&[0.5; 7]).len(), mel.num_frames(7));
        let t = mel.to_tensor(&[], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 0, 2]);
    }

    #[test]
    fn tensor_layout() {
        let mel = MelSpectrogram::new(MelConfig::default()).unwrap();
        let t = mel.to_tensor(&vec![0.1f32; 1000], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 1000 / 256 + 1, 100]);
    }
}
