//! Output length estimation in mel frames.
//!
//! Durations scale the reference clip's frames-per-byte rate to the text
//! being generated:
//!
//! ```text
//! ref_frames = ref_samples / hop + 1
//! estimate   = ref_frames + ⌊ref_frames / ref_text_bytes × gen_text_bytes / speed⌋
//! duration   = min(max(max(text_tokens, ref_frames) + 1, estimate), max_duration)
//! ```

use crate::{Error, Result};

/// Frame budget the chunker aims for, in seconds of total audio.
pub const TARGET_SECONDS: f64 = 22.0;

/// Mel frames covered by `samples` reference samples.
pub fn ref_frames(samples: usize, hop_length: usize) -> usize {
    samples / hop_length + 1
}

/// Raw duration estimate for one chunk, reference frames included.
pub fn estimate_duration(
    ref_frames: usize,
    ref_text_bytes: usize,
    gen_text_bytes: usize,
    speed: f64,
) -> Result<usize> {
    if ref_text_bytes == 0 {
        return Err(Error::Config("reference text is empty".into()));
    }
    if speed.is_nan() || speed <= 0.0 {
        return Err(Error::Config(format!("speed must be positive, got {speed}")));
    }
    let generated = ref_frames as f64 / ref_text_bytes as f64 * gen_text_bytes as f64 / speed;
    Ok(ref_frames + generated as usize)
}

/// Final duration: long enough for every text token and the reference plus
/// one frame, capped at `max_duration`.
pub fn final_duration(
    estimate: usize,
    text_tokens: usize,
    ref_frames: usize,
    max_duration: usize,
) -> usize {
    (text_tokens.max(ref_frames) + 1)
        .max(estimate)
        .min(max_duration)
}

/// Chunk size in UTF-8 bytes so reference plus generation stays near
/// [`TARGET_SECONDS`]. Never below one.
pub fn max_chars(ref_text_bytes: usize, ref_seconds: f64) -> usize {
    if ref_seconds <= 0.0 {
        return 1;
    }
    let chars = ref_text_bytes as f64 / ref_seconds * (TARGET_SECONDS - ref_seconds);
    if chars.is_finite() && chars >= 1.0 {
        chars as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_from_samples() {
        assert_eq!(ref_frames(0, 256), 1);
        assert_eq!(ref_frames(24_000, 256), 94);
    }

    #[test]
    fn estimate_scales_with_text() {
        // 100 frames for 50 bytes: 2 frames per byte.
        assert_eq!(estimate_duration(100, 50, 25, 1.0).unwrap(), 150);
        assert_eq!(estimate_duration(100, 50, 25, 2.0).unwrap(), 125);
        assert!(estimate_duration(100, 0, 25, 1.0).is_err());
        assert!(estimate_duration(100, 50, 25, 0.0).is_err());
    }

    #[test]
    fn final_duration_bounds() {
        assert_eq!(final_duration(150, 80, 100, 4096), 150);
        // Token count dominates.
        assert_eq!(final_duration(150, 200, 100, 4096), 201);
        assert_eq!(final_duration(5000, 80, 100, 4096), 4096);
    }

    #[test]
    fn max_chars_at_least_one() {
        assert_eq!(max_chars(150, 10.0), 180);
        assert_eq!(max_chars(150, 30.0), 1);
        assert_eq!(max_chars(150, 0.0), 1);
    }
}
