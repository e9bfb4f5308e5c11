//! End-to-end inference pipeline.
//!
//! Orchestrates voice-cloned speech generation:
//! 1. Chunk the text to generate so each chunk fits the reference pacing
//! 2. Prefix every chunk with the reference transcript, romanise, tokenize
//! 3. Estimate per-chunk durations and pad the batch to the mesh
//! 4. Featurize the padded reference clip into the mel condition
//! 5. Embed text (conditional and unconditional)
//! 6. Run the guided Euler sampler from seeded noise
//! 7. Vocode, transfer to host, trim each chunk to its generated span
//! 8. Concatenate chunks (and optionally write a WAV)

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use crate::audio::{self, MelSpectrogram};
use crate::config::{InferenceConfig, MelConfig};
use crate::mesh::Mesh;
use crate::model::{ModelState, Vocoder};
use crate::sampler::{Conditioning, Sampler, initial_noise, lens_to_mask};
use crate::text::{self, TextSegmenter, Vocabulary, chunk_text, duration};
use crate::{Error, Result};

/// Token ids and frame budgets for one batch, before any tensor exists.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    /// Generated-text chunks in output order.
    pub chunks: Vec<String>,
    /// `[batch, max_duration]` ids; rows past `chunks.len()` are padding.
    pub text_ids: Vec<Vec<u32>>,
    /// Target length per row in frames, reference included.
    pub durations: Vec<usize>,
    /// Frames covered by the reference clip.
    pub ref_frames: usize,
}

impl PreparedBatch {
    /// Rows carrying real chunks.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn batch_size(&self) -> usize {
        self.text_ids.len()
    }
}

/// Output of a generation call.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Mono samples, chunks concatenated in order.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub chunks: Vec<String>,
}

impl GeneratedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Text + reference clip → speech.
pub struct F5Pipeline<V> {
    model: ModelState,
    vocoder: V,
    segmenter: TextSegmenter,
    vocab: Vocabulary,
    mel: MelSpectrogram,
    sampler: Sampler,
    inference: InferenceConfig,
}

impl<V: Vocoder> F5Pipeline<V> {
    pub fn new(
        model: ModelState,
        vocoder: V,
        segmenter: TextSegmenter,
        vocab: Vocabulary,
        mel_config: MelConfig,
        inference: InferenceConfig,
    ) -> Result<Self> {
        inference.validate()?;
        let mel = MelSpectrogram::new(mel_config)?;
        let mel_dim = model.config().mel_dim;
        if mel.config().n_mels != mel_dim {
            return Err(Error::Config(format!(
                "featurizer produces {} mel bins but the model expects {mel_dim}",
                mel.config().n_mels
            )));
        }
        if vocab.len() > model.config().text.text_num_embeds {
            return Err(Error::Config(format!(
                "vocabulary of {} tokens exceeds the {} text embeddings",
                vocab.len(),
                model.config().text.text_num_embeds
            )));
        }
        let sampler = Sampler::new(&inference, Arc::clone(model.mesh()))?;
        tracing::info!(
            mesh = %model.mesh(),
            steps = inference.num_inference_steps,
            max_duration = inference.max_duration,
            vocab = vocab.len(),
            "pipeline ready"
        );
        Ok(Self {
            model,
            vocoder,
            segmenter,
            vocab,
            mel,
            sampler,
            inference,
        })
    }

    pub fn model(&self) -> &ModelState {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ModelState {
        &mut self.model
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        self.model.mesh()
    }

    pub fn sample_rate(&self) -> u32 {
        self.mel.config().sample_rate
    }

    /// Chunk, tokenize and budget a request without touching the model.
    pub fn prepare(&self, ref_samples: usize, ref_text: &str, gen_text: &str) -> Result<PreparedBatch> {
        let max_duration = self.inference.max_duration;
        let hop = self.mel.config().hop_length;
        let ref_text = text::prepare_ref_text(ref_text);

        let ref_seconds = ref_samples as f64 / self.sample_rate() as f64;
        let max_chars = duration::max_chars(ref_text.len(), ref_seconds);
        let chunks = chunk_text(gen_text, max_chars);
        if chunks.is_empty() {
            return Err(Error::Config("no text to generate".into()));
        }

        let ref_frames = duration::ref_frames(ref_samples, hop);
        if ref_frames >= max_duration {
            return Err(Error::SequenceTooLong {
                len: ref_frames,
                max: max_duration - 1,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| format!("{ref_text}{c}")).collect();
        let tokens = self.segmenter.convert_char_to_pinyin(&texts);
        let mut text_ids = self.vocab.list_str_to_idx(&tokens, max_duration)?;

        let batch = self.mesh().padded_batch_size(chunks.len());
        text_ids.resize(batch, vec![0; max_duration]);

        let mut durations = Vec::with_capacity(batch);
        for (row, ids) in text_ids.iter().enumerate() {
            let estimate = match chunks.get(row) {
                Some(chunk) => duration::estimate_duration(
                    ref_frames,
                    ref_text.len(),
                    chunk.len(),
                    self.inference.speed,
                )?,
                None => 0,
            };
            let tokens = ids.iter().filter(|&&id| id != 0).count();
            durations.push(duration::final_duration(
                estimate,
                tokens,
                ref_frames,
                max_duration,
            ));
        }

        tracing::debug!(
            chunks = chunks.len(),
            batch,
            max_chars,
            ref_frames,
            ?durations,
            "prepared batch"
        );
        Ok(PreparedBatch {
            chunks,
            text_ids,
            durations,
            ref_frames,
        })
    }

    /// Generate speech for `gen_text` in the voice of the reference clip
    /// (mono, at the featurizer sample rate).
    pub fn generate(&self, ref_audio: &[f32], ref_text: &str, gen_text: &str) -> Result<GeneratedAudio> {
        let prepared = self.prepare(ref_audio.len(), ref_text, gen_text)?;
        let device = self.mesh().primary_device().clone();
        let dtype = self.model.dtype();
        let max_duration = self.inference.max_duration;
        let hop = self.mel.config().hop_length;
        let batch = prepared.batch_size();

        // Pad so the condition has exactly `max_duration` frames.
        let mut padded = ref_audio.to_vec();
        padded.resize((max_duration - 1) * hop, 0.0);
        let cond = self
            .mel
            .to_tensor(&padded, &device)?
            .to_dtype(dtype)?
            .broadcast_as((batch, max_duration, self.mel.config().n_mels))?
            .contiguous()?;
        let cond_mask = lens_to_mask(
            &vec![prepared.ref_frames; batch],
            max_duration,
            DType::U8,
            &device,
        )?;
        let segment_ids = lens_to_mask(&prepared.durations, max_duration, DType::U32, &device)?;

        let flat: Vec<u32> = prepared.text_ids.iter().flatten().copied().collect();
        let text_ids = Tensor::from_vec(flat, (batch, max_duration), &device)?;
        let text_segment_ids = text_ids.ne(0u32)?;
        let text_embed = self.model.embed_text(&text_ids, &text_segment_ids)?;
        let null_text_embed = self
            .model
            .embed_text(&text_ids.zeros_like()?, &text_segment_ids)?;

        let conditioning = Conditioning::new(
            &cond,
            &cond_mask,
            text_embed,
            null_text_embed,
            segment_ids,
        )?;
        let noise = initial_noise(
            (batch, max_duration, self.mel.config().n_mels),
            self.inference.seed,
            dtype,
            &device,
        )?;

        let mel_out = self.sampler.run(&self.model, &conditioning, noise)?;

        let start = Instant::now();
        let waveform = self.vocoder.decode(&mel_out)?;
        tracing::info!(elapsed_s = start.elapsed().as_secs_f64(), "vocoder decode");

        let start = Instant::now();
        let rows: Vec<Vec<f32>> = waveform
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .to_vec2()?;
        let mut samples = Vec::new();
        for (row, &duration) in rows.iter().zip(&prepared.durations).take(prepared.num_chunks()) {
            let begin = (prepared.ref_frames * hop).min(row.len());
            let end = (duration * hop).clamp(begin, row.len());
            samples.extend_from_slice(&row[begin..end]);
        }
        tracing::info!(
            elapsed_s = start.elapsed().as_secs_f64(),
            samples = samples.len(),
            "host transfer and trim"
        );

        Ok(GeneratedAudio {
            samples,
            sample_rate: self.sample_rate(),
            chunks: prepared.chunks,
        })
    }

    /// Load a reference WAV, generate, and write the result as a WAV.
    pub fn generate_to_file(
        &self,
        ref_audio: impl AsRef<Path>,
        ref_text: &str,
        gen_text: &str,
        output: impl AsRef<Path>,
    ) -> Result<GeneratedAudio> {
        let reference = audio::load_reference(ref_audio, self.sample_rate())?;
        let generated = self.generate(&reference, ref_text, gen_text)?;
        audio::write_wav(output, &generated.samples, generated.sample_rate)?;
        Ok(generated)
    }
}
