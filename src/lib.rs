//! F5-TTS speech generation in pure Rust.
//!
//! A candle-based implementation of F5-TTS inference: a flow-matching
//! diffusion transformer that clones the voice of a short reference clip.
//! Loads converted safetensors weights and runs on a device mesh.
//!
//! ## Architecture
//!
//! ```text
//! ref text + gen text → chunk → pinyin → token ids ──→ text embedder ──┐
//!                                                                       ├→ conditioning
//! reference WAV → resample → log-mel (padded) ─────────────────────────┘
//!                                    ↓
//!           DiT (22 blocks, guided Euler, sway schedule), mesh-sharded attention
//!                                    ↓
//!                      vocoder (mel → waveform), trim + concat
//! ```
//!
//! ## Modules
//!
//! - [`attention`]: kernel dispatcher (dot product, memory efficient, flash, cuDNN)
//! - [`audio`]: log-mel featurizer, WAV I/O, resampling
//! - [`config`]: model, featurizer and sampling configuration
//! - [`mesh`]: named device grid and batch sharding
//! - [`model`]: transformer blocks, text embedder, weights, vocoder trait
//! - [`text`]: segmentation, romanisation, vocabularies, durations
//! - [`scheduler`]: sway timestep schedule and Euler integrator
//! - [`sampler`]: guided denoising loop
//! - [`pipeline`]: end-to-end inference pipeline

pub mod attention;
pub mod audio;
pub mod config;
pub mod mesh;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod scheduler;
pub mod text;

mod error;

pub use error::{Error, Result};
pub use pipeline::{F5Pipeline, GeneratedAudio};
