//! Model components for F5-TTS.
//!
//! ## Components
//!
//! - [`transformer`]: the DiT flow predictor with segment-gated rotary attention
//! - [`text_embedding`]: token embedding + ConvNeXt-V2 text encoder
//! - [`state`]: loaded parameter trees and weight swapping
//! - [`vocoder`]: mel → waveform interface

pub mod state;
pub mod text_embedding;
pub mod transformer;
pub mod vocoder;

pub use state::ModelState;
pub use text_embedding::TextEmbedding;
pub use transformer::F5Transformer;
pub use vocoder::Vocoder;
