//! Text front end: raw text → padded token ids.
//!
//! ```text
//! gen text → chunk_text → (ref text + chunk) → TextSegmenter → Vocabulary
//!          → [B, max_duration] u32 ids, 0 = filler
//! ```

pub mod chunk;
pub mod duration;
pub mod polyphone;
pub mod segmenter;
pub mod vocab;

pub use chunk::chunk_text;
pub use segmenter::TextSegmenter;
pub use vocab::{TokenizerKind, Vocabulary};

/// Reference transcripts ending in a single-byte char get a trailing space so
/// the generated text does not run into them.
pub fn prepare_ref_text(ref_text: &str) -> String {
    match ref_text.chars().last() {
        Some(c) if c.len_utf8() == 1 => format!("{ref_text} "),
        _ => ref_text.to_string(),
    }
}
