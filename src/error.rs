//! Error types for f5-tts-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Query/key/value (or conditioning) shapes disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A mesh-dependent attention kernel was requested without a mesh.
    #[error("the {0} attention kernel requires a device mesh, but none was given")]
    MissingMesh(&'static str),

    /// Unrecognised attention kernel tag.
    #[error("unexpected attention kernel {0:?}")]
    UnknownAttentionKernel(String),

    /// Vocabulary file violates the index-0-is-space contract.
    #[error("vocabulary: {0}")]
    InvalidVocabulary(String),

    /// Token sequence does not fit the padded length.
    #[error("sequence of {len} tokens exceeds the maximum of {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// Audio processing error (STFT, resampling, WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for Error {
    fn from(error: rubato::ResamplerConstructionError) -> Self {
        Error::Audio(format!("resampler construction: {error}"))
    }
}

impl From<rubato::ResampleError> for Error {
    fn from(error: rubato::ResampleError) -> Self {
        Error::Audio(format!("resampling: {error}"))
    }
}
