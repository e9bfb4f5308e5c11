//! Configuration for F5-TTS inference.
//!
//! Defaults match the F5-TTS v1 base checkpoint (`dim = 1024`, 22 layers)
//! and the 24 kHz Vocos mel front-end.

use serde::Deserialize;

use crate::attention::{AttentionKernelKind, BlockSizes, DEFAULT_FLASH_MIN_SEQ_LEN};
use crate::{Error, Result};

/// Transformer (DiT) architecture.
#[derive(Debug, Clone, Deserialize)]
pub struct F5Config {
    /// Hidden dimension.
    #[serde(default = "default_dim")]
    pub dim: usize,

    /// Number of DiT blocks.
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Number of attention heads.
    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Dimension per attention head.
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,

    /// Feed-forward expansion ratio.
    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,

    /// Mel channels of the latent and the condition.
    #[serde(default = "default_mel_dim")]
    pub mel_dim: usize,

    /// Whether `to_q`/`to_k`/`to_v` carry a bias.
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,

    /// RoPE theta base frequency.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Epsilon of the AdaLN / final LayerNorms.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,

    /// Attention kernel tag.
    #[serde(default = "default_attention_kernel")]
    pub attention_kernel: AttentionKernelKind,

    /// Shortest sequence the flash kernel runs on.
    #[serde(default = "default_flash_min_seq_len")]
    pub flash_min_seq_len: usize,

    /// Flash tile sizes; `min(512, seq)` when absent.
    #[serde(default)]
    pub flash_block_sizes: Option<BlockSizes>,

    /// Text embedder.
    #[serde(default)]
    pub text: TextEmbeddingConfig,
}

impl Default for F5Config {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            depth: default_depth(),
            heads: default_heads(),
            dim_head: default_dim_head(),
            ff_mult: default_ff_mult(),
            mel_dim: default_mel_dim(),
            qkv_bias: default_qkv_bias(),
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
            attention_kernel: default_attention_kernel(),
            flash_min_seq_len: default_flash_min_seq_len(),
            flash_block_sizes: None,
            text: TextEmbeddingConfig::default(),
        }
    }
}

impl F5Config {
    /// Parse from a JSON string; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    pub fn validate(&self) -> Result<()> {
        nonzero("dim", self.dim)?;
        nonzero("depth", self.depth)?;
        nonzero("heads", self.heads)?;
        nonzero("dim_head", self.dim_head)?;
        nonzero("ff_mult", self.ff_mult)?;
        nonzero("mel_dim", self.mel_dim)?;
        if self.dim != self.inner_dim() {
            return Err(Error::Config(format!(
                "dim {} must equal heads {} x dim_head {}",
                self.dim, self.heads, self.dim_head
            )));
        }
        if self.dim_head % 2 != 0 {
            return Err(Error::Config(format!(
                "dim_head {} must be even for rotary embedding",
                self.dim_head
            )));
        }
        self.text.validate()
    }
}

/// Text embedder (`text_embed` tree).
#[derive(Debug, Clone, Deserialize)]
pub struct TextEmbeddingConfig {
    /// Vocabulary size; the table has one extra row for the filler token 0.
    #[serde(default = "default_text_num_embeds")]
    pub text_num_embeds: usize,

    /// Embedding width.
    #[serde(default = "default_text_dim")]
    pub text_dim: usize,

    /// Number of ConvNeXt-V2 blocks.
    #[serde(default = "default_conv_layers")]
    pub conv_layers: usize,

    /// ConvNeXt-V2 expansion ratio.
    #[serde(default = "default_conv_mult")]
    pub conv_mult: usize,

    /// Length of the precomputed sinusoidal position table.
    #[serde(default = "default_max_pos")]
    pub max_pos: usize,
}

impl Default for TextEmbeddingConfig {
    fn default() -> Self {
        Self {
            text_num_embeds: default_text_num_embeds(),
            text_dim: default_text_dim(),
            conv_layers: default_conv_layers(),
            conv_mult: default_conv_mult(),
            max_pos: default_max_pos(),
        }
    }
}

impl TextEmbeddingConfig {
    pub fn validate(&self) -> Result<()> {
        nonzero("text_num_embeds", self.text_num_embeds)?;
        nonzero("text_dim", self.text_dim)?;
        nonzero("conv_mult", self.conv_mult)?;
        nonzero("max_pos", self.max_pos)?;
        if self.text_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "text_dim {} must be even",
                self.text_dim
            )));
        }
        Ok(())
    }
}

/// Mel front-end.
#[derive(Debug, Clone, Deserialize)]
pub struct MelConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_n_fft")]
    pub win_length: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_mel_dim")]
    pub n_mels: usize,
    #[serde(default)]
    pub f_min: f64,
    /// Upper filterbank edge; Nyquist when absent.
    #[serde(default)]
    pub f_max: Option<f64>,
    /// Magnitudes are clamped to this before the log.
    #[serde(default = "default_log_floor")]
    pub log_floor: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            n_fft: default_n_fft(),
            win_length: default_n_fft(),
            hop_length: default_hop_length(),
            n_mels: default_mel_dim(),
            f_min: 0.0,
            f_max: None,
            log_floor: default_log_floor(),
        }
    }
}

impl MelConfig {
    pub fn f_max(&self) -> f64 {
        self.f_max.unwrap_or(self.sample_rate as f64 / 2.0)
    }

    pub fn validate(&self) -> Result<()> {
        nonzero("sample_rate", self.sample_rate as usize)?;
        nonzero("n_fft", self.n_fft)?;
        nonzero("hop_length", self.hop_length)?;
        nonzero("n_mels", self.n_mels)?;
        if self.win_length == 0 || self.win_length > self.n_fft {
            return Err(Error::Config(format!(
                "win_length {} must be in 1..={}",
                self.win_length, self.n_fft
            )));
        }
        if self.f_min < 0.0 || self.f_min >= self.f_max() {
            return Err(Error::Config(format!(
                "mel band [{}, {}] is empty",
                self.f_min,
                self.f_max()
            )));
        }
        if self.log_floor <= 0.0 {
            return Err(Error::Config("log_floor must be positive".into()));
        }
        Ok(())
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Number of Euler steps.
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,

    /// Classifier-free guidance strength.
    #[serde(default = "default_cfg_strength")]
    pub cfg_strength: f64,

    /// Sway sampling coefficient; negative values concentrate steps near
    /// `t = 0`.
    #[serde(default = "default_sway_sampling_coef")]
    pub sway_sampling_coef: f64,

    /// Speaking-rate multiplier for the duration estimate.
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Padded sequence length in mel frames.
    #[serde(default = "default_max_duration")]
    pub max_duration: usize,

    /// Seed of the initial noise.
    #[serde(default)]
    pub seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: default_num_inference_steps(),
            cfg_strength: default_cfg_strength(),
            sway_sampling_coef: default_sway_sampling_coef(),
            speed: default_speed(),
            max_duration: default_max_duration(),
            seed: 0,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        nonzero("num_inference_steps", self.num_inference_steps)?;
        nonzero("max_duration", self.max_duration)?;
        if self.speed.is_nan() || self.speed <= 0.0 {
            return Err(Error::Config(format!(
                "speed must be positive, got {}",
                self.speed
            )));
        }
        if !self.cfg_strength.is_finite() || !self.sway_sampling_coef.is_finite() {
            return Err(Error::Config(
                "cfg_strength and sway_sampling_coef must be finite".into(),
            ));
        }
        Ok(())
    }
}

fn nonzero(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{name} must be non-zero")));
    }
    Ok(())
}

fn default_dim() -> usize {
    1024
}
fn default_depth() -> usize {
    22
}
fn default_heads() -> usize {
    16
}
fn default_dim_head() -> usize {
    64
}
fn default_ff_mult() -> usize {
    2
}
fn default_mel_dim() -> usize {
    100
}
fn default_qkv_bias() -> bool {
    true
}
fn default_rope_theta() -> f64 {
    10_000.0
}
fn default_norm_eps() -> f64 {
    1e-6
}
fn default_attention_kernel() -> AttentionKernelKind {
    AttentionKernelKind::DotProduct
}
fn default_flash_min_seq_len() -> usize {
    DEFAULT_FLASH_MIN_SEQ_LEN
}
fn default_text_num_embeds() -> usize {
    2545
}
fn default_text_dim() -> usize {
    512
}
fn default_conv_layers() -> usize {
    4
}
fn default_conv_mult() -> usize {
    2
}
fn default_max_pos() -> usize {
    4096
}
fn default_sample_rate() -> u32 {
    24_000
}
fn default_n_fft() -> usize {
    1024
}
fn default_hop_length() -> usize {
    256
}
fn default_log_floor() -> f64 {
    1e-7
}
fn default_num_inference_steps() -> usize {
    32
}
fn default_cfg_strength() -> f64 {
    2.0
}
fn default_sway_sampling_coef() -> f64 {
    -1.0
}
fn default_speed() -> f64 {
    1.0
}
fn default_max_duration() -> usize {
    4096
}
