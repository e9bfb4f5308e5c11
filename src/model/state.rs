//! Loaded parameter trees: transformer plus text embedder.

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use super::text_embedding::TextEmbedding;
use super::transformer::F5Transformer;
use crate::attention::AttentionKernel;
use crate::config::F5Config;
use crate::mesh::Mesh;
use crate::sampler::Denoiser;
use crate::{Error, Result};

/// Build the attention kernel a config asks for on `mesh`.
pub fn attention_kernel(cfg: &F5Config, mesh: &Arc<Mesh>) -> Result<AttentionKernel> {
    let kernel = AttentionKernel::new(cfg.attention_kernel, Some(Arc::clone(mesh)))?;
    Ok(match kernel {
        AttentionKernel::Flash { mesh, .. } => AttentionKernel::Flash {
            mesh,
            min_seq_len: cfg.flash_min_seq_len,
            block_sizes: cfg.flash_block_sizes,
        },
        other => other,
    })
}

/// Model parameters on the mesh's primary device.
///
/// Built once at load time; [`ModelState::replace_weights`] swaps both trees
/// together. Nothing mutates the state during inference.
#[derive(Debug, Clone)]
pub struct ModelState {
    transformer: F5Transformer,
    text_embedding: TextEmbedding,
    config: F5Config,
    dtype: DType,
    mesh: Arc<Mesh>,
}

impl ModelState {
    /// Memory-map safetensors checkpoints.
    ///
    /// `prefix` is the transformer root in the checkpoint (for example
    /// `ema_model.transformer`); the text embedder lives under
    /// `{prefix}.text_embed`.
    pub fn load<P: AsRef<Path>>(
        weights: &[P],
        prefix: &str,
        cfg: &F5Config,
        dtype: DType,
        mesh: Arc<Mesh>,
    ) -> Result<Self> {
        let paths: Vec<&Path> = weights.iter().map(AsRef::as_ref).collect();
        tracing::info!(
            files = paths.len(),
            prefix,
            dtype = ?dtype,
            mesh = %mesh,
            "loading F5 weights"
        );
        // SAFETY: the checkpoint files are not modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&paths, dtype, mesh.primary_device())
                .map_err(|e| Error::WeightLoad(format!("F5 checkpoint: {e}")))?
        };
        let vb = if prefix.is_empty() { vb } else { vb.pp(prefix) };
        Self::from_var_builder(vb, cfg, mesh)
    }

    /// Build from a VarBuilder rooted at the transformer.
    pub fn from_var_builder(vb: VarBuilder, cfg: &F5Config, mesh: Arc<Mesh>) -> Result<Self> {
        let dtype = vb.dtype();
        let (transformer, text_embedding) = Self::build(&vb, cfg, &mesh)?;
        tracing::info!(depth = cfg.depth, dim = cfg.dim, "F5 model ready");
        Ok(Self {
            transformer,
            text_embedding,
            config: cfg.clone(),
            dtype,
            mesh,
        })
    }

    fn build(
        vb: &VarBuilder,
        cfg: &F5Config,
        mesh: &Arc<Mesh>,
    ) -> Result<(F5Transformer, TextEmbedding)> {
        let kernel = attention_kernel(cfg, mesh)?;
        let transformer = F5Transformer::new(cfg, kernel, vb.clone())
            .map_err(|e| Error::WeightLoad(format!("transformer: {e}")))?;
        let text_embedding = TextEmbedding::new(&cfg.text, vb.pp("text_embed"))
            .map_err(|e| Error::WeightLoad(format!("text embedder: {e}")))?;
        Ok((transformer, text_embedding))
    }

    /// Swap in a whole new parameter tree with the same architecture.
    ///
    /// Both trees are built before either is replaced, so a failed load
    /// leaves the current weights untouched.
    pub fn replace_weights(&mut self, vb: VarBuilder) -> Result<()> {
        let (transformer, text_embedding) = Self::build(&vb, &self.config, &self.mesh)?;
        self.transformer = transformer;
        self.text_embedding = text_embedding;
        self.dtype = vb.dtype();
        tracing::info!(dtype = ?self.dtype, "replaced F5 weights");
        Ok(())
    }

    pub fn transformer(&self) -> &F5Transformer {
        &self.transformer
    }

    pub fn text_embedding(&self) -> &TextEmbedding {
        &self.text_embedding
    }

    pub fn config(&self) -> &F5Config {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Text embedding of `[B, S]` ids with `[B, S]` text segment ids.
    pub fn embed_text(&self, text: &Tensor, text_segment_ids: &Tensor) -> Result<Tensor> {
        self.text_embedding.forward(text, Some(text_segment_ids))
    }
}

impl Denoiser for ModelState {
    fn predict(
        &self,
        latents: &Tensor,
        cond: &Tensor,
        text_embed: &Tensor,
        time: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<Tensor> {
        self.transformer
            .forward(latents, cond, text_embed, time, Some(segment_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::AttentionKernelKind;
    use crate::config::TextEmbeddingConfig;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_config() -> F5Config {
        F5Config {
            dim: 32,
            depth: 1,
            heads: 2,
            dim_head: 16,
            mel_dim: 4,
            text: TextEmbeddingConfig {
                text_num_embeds: 8,
                text_dim: 8,
                conv_layers: 1,
                conv_mult: 2,
                max_pos: 32,
            },
            ..F5Config::default()
        }
    }

    #[test]
    fn flash_kernel_takes_config_threshold() {
        let cfg = F5Config {
            attention_kernel: AttentionKernelKind::Flash,
            flash_min_seq_len: 16,
            ..tiny_config()
        };
        let mesh = Arc::new(Mesh::single(Device::Cpu));
        match attention_kernel(&cfg, &mesh).unwrap() {
            AttentionKernel::Flash { min_seq_len, .. } => assert_eq!(min_seq_len, 16),
            other => panic!("unexpected kernel {other:?}"),
        }
    }

    #[test]
    fn replace_weights_swaps_tree() {
        let device = Device::Cpu;
        let mesh = Arc::new(Mesh::single(device.clone()));
        let cfg = tiny_config();
        let mut state =
            ModelState::from_var_builder(VarBuilder::zeros(DType::F32, &device), &cfg, mesh)
                .unwrap();

        let ids = Tensor::new(&[[1u32, 2, 0, 0]], &device).unwrap();
        let segments = ids.ne(0u32).unwrap();
        let before: f32 = state
            .embed_text(&ids, &segments)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        state.replace_weights(vb).unwrap();
        let after: f32 = state
            .embed_text(&ids, &segments)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn missing_checkpoint_is_weight_load_error() {
        let mesh = Arc::new(Mesh::single(Device::Cpu));
        let err = ModelState::load(
            &["/nonexistent/model.safetensors"],
            "ema_model.transformer",
            &tiny_config(),
            DType::F32,
            mesh,
        )
        .unwrap_err();
        assert!(matches!(err, Error::WeightLoad(_)));
    }
}
