//! Attention kernels and the dispatcher that selects between them.
//!
//! All kernels share one contract: query/key/value arrive as
//! `[batch, seq, heads * head_dim]` and the result comes back in the same
//! layout.
//!
//! - [`dot_product`]: explicit `softmax(QKᵗ)·V` with optional segment mask
//! - [`memory_efficient`]: chunked online-softmax, never materialises the
//!   full score matrix
//! - [`flash`]: block-tiled kernel sharded over the mesh batch axis
//! - [`cudnn`]: fused kernel in `[batch, seq, heads, head_dim]` layout, no
//!   masking
//!
//! ## Selection
//!
//! The requested kernel is honoured, except that `Flash` falls back to
//! `DotProduct` when any of the q/k/v sequences is shorter than its
//! `min_seq_len`.

pub mod cudnn;
pub mod dot_product;
pub mod flash;
pub mod memory_efficient;

use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Tensor};
use serde::Deserialize;

use crate::mesh::Mesh;
use crate::{Error, Result};

/// Score assigned to cross-segment pairs by the dot-product kernels.
pub const DOT_MASK_VALUE: f64 = -1e9;

/// Score assigned to masked pairs by the flash kernel.
pub const FLASH_MASK_VALUE: f64 = -0.7 * f32::MAX as f64;

/// Default minimum sequence length for the flash kernel.
pub const DEFAULT_FLASH_MIN_SEQ_LEN: usize = 4096;

/// String tag of an attention kernel, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AttentionKernelKind {
    DotProduct,
    MemoryEfficient,
    Flash,
    CudnnFlash,
}

impl AttentionKernelKind {
    pub fn name(self) -> &'static str {
        match self {
            AttentionKernelKind::DotProduct => "dot_product",
            AttentionKernelKind::MemoryEfficient => "memory_efficient",
            AttentionKernelKind::Flash => "flash",
            AttentionKernelKind::CudnnFlash => "cudnn_flash_te",
        }
    }

    /// Whether this kernel needs a device mesh.
    pub fn requires_mesh(self) -> bool {
        matches!(
            self,
            AttentionKernelKind::Flash | AttentionKernelKind::CudnnFlash
        )
    }
}

impl FromStr for AttentionKernelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dot_product" => Ok(Self::DotProduct),
            "memory_efficient" => Ok(Self::MemoryEfficient),
            "flash" => Ok(Self::Flash),
            "cudnn_flash_te" | "cudnn_flash" => Ok(Self::CudnnFlash),
            other => Err(Error::UnknownAttentionKernel(other.to_string())),
        }
    }
}

impl TryFrom<String> for AttentionKernelKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Tile sizes for the flash kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BlockSizes {
    pub block_q: usize,
    pub block_kv: usize,
}

/// A selected attention kernel together with what it needs to run.
#[derive(Debug, Clone)]
pub enum AttentionKernel {
    DotProduct,
    MemoryEfficient {
        query_chunk_size: usize,
        key_chunk_size: usize,
    },
    Flash {
        mesh: Arc<Mesh>,
        min_seq_len: usize,
        block_sizes: Option<BlockSizes>,
    },
    CudnnFlash {
        mesh: Arc<Mesh>,
    },
}

impl AttentionKernel {
    /// Build a kernel from its tag with default parameters.
    ///
    /// Fails with [`Error::MissingMesh`] for `flash` and `cudnn_flash_te`
    /// when `mesh` is `None`.
    pub fn new(kind: AttentionKernelKind, mesh: Option<Arc<Mesh>>) -> Result<Self> {
        let require = |mesh: Option<Arc<Mesh>>| mesh.ok_or(Error::MissingMesh(kind.name()));
        Ok(match kind {
            AttentionKernelKind::DotProduct => AttentionKernel::DotProduct,
            AttentionKernelKind::MemoryEfficient => AttentionKernel::MemoryEfficient {
                query_chunk_size: memory_efficient::DEFAULT_QUERY_CHUNK_SIZE,
                key_chunk_size: memory_efficient::DEFAULT_KEY_CHUNK_SIZE,
            },
            AttentionKernelKind::Flash => AttentionKernel::Flash {
                mesh: require(mesh)?,
                min_seq_len: DEFAULT_FLASH_MIN_SEQ_LEN,
                block_sizes: None,
            },
            AttentionKernelKind::CudnnFlash => AttentionKernel::CudnnFlash {
                mesh: require(mesh)?,
            },
        })
    }

    pub fn kind(&self) -> AttentionKernelKind {
        match self {
            AttentionKernel::DotProduct => AttentionKernelKind::DotProduct,
            AttentionKernel::MemoryEfficient { .. } => AttentionKernelKind::MemoryEfficient,
            AttentionKernel::Flash { .. } => AttentionKernelKind::Flash,
            AttentionKernel::CudnnFlash { .. } => AttentionKernelKind::CudnnFlash,
        }
    }

    /// The kernel that actually runs for the given sequence lengths.
    pub fn effective_kind(&self, q_len: usize, kv_len: usize) -> AttentionKernelKind {
        match self {
            AttentionKernel::Flash { min_seq_len, .. }
                if q_len < *min_seq_len || kv_len < *min_seq_len =>
            {
                AttentionKernelKind::DotProduct
            }
            other => other.kind(),
        }
    }
}

/// Validate q/k/v before dispatch.
///
/// All three must be rank 3 with the same batch, key and value must share a
/// length, and every depth must equal `heads × head_dim` for the same
/// `heads`.
pub fn check_inputs(query: &Tensor, key: &Tensor, value: &Tensor, heads: usize) -> Result<()> {
    let rank = |t: &Tensor| t.rank();
    if rank(query) != 3 || rank(key) != 3 || rank(value) != 3 {
        return Err(Error::ShapeMismatch(format!(
            "q, k, v must have rank 3, got {:?}, {:?}, {:?}",
            query.dims(),
            key.dims(),
            value.dims()
        )));
    }
    let (qb, _, qd) = query.dims3()?;
    let (kb, kl, kd) = key.dims3()?;
    let (vb, vl, vd) = value.dims3()?;
    if qb != kb || kb != vb {
        return Err(Error::ShapeMismatch(format!(
            "q, k, v batch dims must match: {qb}, {kb}, {vb}"
        )));
    }
    if kl != vl {
        return Err(Error::ShapeMismatch(format!(
            "k, v lengths must match: {kl} vs {vl}"
        )));
    }
    if qd != kd || kd != vd {
        return Err(Error::ShapeMismatch(format!(
            "q, k, v depths must match: {qd}, {kd}, {vd}"
        )));
    }
    if heads == 0 || qd % heads != 0 {
        return Err(Error::ShapeMismatch(format!(
            "depth {qd} is not divisible into {heads} heads"
        )));
    }
    Ok(())
}

/// Run attention with the selected kernel.
///
/// - `query`: `[B, Sq, H*D]`
/// - `key`, `value`: `[B, Sk, H*D]`
/// - `segment_ids`: optional `[B, S]`; positions only attend to positions
///   with an equal id (requires `Sq == Sk`). Ignored by the cudnn kernel.
/// - `scale`: score multiplier, usually `D^-0.5`
pub fn apply_attention(
    kernel: &AttentionKernel,
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    segment_ids: Option<&Tensor>,
    heads: usize,
    scale: f64,
) -> Result<Tensor> {
    check_inputs(query, key, value, heads)?;
    let q_len = query.dim(1)?;
    let kv_len = key.dim(1)?;
    if let Some(segments) = segment_ids {
        check_segments(segments, query.dim(0)?, q_len, kv_len)?;
    }

    match (kernel.effective_kind(q_len, kv_len), kernel) {
        (AttentionKernelKind::DotProduct, _) => {
            dot_product::attention(query, key, value, segment_ids, heads, scale)
        }
        (
            AttentionKernelKind::MemoryEfficient,
            AttentionKernel::MemoryEfficient {
                query_chunk_size,
                key_chunk_size,
            },
        ) => memory_efficient::attention(
            query,
            key,
            value,
            segment_ids,
            heads,
            scale,
            *query_chunk_size,
            *key_chunk_size,
        ),
        (
            AttentionKernelKind::Flash,
            AttentionKernel::Flash {
                mesh, block_sizes, ..
            },
        ) => flash::attention(
            mesh,
            query,
            key,
            value,
            segment_ids,
            heads,
            scale,
            *block_sizes,
        ),
        (AttentionKernelKind::CudnnFlash, AttentionKernel::CudnnFlash { mesh }) => {
            cudnn::attention(mesh, query, key, value, heads, scale)
        }
        (kind, _) => Err(Error::UnknownAttentionKernel(kind.name().to_string())),
    }
}

fn check_segments(segments: &Tensor, batch: usize, q_len: usize, kv_len: usize) -> Result<()> {
    let dims = segments.dims();
    if q_len != kv_len || dims != [batch, q_len] {
        return Err(Error::ShapeMismatch(format!(
            "segment ids {dims:?} do not match batch {batch} with q/kv lengths {q_len}/{kv_len}"
        )));
    }
    Ok(())
}

/// Heads, head size and score scale for one attention layer.
#[derive(Debug, Clone)]
pub struct AttentionOp {
    kernel: AttentionKernel,
    heads: usize,
    dim_head: usize,
    scale: f64,
}

impl AttentionOp {
    pub fn new(kernel: AttentionKernel, heads: usize, dim_head: usize) -> Self {
        Self {
            kernel,
            heads,
            dim_head,
            scale: (dim_head as f64).powf(-0.5),
        }
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn dim_head(&self) -> usize {
        self.dim_head
    }

    pub fn kernel(&self) -> &AttentionKernel {
        &self.kernel
    }

    pub fn apply(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        segment_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        apply_attention(
            &self.kernel,
            query,
            key,
            value,
            segment_ids,
            self.heads,
            self.scale,
        )
    }
}

/// `[B, S, H*D]` → `[B, H, S, D]`
pub(crate) fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (b, s, hd) = x.dims3()?;
    Ok(x.reshape((b, s, heads, hd / heads))?.transpose(1, 2)?)
}

/// `[B, H, S, D]` → `[B, S, H*D]`
pub(crate) fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, h, s, d) = x.dims4()?;
    Ok(x.transpose(1, 2)?.reshape((b, s, h * d))?)
}

/// Same-segment mask `[B, 1, Sq, Sk]` (1 where ids match) from `[B, Sq]`
/// query ids and `[B, Sk]` key ids.
pub(crate) fn segment_mask(q_segments: &Tensor, k_segments: &Tensor) -> Result<Tensor> {
    let q = q_segments.to_dtype(DType::F32)?.unsqueeze(2)?;
    let k = k_segments.to_dtype(DType::F32)?.unsqueeze(1)?;
    Ok(q.broadcast_eq(&k)?.unsqueeze(1)?)
}

/// Replace scores where `mask == 0` by `fill`.
pub(crate) fn mask_scores(scores: &Tensor, mask: &Tensor, fill: f64) -> Result<Tensor> {
    let mask = mask.broadcast_as(scores.shape())?;
    let fill = Tensor::full(fill as f32, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
    Ok(mask.where_cond(scores, &fill)?)
}
