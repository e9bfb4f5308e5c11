//! Block-tiled attention sharded over the mesh batch axis.
//!
//! ```text
//! [B, S, H·D] ─split heads─▶ [B, H, S, D] ─pad D to 128─▶ [B, H, S, 128]
//!      │ keys pre-scaled
//!      ▼
//! split B over data × fsdp ─▶ per-shard tiled online softmax ─▶ gather
//!      │
//!      ▼
//! slice D back ─merge heads─▶ [B, S, H·D]
//! ```
//!
//! Every head uses a full mask, gated by segment ids when present; masked
//! scores take [`FLASH_MASK_VALUE`].

use candle_core::{DType, Tensor};

use super::memory_efficient::online_softmax;
use super::{BlockSizes, FLASH_MASK_VALUE, merge_heads, split_heads};
use crate::Result;
use crate::mesh::{LogicalAxis, Mesh};

/// Head dim the kernel operates on; smaller heads are zero-padded.
pub const FLASH_HEAD_DIM: usize = 128;

/// Upper bound on the default tile size.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default tiles: `min(512, seq)` on both sides.
pub fn default_block_sizes(q_len: usize, kv_len: usize) -> BlockSizes {
    BlockSizes {
        block_q: DEFAULT_BLOCK_SIZE.min(q_len).max(1),
        block_kv: DEFAULT_BLOCK_SIZE.min(kv_len).max(1),
    }
}

/// Zero-pad the last dim of `[B, H, S, D]` up to [`FLASH_HEAD_DIM`].
fn pad_head_dim(x: &Tensor) -> Result<Tensor> {
    let head_dim = x.dim(3)?;
    if head_dim >= FLASH_HEAD_DIM {
        return Ok(x.clone());
    }
    Ok(x.pad_with_zeros(3, 0, FLASH_HEAD_DIM - head_dim)?)
}

/// Sharded block-tiled attention.
///
/// Shards are contiguous batch ranges, one per `data × fsdp` shard, run in
/// order and gathered on the query's device.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    mesh: &Mesh,
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    segment_ids: Option<&Tensor>,
    heads: usize,
    scale: f64,
    block_sizes: Option<BlockSizes>,
) -> Result<Tensor> {
    let dtype = query.dtype();
    let (batch, q_len, depth) = query.dims3()?;
    let kv_len = key.dim(1)?;
    let head_dim = depth / heads;

    let shards = mesh.shard_count(LogicalAxis::Batch);
    if batch % shards != 0 {
        tracing::warn!(
            batch,
            shards,
            mesh = %mesh,
            "batch not divisible by data x fsdp shards; flash attention shards will be uneven"
        );
    }
    let blocks = block_sizes.unwrap_or_else(|| default_block_sizes(q_len, kv_len));

    let q = pad_head_dim(&split_heads(query, heads)?.to_dtype(DType::F32)?)?;
    let k = pad_head_dim(&(split_heads(key, heads)?.to_dtype(DType::F32)? * scale)?)?;
    let v = pad_head_dim(&split_heads(value, heads)?.to_dtype(DType::F32)?)?;

    let q_shards = mesh.split(&q, LogicalAxis::Batch)?;
    let k_shards = mesh.split(&k, LogicalAxis::Batch)?;
    let v_shards = mesh.split(&v, LogicalAxis::Batch)?;
    let segment_shards = segment_ids
        .map(|segments| mesh.split(segments, LogicalAxis::Batch))
        .transpose()?;

    tracing::debug!(
        shards = q_shards.len(),
        block_q = blocks.block_q,
        block_kv = blocks.block_kv,
        "flash attention"
    );

    let mut outputs = Vec::with_capacity(q_shards.len());
    for (i, ((q, k), v)) in q_shards.iter().zip(&k_shards).zip(&v_shards).enumerate() {
        let segments = segment_shards.as_ref().map(|shards| &shards[i]);
        outputs.push(online_softmax(
            q,
            k,
            v,
            segments,
            1.0,
            blocks.block_q,
            blocks.block_kv,
            FLASH_MASK_VALUE,
        )?);
    }

    let out = Mesh::gather(&outputs, query.device())?.narrow(3, 0, head_dim)?;
    merge_heads(&out)?.to_dtype(dtype).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::{AttentionKernel, apply_attention, dot_product};
    use crate::mesh::{LogicalAxisRules, MeshAxis};
    use candle_core::Device;
    use std::sync::{Arc, Mutex};

    fn mesh(data: usize) -> Mesh {
        Mesh::new(
            vec![Device::Cpu; data],
            vec![(MeshAxis::Data, data), (MeshAxis::Fsdp, 1)],
            LogicalAxisRules::default(),
        )
        .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn matches_dot_product_across_shards() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (4, 24, 16), &dev).unwrap();
        let k = Tensor::randn(0f32, 1.0, (4, 24, 16), &dev).unwrap();
        let v = Tensor::randn(0f32, 1.0, (4, 24, 16), &dev).unwrap();
        let reference = dot_product::attention(&q, &k, &v, None, 2, 0.125).unwrap();
        let blocks = BlockSizes {
            block_q: 8,
            block_kv: 5,
        };
        let out = attention(&mesh(2), &q, &k, &v, None, 2, 0.125, Some(blocks)).unwrap();
        assert_eq!(out.dims(), &[4, 24, 16]);
        assert!(max_abs_diff(&reference, &out) < 1e-4);
    }

    #[test]
    fn segment_gating_matches_dot_product() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 16, 8), &dev).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 16, 8), &dev).unwrap();
        let v = Tensor::randn(0f32, 1.0, (2, 16, 8), &dev).unwrap();
        let ids: Vec<u32> = (0..32).map(|i| u32::from(i % 16 < 10 + i / 16)).collect();
        let segments = Tensor::from_vec(ids, (2, 16), &dev).unwrap();
        let reference = dot_product::attention(&q, &k, &v, Some(&segments), 1, 0.3).unwrap();
        let out = attention(&mesh(2), &q, &k, &v, Some(&segments), 1, 0.3, None).unwrap();
        assert!(max_abs_diff(&reference, &out) < 1e-4);
    }

    /// Log sink shared between the test and the subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn uneven_batch_runs_and_warns() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (3, 8, 8), &dev).unwrap();
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, || {
            attention(&mesh(2), &q, &q, &q, None, 2, 0.5, None).unwrap()
        });
        assert_eq!(out.dims(), &[3, 8, 8]);
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("WARN"), "{text}");
        assert!(text.contains("shards will be uneven"), "{text}");
    }

    #[test]
    fn even_batch_does_not_warn() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (4, 8, 8), &dev).unwrap();
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            attention(&mesh(2), &q, &q, &q, None, 2, 0.5, None).unwrap()
        });
        assert!(!logs.0.lock().unwrap().windows(4).any(|w| w == b"WARN"));
    }

    #[test]
    fn dispatcher_uses_flash_at_threshold() {
        let dev = Device::Cpu;
        let kernel = AttentionKernel::Flash {
            mesh: Arc::new(mesh(1)),
            min_seq_len: 8,
            block_sizes: None,
        };
        let q = Tensor::randn(0f32, 1.0, (1, 8, 8), &dev).unwrap();
        let reference = dot_product::attention(&q, &q, &q, None, 2, 0.5).unwrap();
        let out = apply_attention(&kernel, &q, &q, &q, None, 2, 0.5).unwrap();
        assert!(max_abs_diff(&reference, &out) < 1e-4);
    }

    #[test]
    fn head_dim_padding_is_sliced_back() {
        let x = Tensor::ones((1, 2, 3, 40), DType::F32, &Device::Cpu).unwrap();
        let padded = pad_head_dim(&x).unwrap();
        assert_eq!(padded.dims(), &[1, 2, 3, FLASH_HEAD_DIM]);
        let wide = Tensor::ones((1, 2, 3, 256), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(pad_head_dim(&wide).unwrap().dim(3).unwrap(), 256);
    }
}
