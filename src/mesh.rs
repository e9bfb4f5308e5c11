//! Device mesh and logical-axis partitioning rules.
//!
//! A [`Mesh`] names a grid of devices along the axes `data`, `fsdp`,
//! `sequence` and `tensor`. Model code never refers to mesh axes directly;
//! it names *logical* axes (batch, length, heads, embed) and the mesh's
//! [`LogicalAxisRules`] decide which mesh axes shard them.
//!
//! ```text
//! logical batch  → (data, fsdp)
//! logical length → sequence
//! logical heads  → tensor
//! logical embed  → replicated
//! ```
//!
//! Devices are laid out row-major over the mesh axes in declaration order, so
//! with the default axis order batch shard `i` lives on
//! `devices[i * (device_count / batch_shards)]`.

use std::fmt;

use candle_core::{Device, Tensor};
use serde::Deserialize;

use crate::{Error, Result};

/// Physical mesh axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshAxis {
    Data,
    Fsdp,
    Sequence,
    Tensor,
}

impl MeshAxis {
    pub fn name(self) -> &'static str {
        match self {
            MeshAxis::Data => "data",
            MeshAxis::Fsdp => "fsdp",
            MeshAxis::Sequence => "sequence",
            MeshAxis::Tensor => "tensor",
        }
    }
}

/// Logical tensor axis used by model code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalAxis {
    Batch,
    Length,
    Heads,
    Embed,
}

/// Mapping from logical axes to the mesh axes that shard them.
#[derive(Debug, Clone, Deserialize)]
pub struct LogicalAxisRules {
    rules: Vec<(LogicalAxis, Vec<MeshAxis>)>,
}

impl Default for LogicalAxisRules {
    fn default() -> Self {
        Self {
            rules: vec![
                (LogicalAxis::Batch, vec![MeshAxis::Data, MeshAxis::Fsdp]),
                (LogicalAxis::Length, vec![MeshAxis::Sequence]),
                (LogicalAxis::Heads, vec![MeshAxis::Tensor]),
                (LogicalAxis::Embed, vec![]),
            ],
        }
    }
}

impl LogicalAxisRules {
    pub fn new(rules: Vec<(LogicalAxis, Vec<MeshAxis>)>) -> Self {
        Self { rules }
    }

    /// Mesh axes sharding `axis`; empty means replicated.
    pub fn mesh_axes(&self, axis: LogicalAxis) -> &[MeshAxis] {
        self.rules
            .iter()
            .find(|(logical, _)| *logical == axis)
            .map(|(_, mesh_axes)| mesh_axes.as_slice())
            .unwrap_or(&[])
    }
}

/// Named device grid. Immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct Mesh {
    shape: Vec<(MeshAxis, usize)>,
    devices: Vec<Device>,
    rules: LogicalAxisRules,
}

impl Mesh {
    /// Build a mesh over `devices` with the given axis sizes.
    ///
    /// The product of the axis sizes must equal the device count and no axis
    /// may appear twice.
    pub fn new(
        devices: Vec<Device>,
        shape: Vec<(MeshAxis, usize)>,
        rules: LogicalAxisRules,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Config("mesh needs at least one device".into()));
        }
        for (i, (axis, size)) in shape.iter().enumerate() {
            if *size == 0 {
                return Err(Error::Config(format!(
                    "mesh axis {} has size 0",
                    axis.name()
                )));
            }
            if shape[..i].iter().any(|(other, _)| other == axis) {
                return Err(Error::Config(format!(
                    "mesh axis {} declared twice",
                    axis.name()
                )));
            }
        }
        let product: usize = shape.iter().map(|(_, size)| size).product();
        if product != devices.len() {
            return Err(Error::Config(format!(
                "mesh shape covers {product} devices but {} were given",
                devices.len()
            )));
        }
        Ok(Self {
            shape,
            devices,
            rules,
        })
    }

    /// A one-device mesh with every axis of size 1.
    pub fn single(device: Device) -> Self {
        Self {
            shape: vec![
                (MeshAxis::Data, 1),
                (MeshAxis::Fsdp, 1),
                (MeshAxis::Sequence, 1),
                (MeshAxis::Tensor, 1),
            ],
            devices: vec![device],
            rules: LogicalAxisRules::default(),
        }
    }

    /// Pure data parallelism: every device is its own `data` shard.
    pub fn data_parallel(devices: Vec<Device>) -> Result<Self> {
        let n = devices.len();
        Self::new(
            devices,
            vec![
                (MeshAxis::Data, n),
                (MeshAxis::Fsdp, 1),
                (MeshAxis::Sequence, 1),
                (MeshAxis::Tensor, 1),
            ],
            LogicalAxisRules::default(),
        )
    }

    /// Size of a mesh axis (1 when the axis is not declared).
    pub fn axis_size(&self, axis: MeshAxis) -> usize {
        self.shape
            .iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, size)| *size)
            .unwrap_or(1)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Device holding unsharded tensors and model parameters.
    pub fn primary_device(&self) -> &Device {
        &self.devices[0]
    }

    pub fn rules(&self) -> &LogicalAxisRules {
        &self.rules
    }

    /// Number of shards a logical axis is split into.
    pub fn shard_count(&self, axis: LogicalAxis) -> usize {
        self.rules
            .mesh_axes(axis)
            .iter()
            .map(|mesh_axis| self.axis_size(*mesh_axis))
            .product()
    }

    /// The device owning shard `index` of a logical axis.
    pub fn shard_device(&self, axis: LogicalAxis, index: usize) -> &Device {
        let shards = self.shard_count(axis).max(1);
        let stride = (self.device_count() / shards).max(1);
        &self.devices[(index * stride).min(self.device_count() - 1)]
    }

    /// Round `batch` up to a multiple of the device count.
    pub fn padded_batch_size(&self, batch: usize) -> usize {
        let n = self.device_count();
        batch.max(1).div_ceil(n) * n
    }

    /// Append zero rows along dim 0 up to [`Mesh::padded_batch_size`].
    pub fn pad_batch(&self, tensor: &Tensor) -> Result<Tensor> {
        let batch = tensor.dim(0)?;
        let target = self.padded_batch_size(batch);
        if target == batch {
            return Ok(tensor.clone());
        }
        Ok(tensor.pad_with_zeros(0, 0, target - batch)?)
    }

    /// Split dim 0 of `tensor` into the shards of `axis`, each moved to its
    /// device. Shards are contiguous row ranges; trailing shards may be
    /// smaller (or absent) when the batch does not divide evenly.
    pub fn split(&self, tensor: &Tensor, axis: LogicalAxis) -> Result<Vec<Tensor>> {
        let batch = tensor.dim(0)?;
        let shards = self.shard_count(axis).max(1);
        let rows = batch.div_ceil(shards).max(1);
        let mut out = Vec::with_capacity(shards);
        let mut start = 0;
        let mut index = 0;
        while start < batch {
            let len = rows.min(batch - start);
            let shard = tensor
                .narrow(0, start, len)?
                .to_device(self.shard_device(axis, index))?;
            out.push(shard);
            start += len;
            index += 1;
        }
        Ok(out)
    }

    /// Concatenate shards along dim 0 on `device`.
    pub fn gather(shards: &[Tensor], device: &Device) -> Result<Tensor> {
        let local = shards
            .iter()
            .map(|shard| shard.to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&local, 0)?)
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes = self
            .shape
            .iter()
            .map(|(axis, size)| format!("{}={size}", axis.name()))
            .collect::<Vec<_>>();
        write!(f, "[{}]", axes.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn cpu_mesh(data: usize, fsdp: usize) -> Mesh {
        Mesh::new(
            vec![Device::Cpu; data * fsdp],
            vec![(MeshAxis::Data, data), (MeshAxis::Fsdp, fsdp)],
            LogicalAxisRules::default(),
        )
        .unwrap()
    }

    #[test]
    fn shape_must_cover_devices() {
        let result = Mesh::new(
            vec![Device::Cpu; 3],
            vec![(MeshAxis::Data, 2)],
            LogicalAxisRules::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn duplicate_axis_rejected() {
        let result = Mesh::new(
            vec![Device::Cpu; 4],
            vec![(MeshAxis::Data, 2), (MeshAxis::Data, 2)],
            LogicalAxisRules::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn batch_shards_span_data_and_fsdp() {
        let mesh = cpu_mesh(2, 2);
        assert_eq!(mesh.shard_count(LogicalAxis::Batch), 4);
        assert_eq!(mesh.shard_count(LogicalAxis::Embed), 1);
        // Undeclared axes count as size 1.
        assert_eq!(mesh.shard_count(LogicalAxis::Heads), 1);
    }

    #[test]
    fn padded_batch_rounds_up_to_device_count() {
        let mesh = cpu_mesh(4, 1);
        assert_eq!(mesh.padded_batch_size(1), 4);
        assert_eq!(mesh.padded_batch_size(4), 4);
        assert_eq!(mesh.padded_batch_size(5), 8);
        assert_eq!(mesh.padded_batch_size(0), 4);
    }

    #[test]
    fn pad_batch_appends_zero_rows() {
        let mesh = cpu_mesh(3, 1);
        let x = Tensor::ones((2, 5), DType::F32, &Device::Cpu).unwrap();
        let padded = mesh.pad_batch(&x).unwrap();
        assert_eq!(padded.dims(), &[3, 5]);
        let last: Vec<f32> = padded.get(2).unwrap().to_vec1().unwrap();
        assert!(last.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn split_and_gather_preserve_rows() {
        let mesh = cpu_mesh(2, 1);
        let x = Tensor::arange(0f32, 15.0, &Device::Cpu)
            .unwrap()
            .reshape((5, 3))
            .unwrap();
        let shards = mesh.split(&x, LogicalAxis::Batch).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].dim(0).unwrap(), 3);
        assert_eq!(shards[1].dim(0).unwrap(), 2);
        let back = Mesh::gather(&shards, &Device::Cpu).unwrap();
        let diff: f32 = (back - &x)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn display_lists_axes() {
        let mesh = cpu_mesh(2, 1);
        assert_eq!(mesh.to_string(), "[data=2, fsdp=1]");
    }
}
