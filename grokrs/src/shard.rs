//! Sharding layer: how tensor axes map onto a 2-D (data, model) device mesh.
//!
//! A [`PartitionSpec`] names, for each logical axis of a tensor, whether it is
//! replicated or split across one mesh axis. Resolving a spec against a shape
//! and a [`DeviceMesh`] yields a [`ShardLayout`] with concrete per-coordinate
//! boundaries; the layout is computed once at load time and never
//! re-interpreted per op.
//!
//! [`shard`] and [`gather`] are the pure data-level primitives built on a
//! layout: cut the block owned by one coordinate out of a full tensor, and
//! reassemble a full tensor from the blocks of every owning coordinate.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One of the two axes of the device mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshAxis {
    /// Independent batch items.
    Data,
    /// Cooperating weight/activation shards of one computation.
    Model,
}

impl MeshAxis {
    /// Canonical axis name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Model => "model",
        }
    }
}

/// Position of one device in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshCoord {
    pub data: usize,
    pub model: usize,
}

impl MeshCoord {
    #[must_use]
    pub const fn new(data: usize, model: usize) -> Self {
        Self { data, model }
    }

    /// Component along `axis`.
    #[must_use]
    pub const fn along(self, axis: MeshAxis) -> usize {
        match axis {
            MeshAxis::Data => self.data,
            MeshAxis::Model => self.model,
        }
    }
}

impl fmt::Display for MeshCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(data={}, model={})", self.data, self.model)
    }
}

/// Shape of the 2-D device mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMesh {
    pub data: usize,
    pub model: usize,
}

impl DeviceMesh {
    /// # Errors
    /// Returns `ConfigInvalid` if either axis is empty.
    pub fn new(data: usize, model: usize) -> Result<Self> {
        if data == 0 || model == 0 {
            return Err(Error::ConfigInvalid(format!(
                "mesh axes must be non-empty, got data={data} model={model}"
            )));
        }
        Ok(Self { data, model })
    }

    /// A 1x1 mesh: one device holding everything.
    #[must_use]
    pub const fn single() -> Self {
        Self { data: 1, model: 1 }
    }

    /// Number of devices along `axis`.
    #[must_use]
    pub const fn size(&self, axis: MeshAxis) -> usize {
        match axis {
            MeshAxis::Data => self.data,
            MeshAxis::Model => self.model,
        }
    }

    #[must_use]
    pub const fn num_devices(&self) -> usize {
        self.data * self.model
    }

    /// All coordinates, data-major.
    #[must_use]
    pub fn coords(&self) -> Vec<MeshCoord> {
        (0..self.data)
            .flat_map(|d| (0..self.model).map(move |m| MeshCoord::new(d, m)))
            .collect()
    }

    /// Whether `coord` lies inside this mesh.
    #[must_use]
    pub const fn contains(&self, coord: MeshCoord) -> bool {
        coord.data < self.data && coord.model < self.model
    }

    /// Model-axis group position of `coord`.
    #[must_use]
    pub const fn shard_config(&self, coord: MeshCoord) -> ShardConfig {
        ShardConfig {
            rank: coord.model,
            world_size: self.model,
        }
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.data, self.model)
    }
}

/// Describes one device's position in a model-axis group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This device's rank (`0..world_size`)
    pub rank: usize,
    /// Number of devices along the model axis
    pub world_size: usize,
}

impl ShardConfig {
    /// A group of one.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Errors
    /// Returns `UnevenShard` if `dim` is not evenly divisible by `world_size`.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if self.world_size == 0 || dim % self.world_size != 0 {
            return Err(Error::UnevenShard {
                axis: 0,
                len: dim,
                shards: self.world_size,
            });
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }
}

/// Placement of one logical tensor axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisSpec {
    /// Every coordinate holds the full axis.
    Replicate,
    /// The axis is cut into equal contiguous blocks along a mesh axis.
    Split(MeshAxis),
}

/// Per-axis placement of a logical tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionSpec(Vec<AxisSpec>);

impl PartitionSpec {
    #[must_use]
    pub fn new(axes: Vec<AxisSpec>) -> Self {
        Self(axes)
    }

    /// Fully replicated spec of the given rank.
    #[must_use]
    pub fn replicated(rank: usize) -> Self {
        Self(vec![AxisSpec::Replicate; rank])
    }

    /// Spec of the given rank with only `axis` split along `mesh_axis`.
    #[must_use]
    pub fn split(rank: usize, axis: usize, mesh_axis: MeshAxis) -> Self {
        let mut axes = vec![AxisSpec::Replicate; rank];
        if let Some(a) = axes.get_mut(axis) {
            *a = AxisSpec::Split(mesh_axis);
        }
        Self(axes)
    }

    #[must_use]
    pub fn axes(&self) -> &[AxisSpec] {
        &self.0
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Copy of this spec with `axis` forced to replicate.
    #[must_use]
    pub fn with_replicated(&self, axis: usize) -> Self {
        let mut axes = self.0.clone();
        if let Some(a) = axes.get_mut(axis) {
            *a = AxisSpec::Replicate;
        }
        Self(axes)
    }

    /// Resolve this spec for `shape` on `mesh` into concrete boundaries.
    ///
    /// # Errors
    /// * `InvalidPartition` if the spec rank differs from the shape rank, or a
    ///   mesh axis with more than one device splits more than one logical axis
    ///   (the shard count along it would no longer divide the mesh axis).
    /// * `UnevenShard` if a split axis is not divisible by its shard count.
    pub fn resolve(&self, shape: &[usize], mesh: &DeviceMesh) -> Result<ShardLayout> {
        if self.rank() != shape.len() {
            return Err(Error::InvalidPartition(format!(
                "spec of rank {} for tensor of shape {shape:?}",
                self.rank()
            )));
        }

        for mesh_axis in [MeshAxis::Data, MeshAxis::Model] {
            let uses = self
                .0
                .iter()
                .filter(|a| **a == AxisSpec::Split(mesh_axis))
                .count();
            if uses > 1 && mesh.size(mesh_axis) > 1 {
                return Err(Error::InvalidPartition(format!(
                    "mesh axis '{}' splits {uses} tensor axes",
                    mesh_axis.name()
                )));
            }
        }

        let mut splits = Vec::with_capacity(shape.len());
        let mut local_shape = Vec::with_capacity(shape.len());
        for (axis, (&len, spec)) in shape.iter().zip(&self.0).enumerate() {
            match *spec {
                AxisSpec::Replicate => {
                    splits.push(None);
                    local_shape.push(len);
                }
                AxisSpec::Split(mesh_axis) => {
                    let shards = mesh.size(mesh_axis);
                    if len % shards != 0 {
                        return Err(Error::UnevenShard { axis, len, shards });
                    }
                    splits.push(Some((mesh_axis, shards)));
                    local_shape.push(len / shards);
                }
            }
        }

        Ok(ShardLayout {
            mesh: *mesh,
            global_shape: shape.to_vec(),
            local_shape,
            splits,
        })
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P(")?;
        for (i, a) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match a {
                AxisSpec::Replicate => write!(f, "None")?,
                AxisSpec::Split(axis) => write!(f, "{}", axis.name())?,
            }
        }
        write!(f, ")")
    }
}

/// A partition spec resolved against a concrete shape and mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    mesh: DeviceMesh,
    global_shape: Vec<usize>,
    local_shape: Vec<usize>,
    splits: Vec<Option<(MeshAxis, usize)>>,
}

impl ShardLayout {
    #[must_use]
    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    #[must_use]
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Shape of the block held by every owning coordinate.
    #[must_use]
    pub fn local_shape(&self) -> &[usize] {
        &self.local_shape
    }

    /// Number of distinct blocks the tensor is cut into.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.splits.iter().flatten().map(|(_, n)| n).product()
    }

    /// Whether no axis is split along `mesh_axis`.
    #[must_use]
    pub fn is_replicated_along(&self, mesh_axis: MeshAxis) -> bool {
        !self.splits.iter().flatten().any(|(a, _)| *a == mesh_axis)
    }

    /// The coordinate that stores the same block as `coord` with zero
    /// components along every mesh axis the tensor is replicated over.
    #[must_use]
    pub fn canonical(&self, coord: MeshCoord) -> MeshCoord {
        MeshCoord {
            data: if self.is_replicated_along(MeshAxis::Data) {
                0
            } else {
                coord.data
            },
            model: if self.is_replicated_along(MeshAxis::Model) {
                0
            } else {
                coord.model
            },
        }
    }

    /// One coordinate per distinct block, in mesh order.
    #[must_use]
    pub fn owners(&self) -> Vec<MeshCoord> {
        let mut owners: Vec<MeshCoord> = self
            .mesh
            .coords()
            .into_iter()
            .map(|c| self.canonical(c))
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    /// Per-axis index ranges of the block owned by `coord`.
    #[must_use]
    pub fn bounds(&self, coord: MeshCoord) -> Vec<Range<usize>> {
        self.splits
            .iter()
            .zip(&self.local_shape)
            .map(|(split, &local)| match split {
                None => 0..local,
                Some((mesh_axis, _)) => {
                    let start = coord.along(*mesh_axis) * local;
                    start..start + local
                }
            })
            .collect()
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Visit the contiguous innermost runs of the block `bounds` inside a
/// row-major tensor of `shape`, as `(full_offset, block_offset, run_len)`.
fn for_each_run(shape: &[usize], bounds: &[Range<usize>], mut f: impl FnMut(usize, usize, usize)) {
    let rank = shape.len();
    if rank == 0 {
        f(0, 0, 1);
        return;
    }
    if bounds.iter().any(|b| b.is_empty()) {
        return;
    }
    let strides = row_major_strides(shape);
    let inner = &bounds[rank - 1];
    let run = inner.len();
    let mut idx: Vec<usize> = bounds[..rank - 1].iter().map(|r| r.start).collect();
    let mut block_off = 0;
    loop {
        let full_off = idx
            .iter()
            .zip(&strides)
            .map(|(i, s)| i * s)
            .sum::<usize>()
            + inner.start;
        f(full_off, block_off, run);
        block_off += run;

        let mut axis = rank - 1;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < bounds[axis].end {
                break;
            }
            idx[axis] = bounds[axis].start;
        }
    }
}

fn check_bounds(shape: &[usize], bounds: &[Range<usize>]) -> Result<()> {
    if bounds.len() != shape.len() || bounds.iter().zip(shape).any(|(b, &len)| b.end > len) {
        return Err(Error::InvalidPartition(format!(
            "block {bounds:?} does not fit shape {shape:?}"
        )));
    }
    Ok(())
}

/// Copy the block `bounds` out of a row-major tensor.
///
/// # Errors
/// Returns an error if `data` does not match `shape` or the block does not fit.
pub fn extract_block(data: &[f32], shape: &[usize], bounds: &[Range<usize>]) -> Result<Vec<f32>> {
    crate::tensor::check_numel("block source", shape, data.len())?;
    check_bounds(shape, bounds)?;
    let len: usize = bounds.iter().map(ExactSizeIterator::len).product();
    let mut out = vec![0.0; len];
    for_each_run(shape, bounds, |full, block, run| {
        out[block..block + run].copy_from_slice(&data[full..full + run]);
    });
    Ok(out)
}

/// Write `block` into the region `bounds` of a row-major tensor.
///
/// # Errors
/// Returns an error if `data` does not match `shape`, the block does not fit,
/// or `block` has the wrong length.
pub fn insert_block(
    data: &mut [f32],
    shape: &[usize],
    bounds: &[Range<usize>],
    block: &[f32],
) -> Result<()> {
    crate::tensor::check_numel("block target", shape, data.len())?;
    check_bounds(shape, bounds)?;
    let block_shape: Vec<usize> = bounds.iter().map(ExactSizeIterator::len).collect();
    crate::tensor::check_numel("block", &block_shape, block.len())?;
    for_each_run(shape, bounds, |full, off, run| {
        data[full..full + run].copy_from_slice(&block[off..off + run]);
    });
    Ok(())
}

/// The local shard of `data` owned by `coord`.
///
/// # Errors
/// Returns an error if `data` does not match the layout's global shape or
/// `coord` lies outside the mesh.
pub fn shard(data: &[f32], layout: &ShardLayout, coord: MeshCoord) -> Result<Vec<f32>> {
    if !layout.mesh.contains(coord) {
        return Err(Error::InvalidPartition(format!(
            "coordinate {coord} outside mesh {}",
            layout.mesh
        )));
    }
    extract_block(data, &layout.global_shape, &layout.bounds(coord))
}

/// Reassemble a full tensor from its shards.
///
/// `pieces` must hold exactly one block for every coordinate in
/// [`ShardLayout::owners`]; extra replicas are ignored.
///
/// # Errors
/// Returns `InvalidPartition` if an owner is missing, or `ShapeMismatch` if a
/// block has the wrong number of elements.
pub fn gather(layout: &ShardLayout, pieces: &[(MeshCoord, Vec<f32>)]) -> Result<Vec<f32>> {
    let numel: usize = layout.global_shape.iter().product();
    let mut out = vec![0.0; numel];
    for owner in layout.owners() {
        let (_, block) = pieces
            .iter()
            .find(|(c, _)| layout.canonical(*c) == owner)
            .ok_or_else(|| Error::InvalidPartition(format!("missing shard for {owner}")))?;
        insert_block(&mut out, &layout.global_shape, &layout.bounds(owner), block)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn test_shard_range() {
        let shard = ShardConfig {
            rank: 3,
            world_size: 4,
        };
        assert_eq!(shard.shard_range(128).unwrap(), (96, 32));
        assert!(shard.shard_range(130).unwrap_err().is_shape_mismatch());
    }

    #[test]
    fn test_mesh_coords_are_data_major() {
        let mesh = DeviceMesh::new(2, 2).unwrap();
        assert_eq!(
            mesh.coords(),
            vec![
                MeshCoord::new(0, 0),
                MeshCoord::new(0, 1),
                MeshCoord::new(1, 0),
                MeshCoord::new(1, 1)
            ]
        );
        assert!(DeviceMesh::new(0, 2).is_err());
    }

    #[test]
    fn test_column_split_bounds() {
        let mesh = DeviceMesh::new(1, 4).unwrap();
        let layout = PartitionSpec::split(2, 1, MeshAxis::Model)
            .resolve(&[6, 8], &mesh)
            .unwrap();
        assert_eq!(layout.local_shape(), &[6, 2]);
        assert_eq!(layout.shard_count(), 4);
        assert_eq!(layout.bounds(MeshCoord::new(0, 2)), vec![0..6, 4..6]);
    }

    #[test]
    fn test_indivisible_axis_is_shape_mismatch() {
        let mesh = DeviceMesh::new(1, 4).unwrap();
        let err = PartitionSpec::split(2, 0, MeshAxis::Model)
            .resolve(&[6, 8], &mesh)
            .unwrap_err();
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn test_same_mesh_axis_twice_is_rejected() {
        let mesh = DeviceMesh::new(1, 2).unwrap();
        let spec = PartitionSpec::new(vec![
            AxisSpec::Split(MeshAxis::Model),
            AxisSpec::Split(MeshAxis::Model),
        ]);
        assert!(matches!(
            spec.resolve(&[4, 4], &mesh),
            Err(Error::InvalidPartition(_))
        ));
        // A trivial mesh axis may appear any number of times.
        assert!(spec.resolve(&[4, 4], &DeviceMesh::single()).is_ok());
    }

    #[test]
    fn test_rank_mismatch() {
        let mesh = DeviceMesh::single();
        assert!(PartitionSpec::replicated(1).resolve(&[2, 2], &mesh).is_err());
    }

    #[test]
    fn test_owners_skip_replicas() {
        let mesh = DeviceMesh::new(2, 3).unwrap();
        let layout = PartitionSpec::split(2, 0, MeshAxis::Model)
            .resolve(&[6, 2], &mesh)
            .unwrap();
        assert_eq!(
            layout.owners(),
            vec![
                MeshCoord::new(0, 0),
                MeshCoord::new(0, 1),
                MeshCoord::new(0, 2)
            ]
        );
        assert_eq!(layout.canonical(MeshCoord::new(1, 2)), MeshCoord::new(0, 2));
    }

    #[test]
    fn test_shard_picks_the_right_block() {
        let mesh = DeviceMesh::new(2, 2).unwrap();
        let spec = PartitionSpec::new(vec![
            AxisSpec::Split(MeshAxis::Data),
            AxisSpec::Split(MeshAxis::Model),
        ]);
        let layout = spec.resolve(&[2, 4], &mesh).unwrap();
        let data = iota(8);
        assert_eq!(
            shard(&data, &layout, MeshCoord::new(1, 1)).unwrap(),
            vec![6.0, 7.0]
        );
        assert!(shard(&data, &layout, MeshCoord::new(2, 0)).is_err());
    }

    #[test]
    fn test_gather_requires_every_owner() {
        let mesh = DeviceMesh::new(1, 2).unwrap();
        let layout = PartitionSpec::split(1, 0, MeshAxis::Model)
            .resolve(&[4], &mesh)
            .unwrap();
        let pieces = vec![(MeshCoord::new(0, 0), vec![0.0, 1.0])];
        assert!(gather(&layout, &pieces).is_err());
    }

    #[test]
    fn test_spec_serde_and_display() {
        let spec = PartitionSpec::new(vec![AxisSpec::Replicate, AxisSpec::Split(MeshAxis::Model)]);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"["replicate",{"split":"model"}]"#);
        let back: PartitionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(spec.to_string(), "P(None, model)");
    }
}
