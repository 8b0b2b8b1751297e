//! Sharded checkpoint storage.
//!
//! A checkpoint is a directory holding `manifest.json` and one
//! `.safetensors` file per storing mesh coordinate. The manifest lists every
//! tensor with its logical (unsharded) shape, storage dtype and partition
//! spec. Each tensor block lives only in the file of its canonical owner
//! (see [`ShardLayout::canonical`]), so replicated data is stored once.
//!
//! [`CheckpointReader::restore`] rebuilds every expected tensor from its
//! stored blocks, checks it against the caller's expected shape, and cuts it
//! again for the target mesh, which may differ from the mesh it was saved on.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::shard::{DeviceMesh, MeshCoord, PartitionSpec, ShardLayout};
use crate::weights::host::HostTensor;
use crate::weights::quantize::{dequantize_int8, quantize_int8};
use crate::weights::safetensors::{write_file, EncodedTensor, SafeTensorsFile};
use crate::{Error, Result};

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the manifest inside a checkpoint directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Suffix of the scale companion of an int8 tensor.
pub const SCALES_SUFFIX: &str = ".scales";

/// File holding the blocks stored by `coord`.
#[must_use]
pub fn shard_file_name(coord: MeshCoord) -> String {
    format!("shard-d{:03}-m{:03}.safetensors", coord.data, coord.model)
}

/// Manifest entry for one logical tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub partition: PartitionSpec,
    #[serde(default)]
    pub quantized: bool,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub mesh: DeviceMesh,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    pub tensors: Vec<TensorRecord>,
}

impl CheckpointManifest {
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&TensorRecord> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

/// A tensor the caller requires, with the shape its config implies and the
/// partition it wants on the target mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub partition: PartitionSpec,
}

impl ExpectedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, partition: PartitionSpec) -> Self {
        Self {
            name: name.into(),
            shape,
            partition,
        }
    }
}

/// Writes a sharded checkpoint directory.
pub struct CheckpointWriter {
    dir: PathBuf,
    mesh: DeviceMesh,
    config: Option<serde_json::Value>,
    records: Vec<TensorRecord>,
    files: BTreeMap<MeshCoord, Vec<EncodedTensor>>,
}

impl CheckpointWriter {
    /// Start a checkpoint in `dir` laid out for `mesh`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>, mesh: DeviceMesh) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            mesh,
            config: None,
            records: Vec::new(),
            files: BTreeMap::new(),
        })
    }

    /// Embed a model config in the manifest.
    ///
    /// # Errors
    /// Returns an error if the config cannot be serialized.
    pub fn with_config<T: Serialize>(mut self, config: &T) -> Result<Self> {
        self.config = Some(serde_json::to_value(config)?);
        Ok(self)
    }

    fn push_record(&mut self, record: TensorRecord) -> Result<()> {
        if self.records.iter().any(|r| r.name == record.name) {
            return Err(Error::Other(format!("duplicate tensor {}", record.name)));
        }
        self.records.push(record);
        Ok(())
    }

    fn push_blocks(
        &mut self,
        name: &str,
        tensor: &HostTensor,
        layout: &ShardLayout,
        dtype: DType,
    ) -> Result<()> {
        for owner in layout.owners() {
            let block = tensor.shard(layout, owner)?;
            self.files.entry(owner).or_default().push(EncodedTensor {
                name: name.to_string(),
                dtype,
                shape: block.shape,
                bytes: dtype.encode_f32(&block.data),
            });
        }
        Ok(())
    }

    /// Add a tensor stored as `dtype`.
    ///
    /// # Errors
    /// Returns an error if the name is taken or the partition does not fit
    /// the tensor on this writer's mesh.
    pub fn add(
        &mut self,
        name: &str,
        tensor: &HostTensor,
        partition: PartitionSpec,
        dtype: DType,
    ) -> Result<()> {
        if dtype == DType::I8 {
            return self.add_quantized(name, tensor, partition);
        }
        let layout = partition.resolve(&tensor.shape, &self.mesh)?;
        self.push_record(TensorRecord {
            name: name.to_string(),
            shape: tensor.shape.clone(),
            dtype,
            partition,
            quantized: false,
        })?;
        self.push_blocks(name, tensor, &layout, dtype)
    }

    /// Add a tensor stored as int8 with per-column f32 scales.
    ///
    /// # Errors
    /// Returns an error if the name is taken, the tensor has rank below 2, or
    /// the partition does not fit.
    pub fn add_quantized(
        &mut self,
        name: &str,
        tensor: &HostTensor,
        partition: PartitionSpec,
    ) -> Result<()> {
        let q = quantize_int8(tensor)?;
        let layout = partition.resolve(&tensor.shape, &self.mesh)?;
        let scale_partition = partition.with_replicated(partition.rank().saturating_sub(2));
        let scale_layout = scale_partition.resolve(&q.scales.shape, &self.mesh)?;
        self.push_record(TensorRecord {
            name: name.to_string(),
            shape: tensor.shape.clone(),
            dtype: DType::I8,
            partition,
            quantized: true,
        })?;
        self.push_blocks(name, &q.values, &layout, DType::I8)?;
        // Scales follow the weight's owners so each file is self-contained.
        for owner in layout.owners() {
            let block = q.scales.shard(&scale_layout, owner)?;
            self.files.entry(owner).or_default().push(EncodedTensor {
                name: format!("{name}{SCALES_SUFFIX}"),
                dtype: DType::F32,
                shape: block.shape,
                bytes: DType::F32.encode_f32(&block.data),
            });
        }
        Ok(())
    }

    /// Write all shard files and the manifest.
    ///
    /// # Errors
    /// Returns an error if any file cannot be written.
    pub fn finish(self) -> Result<CheckpointManifest> {
        for (coord, tensors) in &self.files {
            write_file(self.dir.join(shard_file_name(*coord)), tensors)?;
        }
        let manifest = CheckpointManifest {
            format_version: FORMAT_VERSION,
            mesh: self.mesh,
            config: self.config,
            tensors: self.records,
        };
        fs::write(
            self.dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        tracing::info!(
            dir = %self.dir.display(),
            mesh = %manifest.mesh,
            tensors = manifest.tensors.len(),
            files = self.files.len(),
            "checkpoint written"
        );
        Ok(manifest)
    }
}

/// Weights restored for one mesh coordinate.
#[derive(Debug)]
pub struct WeightShard {
    pub coord: MeshCoord,
    pub mesh: DeviceMesh,
    tensors: HashMap<String, HostTensor>,
}

impl WeightShard {
    #[must_use]
    pub fn new(coord: MeshCoord, mesh: DeviceMesh) -> Self {
        Self {
            coord,
            mesh,
            tensors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    /// Remove and return a tensor.
    ///
    /// # Errors
    /// Returns `WeightNotFound` if the tensor is absent.
    pub fn take(&mut self, name: &str) -> Result<HostTensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Every expected tensor, cut for every coordinate of the target mesh.
#[derive(Debug)]
pub struct ShardedWeights {
    pub mesh: DeviceMesh,
    pub shards: Vec<WeightShard>,
}

impl ShardedWeights {
    /// Split into per-coordinate shards, data-major.
    #[must_use]
    pub fn into_shards(self) -> Vec<WeightShard> {
        self.shards
    }
}

/// Reads a checkpoint directory written by [`CheckpointWriter`].
pub struct CheckpointReader {
    dir: PathBuf,
    manifest: CheckpointManifest,
    files: HashMap<MeshCoord, SafeTensorsFile>,
}

impl CheckpointReader {
    /// Read the manifest and map every shard file present.
    ///
    /// # Errors
    /// Returns an error if the manifest is missing or malformed, or its
    /// format version is unsupported.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let text = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest: CheckpointManifest = serde_json::from_str(&text)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::ConfigInvalid(format!(
                "checkpoint format version {} is not supported (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }

        let mut files = HashMap::new();
        for coord in manifest.mesh.coords() {
            let path = dir.join(shard_file_name(coord));
            if path.exists() {
                files.insert(coord, SafeTensorsFile::open(&path)?);
            }
        }
        tracing::debug!(
            dir = %dir.display(),
            mesh = %manifest.mesh,
            files = files.len(),
            "opened checkpoint"
        );

        Ok(Self {
            dir,
            manifest,
            files,
        })
    }

    #[must_use]
    pub fn manifest(&self) -> &CheckpointManifest {
        &self.manifest
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deserialize the embedded model config, if any.
    ///
    /// # Errors
    /// Returns an error if the stored config does not deserialize as `T`.
    pub fn config<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.manifest
            .config
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    fn record(&self, name: &str) -> Result<&TensorRecord> {
        self.manifest
            .record(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }

    fn read_block(
        &self,
        record: &TensorRecord,
        owner: MeshCoord,
        local_shape: &[usize],
    ) -> Result<HostTensor> {
        let file = self.files.get(&owner).ok_or_else(|| {
            Error::WeightNotFound(format!("{} (no shard file for {owner})", record.name))
        })?;
        let (shape, values) = file.load_f32(&record.name)?;
        if shape != local_shape {
            return Err(Error::shape(
                format!("{} at {owner}", record.name),
                local_shape,
                &shape,
            ));
        }
        let block = HostTensor::new(shape, values)?;
        if !record.quantized {
            return Ok(block);
        }
        let (s_shape, s_values) = file.load_f32(&format!("{}{SCALES_SUFFIX}", record.name))?;
        dequantize_int8(&block, &HostTensor::new(s_shape, s_values)?)
    }

    /// Reassemble one full tensor from its stored blocks.
    ///
    /// # Errors
    /// Returns `WeightNotFound` if the tensor or one of its blocks is missing,
    /// or `ShapeMismatch` if a stored block disagrees with the manifest.
    pub fn load_full(&self, name: &str) -> Result<HostTensor> {
        let record = self.record(name)?;
        let layout = record.partition.resolve(&record.shape, &self.manifest.mesh)?;
        let pieces = layout
            .owners()
            .into_iter()
            .map(|owner| Ok((owner, self.read_block(record, owner, layout.local_shape())?)))
            .collect::<Result<Vec<_>>>()?;
        HostTensor::gather(&layout, pieces)
    }

    /// Restore every expected tensor for `target`.
    ///
    /// All shapes and target partitions are validated before any tensor data
    /// is read, and nothing is returned unless every tensor restored.
    ///
    /// # Errors
    /// * `WeightNotFound` if an expected tensor is absent.
    /// * `ShapeMismatch` if a stored shape disagrees with the expected shape.
    /// * `UnevenShard` / `InvalidPartition` if a target partition does not
    ///   fit the target mesh.
    pub fn restore(&self, expected: &[ExpectedTensor], target: &DeviceMesh) -> Result<ShardedWeights> {
        let start = Instant::now();

        let mut plan = Vec::with_capacity(expected.len());
        for e in expected {
            let record = self.record(&e.name)?;
            if record.shape != e.shape {
                return Err(Error::shape(&e.name, &e.shape, &record.shape));
            }
            plan.push((e, e.partition.resolve(&e.shape, target)?));
        }

        let mut shards: Vec<WeightShard> = target
            .coords()
            .into_iter()
            .map(|c| WeightShard::new(c, *target))
            .collect();
        for (e, layout) in &plan {
            let full = self.load_full(&e.name)?;
            for shard in &mut shards {
                let block = full.shard(layout, shard.coord)?;
                shard.insert(e.name.clone(), block);
            }
            tracing::trace!(name = %e.name, shape = ?e.shape, partition = %e.partition, "restored");
        }

        tracing::info!(
            dir = %self.dir.display(),
            saved_mesh = %self.manifest.mesh,
            target_mesh = %target,
            tensors = plan.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "checkpoint restored"
        );
        Ok(ShardedWeights {
            mesh: *target,
            shards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::MeshAxis;

    fn ramp(shape: &[usize]) -> HostTensor {
        let n: usize = shape.iter().product();
        HostTensor::new(shape.to_vec(), (0..n).map(|i| i as f32 * 0.25 - 1.0).collect()).unwrap()
    }

    fn write_sample(dir: &Path, mesh: DeviceMesh) -> (HostTensor, HostTensor) {
        let w = ramp(&[4, 6]);
        let e = ramp(&[2, 4, 6]);
        let mut writer = CheckpointWriter::new(dir, mesh).unwrap();
        writer
            .add("w", &w, PartitionSpec::split(2, 1, MeshAxis::Model), DType::F32)
            .unwrap();
        writer
            .add_quantized("experts", &e, PartitionSpec::split(3, 2, MeshAxis::Model))
            .unwrap();
        writer
            .add("norm", &ramp(&[4]), PartitionSpec::replicated(1), DType::BF16)
            .unwrap();
        writer.finish().unwrap();
        (w, e)
    }

    #[test]
    fn test_replicated_tensor_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), DeviceMesh::new(1, 2).unwrap());
        let f0 = SafeTensorsFile::open(dir.path().join(shard_file_name(MeshCoord::new(0, 0)))).unwrap();
        let f1 = SafeTensorsFile::open(dir.path().join(shard_file_name(MeshCoord::new(0, 1)))).unwrap();
        assert!(f0.contains("norm"));
        assert!(!f1.contains("norm"));
        assert!(f1.contains("experts.scales"));
        assert_eq!(f1.shape("w").unwrap(), vec![4, 3]);
    }

    #[test]
    fn test_load_full_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (w, e) = write_sample(dir.path(), DeviceMesh::new(1, 2).unwrap());
        let reader = CheckpointReader::open(dir.path()).unwrap();
        assert_eq!(reader.load_full("w").unwrap(), w);

        let restored = reader.load_full("experts").unwrap();
        assert_eq!(restored.shape, e.shape);
        let max_err = restored
            .data
            .iter()
            .zip(&e.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f32, f32::max);
        assert!(max_err < 0.05, "int8 error {max_err}");
    }

    #[test]
    fn test_restore_reshards_for_a_different_mesh() {
        let dir = tempfile::tempdir().unwrap();
        let (w, _) = write_sample(dir.path(), DeviceMesh::new(1, 2).unwrap());
        let reader = CheckpointReader::open(dir.path()).unwrap();
        let target = DeviceMesh::new(2, 3).unwrap();
        let expected = vec![ExpectedTensor::new(
            "w",
            vec![4, 6],
            PartitionSpec::split(2, 1, MeshAxis::Model),
        )];
        let weights = reader.restore(&expected, &target).unwrap();
        assert_eq!(weights.shards.len(), 6);

        let layout = expected[0].partition.resolve(&[4, 6], &target).unwrap();
        let pieces: Vec<_> = weights
            .into_shards()
            .into_iter()
            .map(|mut s| {
                let t = s.take("w").unwrap();
                assert_eq!(t.shape, vec![4, 2]);
                (s.coord, t)
            })
            .collect();
        assert_eq!(HostTensor::gather(&layout, pieces).unwrap(), w);
    }

    #[test]
    fn test_restore_rejects_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), DeviceMesh::single());
        let reader = CheckpointReader::open(dir.path()).unwrap();
        let expected = vec![ExpectedTensor::new("w", vec![4, 8], PartitionSpec::replicated(2))];
        let err = reader.restore(&expected, &DeviceMesh::single()).unwrap_err();
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn test_restore_rejects_missing_and_indivisible() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), DeviceMesh::single());
        let reader = CheckpointReader::open(dir.path()).unwrap();

        let missing = vec![ExpectedTensor::new("nope", vec![1], PartitionSpec::replicated(1))];
        assert!(matches!(
            reader.restore(&missing, &DeviceMesh::single()),
            Err(Error::WeightNotFound(_))
        ));

        let uneven = vec![ExpectedTensor::new(
            "w",
            vec![4, 6],
            PartitionSpec::split(2, 1, MeshAxis::Model),
        )];
        let err = reader
            .restore(&uneven, &DeviceMesh::new(1, 4).unwrap())
            .unwrap_err();
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn test_version_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), DeviceMesh::single());
        let path = dir.path().join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("\"format_version\": 1", "\"format_version\": 9")).unwrap();
        assert!(matches!(
            CheckpointReader::open(dir.path()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_config_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Cfg {
            layers: usize,
        }
        let dir = tempfile::tempdir().unwrap();
        CheckpointWriter::new(dir.path(), DeviceMesh::single())
            .unwrap()
            .with_config(&Cfg { layers: 3 })
            .unwrap()
            .finish()
            .unwrap();
        let reader = CheckpointReader::open(dir.path()).unwrap();
        assert_eq!(reader.config::<Cfg>().unwrap(), Some(Cfg { layers: 3 }));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CheckpointWriter::new(dir.path(), DeviceMesh::single()).unwrap();
        let t = ramp(&[2]);
        writer.add("a", &t, PartitionSpec::replicated(1), DType::F32).unwrap();
        assert!(writer.add("a", &t, PartitionSpec::replicated(1), DType::F32).is_err());
    }
}
