//! `SafeTensors` file access with memory mapping

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::{SafeTensors, TensorView};

use crate::dtype::DType;
use crate::{Error, Result};

/// One memory-mapped `.safetensors` file.
///
/// Only the header is parsed up front; tensor bytes are read from the map on
/// demand.
pub struct SafeTensorsFile {
    path: PathBuf,
    mmap: Mmap,
    tensors: HashMap<String, TensorMeta>,
}

#[derive(Debug, Clone)]
struct TensorMeta {
    shape: Vec<usize>,
    dtype: DType,
    data_start: usize,
    data_len: usize,
}

impl SafeTensorsFile {
    /// Map and index a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or its header is invalid.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: the map is read-only and checkpoint files are not modified
        // while a loader holds them.
        let mmap = unsafe { Mmap::map(&file)? };

        let mut tensors = HashMap::new();
        {
            let st = SafeTensors::deserialize(&mmap)?;
            for (name, tensor) in st.tensors() {
                let data = tensor.data();
                let data_start = data.as_ptr() as usize - mmap.as_ptr() as usize;
                tensors.insert(
                    name,
                    TensorMeta {
                        shape: tensor.shape().to_vec(),
                        dtype: DType::from_safetensors(tensor.dtype())?,
                        data_start,
                        data_len: data.len(),
                    },
                );
            }
        }

        Ok(Self {
            path,
            mmap,
            tensors,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Names of all tensors in the file, sorted.
    #[must_use]
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }

    fn meta(&self, name: &str) -> Result<&TensorMeta> {
        self.tensors.get(name).ok_or_else(|| {
            Error::WeightNotFound(format!("{name} in {}", self.path.display()))
        })
    }

    /// # Errors
    /// Returns `WeightNotFound` if the tensor is absent.
    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.meta(name)?.shape.clone())
    }

    /// # Errors
    /// Returns `WeightNotFound` if the tensor is absent.
    pub fn dtype(&self, name: &str) -> Result<DType> {
        Ok(self.meta(name)?.dtype)
    }

    /// Raw little-endian bytes of a tensor.
    ///
    /// # Errors
    /// Returns `WeightNotFound` if the tensor is absent.
    pub fn raw(&self, name: &str) -> Result<&[u8]> {
        let meta = self.meta(name)?;
        Ok(&self.mmap[meta.data_start..meta.data_start + meta.data_len])
    }

    /// A tensor decoded to f32, with its stored shape.
    ///
    /// # Errors
    /// Returns `WeightNotFound` if the tensor is absent.
    pub fn load_f32(&self, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
        let meta = self.meta(name)?;
        let values = meta.dtype.decode_f32(self.raw(name)?)?;
        Ok((meta.shape.clone(), values))
    }
}

/// A tensor to be written: name, stored dtype, shape and encoded bytes.
pub struct EncodedTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub bytes: Vec<u8>,
}

/// Write `tensors` to a single `.safetensors` file.
///
/// # Errors
/// Returns an error if a byte buffer disagrees with its shape or the file
/// cannot be written.
pub fn write_file(path: impl AsRef<Path>, tensors: &[EncodedTensor]) -> Result<()> {
    let views = tensors
        .iter()
        .map(|t| {
            let view = TensorView::new(t.dtype.to_safetensors(), t.shape.clone(), &t.bytes)?;
            Ok((t.name.clone(), view))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::tensor::serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.safetensors");
        let tensors = vec![
            EncodedTensor {
                name: "a".into(),
                dtype: DType::F32,
                shape: vec![2, 2],
                bytes: DType::F32.encode_f32(&[1.0, 2.0, 3.0, 4.0]),
            },
            EncodedTensor {
                name: "b".into(),
                dtype: DType::BF16,
                shape: vec![3],
                bytes: DType::BF16.encode_f32(&[0.5, -1.0, 2.0]),
            },
        ];
        write_file(&path, &tensors).unwrap();

        let file = SafeTensorsFile::open(&path).unwrap();
        assert_eq!(file.tensor_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(file.dtype("b").unwrap(), DType::BF16);
        let (shape, values) = file.load_f32("a").unwrap();
        assert_eq!(shape, vec![2, 2]);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(file.load_f32("b").unwrap().1, vec![0.5, -1.0, 2.0]);
        assert!(matches!(file.shape("c"), Err(Error::WeightNotFound(_))));
    }

    #[test]
    fn test_write_rejects_ragged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let bad = vec![EncodedTensor {
            name: "a".into(),
            dtype: DType::F32,
            shape: vec![2],
            bytes: vec![0; 4],
        }];
        assert!(write_file(dir.path().join("bad.safetensors"), &bad).is_err());
    }
}
