// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! An in-memory [`FileStore`].
//!
//! Datasets are built from Arrow arrays and stored the way a chunked file
//! stores them: split into nominal chunks in row-major order, padded at the
//! dataset boundary and optionally compressed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use arrow_array::cast::AsArray;
use arrow_array::{Array, ArrayRef};
use arrow_buffer::Buffer;
use bytes::Bytes;
use snafu::location;

use h5db_core::datatypes::ElementType;
use h5db_core::grid::{ChunkCoordinate, ChunkGrid};
use h5db_core::{Error, Result};
use h5db_encoding::{CompressionScheme, GeneralBufferCompressor};

use crate::traits::{
    Attribute, AttributeValue, DatasetMetadata, DatasetReader, FileStore, H5File, ObjectInfo,
    ObjectKind,
};

#[derive(Debug, Clone)]
enum FileEntry {
    File(Arc<InMemoryFile>),
    Corrupt(String),
}

/// Files held in memory, addressed by path.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    files: RwLock<HashMap<String, FileEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, file: InMemoryFile) {
        let mut files = self
            .files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        files.insert(file.path.clone(), FileEntry::File(Arc::new(file)));
    }

    /// Register a path that exists but cannot be opened.
    pub fn add_corrupt_file(&self, path: impl Into<String>, message: impl Into<String>) {
        let mut files = self
            .files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        files.insert(path.into(), FileEntry::Corrupt(message.into()));
    }
}

impl FileStore for InMemoryStore {
    fn open(&self, path: &str) -> Result<Arc<dyn H5File>> {
        let files = self
            .files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match files.get(path) {
            Some(FileEntry::File(file)) => Ok(file.clone()),
            Some(FileEntry::Corrupt(message)) => {
                Err(Error::corrupt_file(path, message.clone(), location!()))
            }
            None => Err(Error::FileNotFound {
                path: path.to_string(),
                location: location!(),
            }),
        }
    }
}

/// Parent groups of a slash separated object path, outermost first.
fn parent_groups(path: &str) -> Vec<String> {
    let mut groups = Vec::new();
    let mut prefix = String::new();
    let parts = path.trim_matches('/').split('/').collect::<Vec<_>>();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        prefix.push('/');
        prefix.push_str(part);
        groups.push(prefix.clone());
    }
    groups
}

/// A file held in memory.
#[derive(Debug)]
pub struct InMemoryFile {
    path: String,
    groups: BTreeSet<String>,
    datasets: BTreeMap<String, Arc<InMemoryDataset>>,
    attributes: HashMap<String, Vec<Attribute>>,
}

impl InMemoryFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            groups: BTreeSet::new(),
            datasets: BTreeMap::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_group(mut self, path: &str) -> Self {
        self.groups.extend(parent_groups(path));
        self.groups.insert(format!("/{}", path.trim_matches('/')));
        self
    }

    pub fn with_dataset(mut self, dataset: InMemoryDataset) -> Self {
        self.groups.extend(parent_groups(&dataset.path));
        self.datasets
            .insert(dataset.path.clone(), Arc::new(dataset));
        self
    }

    /// Attach an attribute to the root ("/"), a group or a dataset.
    pub fn with_attribute(
        mut self,
        object: &str,
        name: impl Into<String>,
        value: AttributeValue,
    ) -> Self {
        self.attributes
            .entry(object.to_string())
            .or_default()
            .push(Attribute {
                name: name.into(),
                value,
            });
        self
    }

    fn object_exists(&self, object: &str) -> bool {
        object == "/" || self.groups.contains(object) || self.datasets.contains_key(object)
    }
}

impl H5File for InMemoryFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn open_dataset(&self, path: &str) -> Result<Arc<dyn DatasetReader>> {
        match self.datasets.get(path) {
            Some(dataset) => Ok(dataset.clone()),
            None => Err(Error::DatasetNotFound {
                path: self.path.clone(),
                dataset: path.to_string(),
                location: location!(),
            }),
        }
    }

    fn list_objects(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects = self
            .groups
            .iter()
            .map(|path| ObjectInfo {
                path: path.clone(),
                kind: ObjectKind::Group,
                dtype: None,
                shape: None,
            })
            .chain(self.datasets.values().map(|dataset| ObjectInfo {
                path: dataset.path.clone(),
                kind: ObjectKind::Dataset,
                dtype: Some(dataset.metadata.dtype.clone()),
                shape: Some(dataset.metadata.shape.clone()),
            }))
            .collect::<Vec<_>>();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    fn attributes(&self, object: &str) -> Result<Vec<Attribute>> {
        if !self.object_exists(object) {
            return Err(Error::DatasetNotFound {
                path: self.path.clone(),
                dataset: object.to_string(),
                location: location!(),
            });
        }
        Ok(self.attributes.get(object).cloned().unwrap_or_default())
    }
}

/// A dataset held in memory as raw chunks.
#[derive(Debug)]
pub struct InMemoryDataset {
    path: String,
    metadata: DatasetMetadata,
    chunks: HashMap<ChunkCoordinate, Bytes>,
}

impl InMemoryDataset {
    pub fn builder(path: impl Into<String>, values: ArrayRef) -> DatasetBuilder {
        DatasetBuilder::new(path, values)
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl DatasetReader for InMemoryDataset {
    fn path(&self) -> &str {
        &self.path
    }

    fn shape(&self) -> Vec<u64> {
        self.metadata.shape.clone()
    }

    fn chunk_shape(&self) -> Option<Vec<u64>> {
        self.metadata.chunk_shape.clone()
    }

    fn dtype(&self) -> ElementType {
        self.metadata.dtype.clone()
    }

    fn compression(&self) -> CompressionScheme {
        self.metadata.compression
    }

    fn fill_value(&self) -> Option<ArrayRef> {
        self.metadata.fill_value.clone()
    }

    fn read_chunk(&self, coordinate: &ChunkCoordinate) -> Result<Bytes> {
        self.chunks
            .get(coordinate)
            .cloned()
            .ok_or_else(|| Error::ChunkRead {
                dataset: self.path.clone(),
                coordinate: coordinate.to_string(),
                message: "chunk is not allocated".to_string(),
                location: location!(),
            })
    }
}

/// Builds an [`InMemoryDataset`] from row-major values.
#[derive(Debug)]
pub struct DatasetBuilder {
    path: String,
    values: ArrayRef,
    shape: Option<Vec<u64>>,
    chunk_shape: Option<Vec<u64>>,
    compression: CompressionScheme,
    fill_value: Option<ArrayRef>,
    dtype: Option<ElementType>,
    string_width: Option<usize>,
    raw_chunks: Vec<(ChunkCoordinate, Bytes)>,
}

impl DatasetBuilder {
    pub fn new(path: impl Into<String>, values: ArrayRef) -> Self {
        Self {
            path: path.into(),
            values,
            shape: None,
            chunk_shape: None,
            compression: CompressionScheme::None,
            fill_value: None,
            dtype: None,
            string_width: None,
            raw_chunks: Vec::new(),
        }
    }

    /// Dataset shape; defaults to one dimension of `values.len()`.
    pub fn shape(mut self, shape: Vec<u64>) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Chunk shape; defaults to contiguous storage.
    pub fn chunk_shape(mut self, chunk_shape: Vec<u64>) -> Self {
        self.chunk_shape = Some(chunk_shape);
        self
    }

    pub fn compression(mut self, compression: CompressionScheme) -> Self {
        self.compression = compression;
        self
    }

    pub fn fill_value(mut self, fill_value: ArrayRef) -> Self {
        self.fill_value = Some(fill_value);
        self
    }

    /// Report `dtype` instead of the type derived from the values. An
    /// unsupported type stores no chunks.
    pub fn dtype(mut self, dtype: ElementType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Byte width of fixed-length strings; defaults to the longest value.
    pub fn string_width(mut self, width: usize) -> Self {
        self.string_width = Some(width);
        self
    }

    /// Replace the stored bytes of one chunk, e.g. to simulate corruption.
    pub fn raw_chunk(mut self, coordinate: impl Into<ChunkCoordinate>, bytes: Bytes) -> Self {
        self.raw_chunks.push((coordinate.into(), bytes));
        self
    }

    fn derive_dtype(&self) -> Result<ElementType> {
        if let Some(dtype) = &self.dtype {
            return Ok(dtype.clone());
        }
        if let Some(strings) = self.values.as_string_opt::<i32>() {
            let longest = strings
                .iter()
                .map(|s| s.map(str::len).unwrap_or(0))
                .max()
                .unwrap_or(0);
            let size = self.string_width.unwrap_or(longest).max(1);
            return Ok(ElementType::FixedString { size });
        }
        ElementType::try_from(self.values.data_type())
    }

    pub fn build(self) -> Result<InMemoryDataset> {
        let dtype = self.derive_dtype()?;
        let shape = self
            .shape
            .clone()
            .unwrap_or_else(|| vec![self.values.len() as u64]);
        let metadata = DatasetMetadata {
            path: self.path.clone(),
            shape: shape.clone(),
            chunk_shape: self.chunk_shape.clone(),
            dtype: dtype.clone(),
            compression: self.compression,
            fill_value: self.fill_value.clone(),
        };

        let mut chunks = HashMap::new();
        if let Some(width) = dtype.byte_width() {
            let expected = shape.iter().product::<u64>();
            if self.values.len() as u64 != expected {
                return Err(Error::invalid_input(
                    format!(
                        "dataset {} has shape {:?} ({} elements) but {} values were given",
                        self.path,
                        shape,
                        expected,
                        self.values.len()
                    ),
                    location!(),
                ));
            }
            let writer = ElementWriter::try_new(&self.values, &dtype, width)?;
            let compressor = GeneralBufferCompressor::get_compressor(self.compression);
            if shape.is_empty() {
                let mut raw = Vec::with_capacity(width);
                writer.write(0, &mut raw);
                let mut stored = Vec::new();
                compressor.compress(&raw, &mut stored)?;
                chunks.insert(ChunkCoordinate::new(Vec::new()), Bytes::from(stored));
            } else {
                let grid = ChunkGrid::try_new(shape.clone(), metadata.effective_chunk_shape())?;
                for row_chunk in 0..grid.num_row_chunks() {
                    for coordinate in grid.coordinates_in_row_chunk(row_chunk) {
                        let raw = encode_chunk(&grid, &coordinate, &writer, width)?;
                        let mut stored = Vec::with_capacity(raw.len());
                        compressor.compress(&raw, &mut stored)?;
                        chunks.insert(coordinate, Bytes::from(stored));
                    }
                }
            }
        }
        for (coordinate, bytes) in self.raw_chunks {
            chunks.insert(coordinate, bytes);
        }

        Ok(InMemoryDataset {
            path: self.path,
            metadata,
            chunks,
        })
    }
}

/// Writes one element of the source array as raw little-endian bytes.
struct ElementWriter<'a> {
    values: &'a ArrayRef,
    width: usize,
    /// Values buffer and element offset of a primitive array.
    primitive: Option<(Buffer, usize)>,
}

impl<'a> ElementWriter<'a> {
    fn try_new(values: &'a ArrayRef, dtype: &ElementType, width: usize) -> Result<Self> {
        let string = matches!(dtype, ElementType::FixedString { .. });
        let compatible = if string {
            values.as_string_opt::<i32>().is_some()
        } else {
            values.data_type().primitive_width() == Some(width)
        };
        if !compatible {
            return Err(Error::invalid_input(
                format!(
                    "values of type {} cannot be stored as {}",
                    values.data_type(),
                    dtype
                ),
                location!(),
            ));
        }
        let primitive = if string {
            None
        } else {
            let data = values.to_data();
            data.buffers()
                .first()
                .cloned()
                .map(|buffer| (buffer, data.offset()))
        };
        Ok(Self {
            values,
            width,
            primitive,
        })
    }

    fn write(&self, index: usize, out: &mut Vec<u8>) {
        if let Some((buffer, offset)) = &self.primitive {
            let start = (offset + index) * self.width;
            out.extend_from_slice(&buffer.as_slice()[start..start + self.width]);
        } else {
            let strings = self.values.as_string::<i32>();
            let bytes = if strings.is_valid(index) {
                strings.value(index).as_bytes()
            } else {
                &[]
            };
            let take = bytes.len().min(self.width);
            out.extend_from_slice(&bytes[..take]);
            out.resize(out.len() + self.width - take, 0);
        }
    }

    fn pad(&self, out: &mut Vec<u8>) {
        out.resize(out.len() + self.width, 0);
    }
}

/// Raw bytes of one nominal chunk in row-major order.
fn encode_chunk(
    grid: &ChunkGrid,
    coordinate: &ChunkCoordinate,
    writer: &ElementWriter,
    width: usize,
) -> Result<Vec<u8>> {
    let origin = grid.chunk_origin(coordinate)?;
    let chunk_shape = grid.chunk_shape();
    let shape = grid.shape();
    let mut out = Vec::with_capacity(grid.nominal_chunk_len() as usize * width);
    let mut local = vec![0_u64; chunk_shape.len()];
    loop {
        let global = origin
            .iter()
            .zip(&local)
            .map(|(o, l)| o + l)
            .collect::<Vec<_>>();
        if global.iter().zip(shape).all(|(g, extent)| g < extent) {
            let index = global
                .iter()
                .zip(shape)
                .fold(0_u64, |acc, (g, extent)| acc * extent + g);
            writer.write(index as usize, &mut out);
        } else {
            writer.pad(&mut out);
        }
        let mut dim = local.len();
        loop {
            if dim == 0 {
                return Ok(out);
            }
            dim -= 1;
            local[dim] += 1;
            if local[dim] < chunk_shape[dim] {
                break;
            }
            local[dim] = 0;
        }
    }
}
