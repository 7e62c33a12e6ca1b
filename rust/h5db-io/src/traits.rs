// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! The interface H5DB expects from a hierarchical file-format library.
//!
//! Every call is synchronous and may block on I/O. Implementations report
//! failures with the matching [`h5db_core::Error`] variant: `FileNotFound` and
//! `CorruptFile` from [`FileStore::open`], `DatasetNotFound` from
//! [`H5File::open_dataset`], `ChunkRead` from [`DatasetReader::read_chunk`].

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef};
use bytes::Bytes;
use deepsize::DeepSizeOf;

use h5db_core::datatypes::ElementType;
use h5db_core::grid::ChunkCoordinate;
use h5db_core::Result;
use h5db_encoding::CompressionScheme;

/// Opens files by path.
pub trait FileStore: Send + Sync + Debug {
    fn open(&self, path: &str) -> Result<Arc<dyn H5File>>;
}

/// An open hierarchical file.
pub trait H5File: Send + Sync + Debug {
    fn path(&self) -> &str;

    fn open_dataset(&self, path: &str) -> Result<Arc<dyn DatasetReader>>;

    /// Every group and dataset below the root, in depth-first order.
    fn list_objects(&self) -> Result<Vec<ObjectInfo>>;

    /// Attributes attached to the group or dataset at `object`.
    fn attributes(&self, object: &str) -> Result<Vec<Attribute>>;
}

/// An open dataset.
pub trait DatasetReader: Send + Sync + Debug {
    fn path(&self) -> &str;

    fn shape(&self) -> Vec<u64>;

    /// `None` for contiguous (unchunked) storage, which is then read as a
    /// single chunk covering the whole dataset.
    fn chunk_shape(&self) -> Option<Vec<u64>>;

    fn dtype(&self) -> ElementType;

    fn compression(&self) -> CompressionScheme {
        CompressionScheme::None
    }

    /// The declared fill value as a single-element array, if any.
    fn fill_value(&self) -> Option<ArrayRef> {
        None
    }

    /// Raw (possibly compressed) bytes of one chunk. Uncompressed, a chunk
    /// always holds the nominal chunk shape, padded at dataset boundaries.
    fn read_chunk(&self, coordinate: &ChunkCoordinate) -> Result<Bytes>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Group,
    Dataset,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group => write!(f, "group"),
            Self::Dataset => write!(f, "dataset"),
        }
    }
}

/// One entry of a file's object tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub path: String,
    pub kind: ObjectKind,
    /// Only set for datasets.
    pub dtype: Option<ElementType>,
    /// Only set for datasets.
    pub shape: Option<Vec<u64>>,
}

#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// A single-element array.
    Scalar(ArrayRef),
    /// A one-dimensional array attribute.
    Array(ArrayRef),
}

impl AttributeValue {
    pub fn values(&self) -> &ArrayRef {
        match self {
            Self::Scalar(values) | Self::Array(values) => values,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

/// Everything about a dataset that does not require reading chunk data.
#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    pub path: String,
    pub shape: Vec<u64>,
    pub chunk_shape: Option<Vec<u64>>,
    pub dtype: ElementType,
    pub compression: CompressionScheme,
    pub fill_value: Option<ArrayRef>,
}

impl DeepSizeOf for DatasetMetadata {
    fn deep_size_of_children(&self, context: &mut deepsize::Context) -> usize {
        self.path.deep_size_of_children(context)
            + self.shape.deep_size_of_children(context)
            + self.chunk_shape.deep_size_of_children(context)
            + self.dtype.deep_size_of_children(context)
            + self
                .fill_value
                .as_ref()
                .map(|f| f.get_array_memory_size())
                .unwrap_or(0)
    }
}

impl DatasetMetadata {
    pub fn read(reader: &dyn DatasetReader) -> Self {
        Self {
            path: reader.path().to_string(),
            shape: reader.shape(),
            chunk_shape: reader.chunk_shape(),
            dtype: reader.dtype(),
            compression: reader.compression(),
            fill_value: reader.fill_value(),
        }
    }

    /// The chunk shape to address the dataset with.
    ///
    /// Contiguous datasets are one chunk. Zero extents are widened to one so
    /// that the chunk grid stays well formed; such a dataset has no chunks.
    pub fn effective_chunk_shape(&self) -> Vec<u64> {
        self.chunk_shape
            .clone()
            .unwrap_or_else(|| self.shape.iter().map(|extent| (*extent).max(1)).collect())
    }
}
