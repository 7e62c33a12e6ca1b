// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Open datasets and their decoded chunks.
//!
//! A [`DatasetHandle`] turns raw chunks from the file-format library into
//! [`ChunkEntry`] values held in the session's shared [`ChunkCache`]. Raw
//! chunks always carry the nominal chunk shape; the decoded entry only keeps
//! the logical sub-block that lies inside the dataset.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::builder::StringBuilder;
use arrow_array::{make_array, Array, ArrayRef, FixedSizeListArray, UInt64Array};
use arrow_buffer::Buffer;
use arrow_data::ArrayData;
use arrow_schema::DataType;
use arrow_select::concat::concat;
use arrow_select::interleave::interleave;
use arrow_select::take::take;
use bytes::Bytes;
use deepsize::DeepSizeOf;
use log::{debug, warn};
use rand::Rng;
use snafu::location;
use tracing::instrument;

use h5db_core::cache::MetadataCache;
use h5db_core::chunk_cache::{ChunkCache, ChunkKey, DatasetLease};
use h5db_core::datatypes::ElementType;
use h5db_core::grid::{ChunkCoordinate, ChunkGrid, DatasetId};
use h5db_core::{Error, Result};
use h5db_encoding::{ChunkStatistics, CompressionScheme, GeneralBufferCompressor};
use h5db_io::{DatasetMetadata, DatasetReader, H5File};

/// Decoded payload of one chunk.
///
/// Entries are immutable once built and shared by every reader of the chunk.
#[derive(Debug)]
pub struct ChunkEntry {
    /// Logical elements of the chunk in row-major order.
    pub values: ArrayRef,
    /// Logical extent of the chunk, clipped to the dataset shape.
    pub extent: Vec<u64>,
    pub stats: ChunkStatistics,
}

impl DeepSizeOf for ChunkEntry {
    fn deep_size_of_children(&self, context: &mut deepsize::Context) -> usize {
        self.values.get_array_memory_size()
            + self.extent.deep_size_of_children(context)
            + self.stats.deep_size_of_children(context)
    }
}

impl ChunkEntry {
    pub fn num_rows(&self) -> u64 {
        self.extent.first().copied().unwrap_or(1)
    }
}

/// A chunk returned by [`DatasetHandle::load_chunk`].
#[derive(Debug, Clone)]
pub struct LoadedChunk {
    pub entry: Arc<ChunkEntry>,
    /// False when this call ran the loader.
    pub from_cache: bool,
}

/// An open dataset.
///
/// The handle holds a lease on the dataset in the chunk cache: chunks decoded
/// through any handle on the same dataset are shared, and are dropped from the
/// cache once the last handle is closed.
pub struct DatasetHandle {
    id: DatasetId,
    reader: Arc<dyn DatasetReader>,
    metadata: Arc<DatasetMetadata>,
    grid: ChunkGrid,
    lease: DatasetLease<ChunkEntry>,
    read_retries: u32,
}

impl std::fmt::Debug for DatasetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetHandle")
            .field("id", &self.id)
            .field("dtype", &self.metadata.dtype)
            .field("shape", &self.metadata.shape)
            .field("chunk_shape", &self.grid.chunk_shape())
            .finish()
    }
}

impl DatasetHandle {
    /// Open `path` in `file`. Only metadata is read.
    #[instrument(level = "debug", skip_all, fields(file = file.path(), dataset = path))]
    pub fn open(
        file: &dyn H5File,
        path: &str,
        cache: &Arc<ChunkCache<ChunkEntry>>,
        metadata_cache: &MetadataCache,
    ) -> Result<Self> {
        let reader = file.open_dataset(path)?;
        let id = DatasetId::new(file.path(), path);
        let metadata = metadata_cache.get_or_insert(&id.to_string(), |_| {
            Ok(DatasetMetadata::read(reader.as_ref()))
        })?;
        let grid = ChunkGrid::try_new(metadata.shape.clone(), metadata.effective_chunk_shape())?;
        let lease = cache.lease(id.clone());
        Ok(Self {
            id,
            reader,
            metadata,
            grid,
            lease,
            read_retries: 0,
        })
    }

    /// Retry failed raw chunk reads up to `retries` times.
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.id.path
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn dtype(&self) -> &ElementType {
        &self.metadata.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.metadata.shape
    }

    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    pub fn num_rows(&self) -> u64 {
        self.grid.num_rows()
    }

    pub fn fill_value(&self) -> Option<&ArrayRef> {
        self.metadata.fill_value.as_ref()
    }

    /// Arrow type of one row of this dataset.
    pub fn row_type(&self) -> Result<DataType> {
        self.metadata.dtype.to_arrow_for_shape(&self.metadata.shape)
    }

    /// The decoded chunk at `coordinate`, from the cache or freshly loaded.
    pub fn load_chunk(&self, coordinate: &ChunkCoordinate) -> Result<LoadedChunk> {
        let key = ChunkKey::new(self.id.clone(), coordinate.clone());
        let mut loaded = false;
        let entry = self.lease.cache().get_or_load(&key, || {
            loaded = true;
            let raw = self.read_raw_chunk(coordinate)?;
            self.decode_chunk(coordinate, raw)
        })?;
        Ok(LoadedChunk {
            entry,
            from_cache: !loaded,
        })
    }

    #[instrument(level = "debug", skip(self), fields(dataset = %self.id))]
    fn read_raw_chunk(&self, coordinate: &ChunkCoordinate) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            match self.reader.read_chunk(coordinate) {
                Ok(raw) => return Ok(raw),
                Err(err @ Error::ChunkRead { .. }) if attempt < self.read_retries => {
                    let delay = retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        "Retrying read of chunk {} of {} in {:?}: {}",
                        coordinate, self.id, delay, err
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Decompress and decode one raw chunk into its logical sub-block.
    pub fn decode_chunk(&self, coordinate: &ChunkCoordinate, raw: Bytes) -> Result<ChunkEntry> {
        let dtype = &self.metadata.dtype;
        let width = dtype.byte_width().ok_or_else(|| Error::UnsupportedType {
            column: self.id.path.clone(),
            dtype: dtype.to_string(),
            location: location!(),
        })?;
        let nominal = self.grid.nominal_chunk_len() as usize;
        let expected = nominal * width;

        let bytes = match self.metadata.compression {
            CompressionScheme::None => raw,
            scheme => {
                let mut out = Vec::with_capacity(expected);
                GeneralBufferCompressor::get_compressor(scheme)
                    .decompress(&raw, &mut out)
                    .map_err(|err| {
                        Error::corrupt_file(
                            &self.id.file,
                            format!(
                                "chunk {} of {} failed to decompress: {}",
                                coordinate, self.id.path, err
                            ),
                            location!(),
                        )
                    })?;
                Bytes::from(out)
            }
        };
        if bytes.len() != expected {
            return Err(Error::corrupt_file(
                &self.id.file,
                format!(
                    "chunk {} of {} holds {} bytes, expected {} ({} elements of {} bytes)",
                    coordinate,
                    self.id.path,
                    bytes.len(),
                    expected,
                    nominal,
                    width
                ),
                location!(),
            ));
        }

        let extent = self.grid.logical_extent(coordinate)?;
        let indices = logical_indices(self.grid.chunk_shape(), &extent);
        let values = match dtype {
            ElementType::FixedString { size } => {
                decode_strings(&bytes, *size, nominal, indices.as_deref(), &self.id)?
            }
            _ => {
                let dense = decode_primitive(&bytes, dtype.to_arrow()?, nominal)?;
                match indices {
                    Some(indices) => take(dense.as_ref(), &UInt64Array::from(indices), None)?,
                    None => dense,
                }
            }
        };
        let stats = ChunkStatistics::compute(values.as_ref())?;
        debug!(
            "Decoded chunk {} of {}: {} values, {} nulls",
            coordinate,
            self.id,
            values.len(),
            stats.null_count
        );
        Ok(ChunkEntry {
            values,
            extent,
            stats,
        })
    }

    /// Rows `rows` of the dataset as one column, loading every chunk they
    /// touch. Multi-dimensional rows become nested `FixedSizeList` values.
    pub fn read_rows(
        &self,
        rows: Range<u64>,
        mut on_load: impl FnMut(&LoadedChunk),
    ) -> Result<ArrayRef> {
        let rows = rows.start.min(self.num_rows())..rows.end.min(self.num_rows());
        let mut parts = Vec::new();
        for row_chunk in self.grid.row_chunks_for(&rows) {
            let chunk_rows = self.grid.chunk_rows(row_chunk);
            let local = rows.start.max(chunk_rows.start) - chunk_rows.start
                ..rows.end.min(chunk_rows.end) - chunk_rows.start;
            let coordinates = self.grid.coordinates_in_row_chunk(row_chunk);
            let mut entries = Vec::with_capacity(coordinates.len());
            for coordinate in &coordinates {
                let loaded = self.load_chunk(coordinate)?;
                on_load(&loaded);
                entries.push(loaded.entry);
            }
            parts.push(self.assemble(&coordinates, &entries, local)?);
        }

        let flat = match parts.len() {
            0 => arrow_array::new_empty_array(&self.metadata.dtype.to_arrow()?),
            1 => parts.remove(0),
            _ => concat(&parts.iter().map(|a| a.as_ref()).collect::<Vec<_>>())?,
        };
        nest(flat, &self.metadata.shape, self.row_type()?)
    }

    /// Flat row-major elements of rows `local` of one row of chunks.
    fn assemble(
        &self,
        coordinates: &[ChunkCoordinate],
        entries: &[Arc<ChunkEntry>],
        local: Range<u64>,
    ) -> Result<ArrayRef> {
        if entries.is_empty() {
            return Ok(arrow_array::new_empty_array(
                &self.metadata.dtype.to_arrow()?,
            ));
        }
        if let ([coordinate], [entry]) = (coordinates, entries) {
            // One chunk spans the whole row width
            if coordinate.rank() <= 1 || self.grid.grid_shape()[1..].iter().all(|n| *n == 1) {
                let width = self.grid.row_width();
                return Ok(entry.values.slice(
                    (local.start * width) as usize,
                    ((local.end - local.start) * width) as usize,
                ));
            }
        }

        let chunk_shape = self.grid.chunk_shape();
        let inner_shape = &self.metadata.shape[1..];
        let slots = coordinates
            .iter()
            .enumerate()
            .map(|(slot, c)| (c.as_slice()[1..].to_vec(), slot))
            .collect::<std::collections::HashMap<_, _>>();
        // For every element of a row: (chunk slot, offset inside the chunk row)
        let mut layout = Vec::with_capacity(self.grid.row_width() as usize);
        for_each_index(inner_shape, |index| {
            let chunk_index = index
                .iter()
                .zip(&chunk_shape[1..])
                .map(|(i, c)| i / c)
                .collect::<Vec<_>>();
            let slot = slots[&chunk_index];
            let extent = &entries[slot].extent[1..];
            let offset = index
                .iter()
                .zip(&chunk_shape[1..])
                .zip(extent)
                .fold(0, |acc, ((i, c), e)| acc * e + i % c);
            layout.push((slot, offset));
        });

        let strides = entries
            .iter()
            .map(|entry| entry.extent[1..].iter().product::<u64>())
            .collect::<Vec<_>>();
        let mut indices = Vec::with_capacity(layout.len() * (local.end - local.start) as usize);
        for row in local {
            for (slot, offset) in &layout {
                indices.push((*slot, (row * strides[*slot] + offset) as usize));
            }
        }
        let arrays = entries
            .iter()
            .map(|entry| entry.values.as_ref())
            .collect::<Vec<_>>();
        Ok(interleave(&arrays, &indices)?)
    }
}

/// Calls `f` with every multi-index inside `shape`, in row-major order.
fn for_each_index(shape: &[u64], mut f: impl FnMut(&[u64])) {
    if shape.iter().any(|extent| *extent == 0) {
        return;
    }
    let mut index = vec![0_u64; shape.len()];
    loop {
        f(&index);
        let mut dim = shape.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

/// Positions of the logical elements inside a nominal chunk, or `None` when
/// the chunk is not clipped.
fn logical_indices(chunk_shape: &[u64], extent: &[u64]) -> Option<Vec<u64>> {
    if chunk_shape == extent {
        return None;
    }
    let mut indices = Vec::with_capacity(extent.iter().product::<u64>() as usize);
    for_each_index(extent, |index| {
        let position = index
            .iter()
            .zip(chunk_shape)
            .fold(0, |acc, (i, c)| acc * c + i);
        indices.push(position);
    });
    Some(indices)
}

fn decode_primitive(bytes: &[u8], data_type: DataType, len: usize) -> Result<ArrayRef> {
    // Copy into an aligned buffer; raw chunks carry no alignment guarantee
    let buffer = Buffer::from_slice_ref(bytes);
    let data = ArrayData::builder(data_type)
        .len(len)
        .add_buffer(buffer)
        .build()?;
    Ok(make_array(data))
}

fn decode_strings(
    bytes: &[u8],
    width: usize,
    nominal: usize,
    indices: Option<&[u64]>,
    id: &DatasetId,
) -> Result<ArrayRef> {
    let count = indices.map(|i| i.len()).unwrap_or(nominal);
    let mut builder = StringBuilder::with_capacity(count, count * width);
    let mut append = |position: usize| -> Result<()> {
        let raw = &bytes[position * width..(position + 1) * width];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
        if end == 0 {
            builder.append_null();
            return Ok(());
        }
        let value = std::str::from_utf8(&raw[..end]).map_err(|err| {
            Error::corrupt_file(
                &id.file,
                format!("invalid UTF-8 in string element of {}: {}", id.path, err),
                location!(),
            )
        })?;
        builder.append_value(value);
        Ok(())
    };
    match indices {
        Some(indices) => {
            for position in indices {
                append(*position as usize)?;
            }
        }
        None => {
            for position in 0..nominal {
                append(position)?;
            }
        }
    }
    Ok(Arc::new(builder.finish()))
}

/// Wraps flat row-major elements into one value per row of `shape`.
pub(crate) fn nest(flat: ArrayRef, shape: &[u64], row_type: DataType) -> Result<ArrayRef> {
    if shape.len() <= 1 {
        return Ok(flat);
    }
    let mut types = Vec::with_capacity(shape.len() - 1);
    let mut data_type = row_type;
    while let DataType::FixedSizeList(field, size) = data_type {
        types.push((field.clone(), size));
        data_type = field.data_type().clone();
    }
    let mut values = flat;
    for (field, size) in types.into_iter().rev() {
        values = Arc::new(FixedSizeListArray::try_new(field, size, values, None)?);
    }
    Ok(values)
}

/// Delay before retry `attempt` of a chunk read: `2^attempt * 20ms` with
/// up to 10ms of jitter either way, capped at one second.
fn retry_delay(attempt: u32) -> Duration {
    const UNIT_MS: u32 = 20;
    const JITTER_MS: i32 = 10;
    const MAX_MS: u32 = 1000;

    let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
    let millis = 2u32
        .saturating_pow(attempt)
        .saturating_mul(UNIT_MS)
        .saturating_add_signed(jitter)
        .min(MAX_MS);
    Duration::from_millis(u64::from(millis))
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Float64Type, Int32Type};
    use arrow_array::{Float64Array, Int32Array, StringArray};
    use rstest::rstest;

    use h5db_io::memory::{InMemoryDataset, InMemoryFile};

    use super::*;

    fn open(dataset: InMemoryDataset, cache: &Arc<ChunkCache<ChunkEntry>>) -> DatasetHandle {
        let path = dataset.path().to_string();
        let file = InMemoryFile::new("test.h5").with_dataset(dataset);
        DatasetHandle::open(&file, &path, cache, &MetadataCache::no_cache()).unwrap()
    }

    fn cache() -> Arc<ChunkCache<ChunkEntry>> {
        Arc::new(ChunkCache::new(1 << 24))
    }

    #[rstest]
    #[case(0, 10, 30)]
    #[case(1, 30, 50)]
    #[case(3, 150, 170)]
    #[case(6, 1000, 1000)]
    #[case(40, 1000, 1000)]
    fn test_retry_delay(#[case] attempt: u32, #[case] low: u64, #[case] high: u64) {
        for _ in 0..20 {
            let delay = retry_delay(attempt).as_millis() as u64;
            assert!((low..=high).contains(&delay), "{delay}ms for attempt {attempt}");
        }
    }

    #[test]
    fn test_partial_edge_chunk() {
        let cache = cache();
        let handle = open(
            InMemoryDataset::builder("/x", Arc::new(Int32Array::from_iter_values(0..1000)))
                .chunk_shape(vec![256])
                .build()
                .unwrap(),
            &cache,
        );
        let last = handle.load_chunk(&[3].into()).unwrap();
        assert!(!last.from_cache);
        assert_eq!(last.entry.extent, vec![232]);
        assert_eq!(last.entry.values.len(), 232);
        let max = last.entry.stats.max.clone().unwrap();
        assert_eq!(max.as_primitive::<Int32Type>().value(0), 999);
        assert!(handle.load_chunk(&[3].into()).unwrap().from_cache);

        let all = handle.read_rows(0..1000, |_| {}).unwrap();
        assert_eq!(all.as_primitive::<Int32Type>().values().to_vec(), (0..1000).collect::<Vec<_>>());
    }

    #[rstest]
    #[case::whole_rows(vec![2, 4, 3])]
    #[case::split_inner(vec![3, 3, 2])]
    #[case::single_elements(vec![1, 1, 1])]
    fn test_multidimensional_rows(#[case] chunk_shape: Vec<u64>) {
        let cache = cache();
        let values = Float64Array::from_iter_values((0..60).map(|v| v as f64));
        let handle = open(
            InMemoryDataset::builder("/img", Arc::new(values))
                .shape(vec![5, 4, 3])
                .chunk_shape(chunk_shape)
                .build()
                .unwrap(),
            &cache,
        );
        let rows = handle.read_rows(1..4, |_| {}).unwrap();
        assert_eq!(rows.len(), 3);
        let rows = rows.as_fixed_size_list();
        assert_eq!(rows.value_length(), 4);
        let second = rows.value(1);
        let second = second.as_fixed_size_list();
        let cells = second.value(3);
        // Row 2, element (3, *)
        assert_eq!(
            cells.as_primitive::<Float64Type>().values().to_vec(),
            vec![33.0, 34.0, 35.0]
        );
    }

    #[test]
    fn test_fixed_strings_trim_and_null() {
        let cache = cache();
        let handle = open(
            InMemoryDataset::builder(
                "/names",
                Arc::new(StringArray::from(vec![Some("ab"), Some(""), None, Some("abcdef")])),
            )
            .string_width(4)
            .chunk_shape(vec![3])
            .build()
            .unwrap(),
            &cache,
        );
        let values = handle.read_rows(0..4, |_| {}).unwrap();
        let values = values.as_string::<i32>();
        assert_eq!(values.value(0), "ab");
        assert!(values.is_null(1));
        assert!(values.is_null(2));
        assert_eq!(values.value(3), "abcd");
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let cache = cache();
        let handle = open(
            InMemoryDataset::builder("/s", Arc::new(StringArray::from(vec!["ok", "ok"])))
                .chunk_shape(vec![2])
                .raw_chunk([0], Bytes::from_static(&[b'o', b'k', 0xff, 0xfe]))
                .build()
                .unwrap(),
            &cache,
        );
        let err = handle.load_chunk(&[0].into()).unwrap_err();
        assert!(matches!(err, Error::CorruptFile { .. }), "{err}");
    }

    #[test]
    fn test_wrong_chunk_size_is_corrupt() {
        let cache = cache();
        let handle = open(
            InMemoryDataset::builder("/x", Arc::new(Int32Array::from_iter_values(0..8)))
                .chunk_shape(vec![4])
                .raw_chunk([1], Bytes::from_static(&[0; 12]))
                .build()
                .unwrap(),
            &cache,
        );
        assert!(handle.load_chunk(&[0].into()).is_ok());
        let err = handle.load_chunk(&[1].into()).unwrap_err();
        assert!(matches!(err, Error::CorruptFile { .. }), "{err}");
        // Failures are not cached
        assert_eq!(cache.stats().entries, 1);
    }

    #[rstest]
    fn test_compressed_chunks(
        #[values(CompressionScheme::Zstd, CompressionScheme::Lz4)] scheme: CompressionScheme,
    ) {
        let cache = cache();
        let handle = open(
            InMemoryDataset::builder("/x", Arc::new(Int32Array::from_iter_values(0..100)))
                .chunk_shape(vec![30])
                .compression(scheme)
                .build()
                .unwrap(),
            &cache,
        );
        let values = handle.read_rows(25..65, |_| {}).unwrap();
        assert_eq!(
            values.as_primitive::<Int32Type>().values().to_vec(),
            (25..65).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_closing_last_handle_invalidates() {
        let cache = cache();
        let file = InMemoryFile::new("test.h5").with_dataset(
            InMemoryDataset::builder("/x", Arc::new(Int32Array::from_iter_values(0..8)))
                .chunk_shape(vec![4])
                .build()
                .unwrap(),
        );
        let metadata = MetadataCache::no_cache();
        let first = DatasetHandle::open(&file, "/x", &cache, &metadata).unwrap();
        let second = DatasetHandle::open(&file, "/x", &cache, &metadata).unwrap();
        first.load_chunk(&[0].into()).unwrap();
        drop(first);
        assert!(second.load_chunk(&[0].into()).unwrap().from_cache);
        drop(second);
        assert_eq!(cache.stats().entries, 0);
    }
}
