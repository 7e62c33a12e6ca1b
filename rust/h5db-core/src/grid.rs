// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Chunk grids, chunk coordinates and dataset identity.

use std::fmt::{self, Display, Formatter};
use std::ops::Range;

use deepsize::DeepSizeOf;
use snafu::location;

use crate::{Error, Result};

/// Identifies one dataset inside one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, DeepSizeOf)]
pub struct DatasetId {
    pub file: String,
    pub path: String,
}

impl DatasetId {
    pub fn new(file: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            path: path.into(),
        }
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.path)
    }
}

/// Position of a chunk in the chunk grid, in multiples of the chunk shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, DeepSizeOf)]
pub struct ChunkCoordinate(Vec<u64>);

impl ChunkCoordinate {
    pub fn new(components: Vec<u64>) -> Self {
        Self(components)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u64>> for ChunkCoordinate {
    fn from(value: Vec<u64>) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<[u64; N]> for ChunkCoordinate {
    fn from(value: [u64; N]) -> Self {
        Self(value.to_vec())
    }
}

impl Display for ChunkCoordinate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The regular chunk layout of one dataset.
///
/// Chunks at the upper boundary of a dimension may extend past the dataset.
/// Their *logical* extent is clipped to the dataset shape, while raw chunk
/// payloads always carry the nominal chunk shape.
#[derive(Debug, Clone, PartialEq, Eq, DeepSizeOf)]
pub struct ChunkGrid {
    shape: Vec<u64>,
    chunk_shape: Vec<u64>,
}

impl ChunkGrid {
    pub fn try_new(shape: Vec<u64>, chunk_shape: Vec<u64>) -> Result<Self> {
        if shape.len() != chunk_shape.len() {
            return Err(Error::shape_mismatch(
                format!(
                    "chunk shape {:?} has rank {} but dataset shape {:?} has rank {}",
                    chunk_shape,
                    chunk_shape.len(),
                    shape,
                    shape.len()
                ),
                location!(),
            ));
        }
        if let Some(dim) = chunk_shape.iter().position(|extent| *extent == 0) {
            return Err(Error::shape_mismatch(
                format!("chunk shape {chunk_shape:?} has a zero extent in dimension {dim}"),
                location!(),
            ));
        }
        Ok(Self { shape, chunk_shape })
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of rows, i.e. the extent of the slowest-varying dimension.
    pub fn num_rows(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Rows covered by one chunk along dimension 0.
    pub fn rows_per_chunk(&self) -> u64 {
        self.chunk_shape.first().copied().unwrap_or(1)
    }

    /// Number of elements that make up one row.
    pub fn row_width(&self) -> u64 {
        self.shape.iter().skip(1).product()
    }

    /// Number of chunks along each dimension.
    pub fn grid_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(extent, chunk)| extent.div_ceil(*chunk))
            .collect()
    }

    pub fn num_row_chunks(&self) -> u64 {
        self.grid_shape().first().copied().unwrap_or(0)
    }

    /// Number of elements in a raw (nominal, padded) chunk.
    pub fn nominal_chunk_len(&self) -> u64 {
        self.chunk_shape.iter().product()
    }

    pub fn contains(&self, coordinate: &ChunkCoordinate) -> bool {
        coordinate.rank() == self.rank()
            && coordinate
                .as_slice()
                .iter()
                .zip(self.grid_shape())
                .all(|(c, n)| *c < n)
    }

    fn check(&self, coordinate: &ChunkCoordinate) -> Result<()> {
        if self.contains(coordinate) {
            Ok(())
        } else {
            Err(Error::invalid_input(
                format!(
                    "chunk coordinate {} is outside the chunk grid {:?}",
                    coordinate,
                    self.grid_shape()
                ),
                location!(),
            ))
        }
    }

    /// Element offset of the chunk's first element in every dimension.
    pub fn chunk_origin(&self, coordinate: &ChunkCoordinate) -> Result<Vec<u64>> {
        self.check(coordinate)?;
        Ok(coordinate
            .as_slice()
            .iter()
            .zip(&self.chunk_shape)
            .map(|(c, extent)| c * extent)
            .collect())
    }

    /// Extent of the chunk clipped to the dataset boundary.
    pub fn logical_extent(&self, coordinate: &ChunkCoordinate) -> Result<Vec<u64>> {
        let origin = self.chunk_origin(coordinate)?;
        Ok(origin
            .iter()
            .zip(&self.chunk_shape)
            .zip(&self.shape)
            .map(|((start, chunk), extent)| (*chunk).min(extent - start))
            .collect())
    }

    /// Rows covered by the `index`-th chunk along dimension 0.
    pub fn chunk_rows(&self, index: u64) -> Range<u64> {
        let start = index.saturating_mul(self.rows_per_chunk()).min(self.num_rows());
        let end = start.saturating_add(self.rows_per_chunk()).min(self.num_rows());
        start..end
    }

    /// Indices of the dimension-0 chunks that intersect `rows`.
    pub fn row_chunks_for(&self, rows: &Range<u64>) -> Range<u64> {
        if rows.start >= rows.end {
            return 0..0;
        }
        let per_chunk = self.rows_per_chunk();
        rows.start / per_chunk..rows.end.div_ceil(per_chunk)
    }

    /// Every chunk coordinate whose first component is `row_chunk`, in
    /// row-major order.
    pub fn coordinates_in_row_chunk(&self, row_chunk: u64) -> Vec<ChunkCoordinate> {
        let grid = self.grid_shape();
        if grid.is_empty() || grid.iter().any(|n| *n == 0) || row_chunk >= grid[0] {
            return Vec::new();
        }
        let mut coordinates = Vec::new();
        let mut current = vec![0_u64; grid.len()];
        current[0] = row_chunk;
        loop {
            coordinates.push(ChunkCoordinate::new(current.clone()));
            // Odometer increment over dimensions 1..
            let mut dim = grid.len();
            loop {
                if dim <= 1 {
                    return coordinates;
                }
                dim -= 1;
                current[dim] += 1;
                if current[dim] < grid[dim] {
                    break;
                }
                current[dim] = 0;
            }
        }
    }
}
