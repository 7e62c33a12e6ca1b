// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Per-chunk summary statistics used for pruning.
//!
//! Statistics are computed once, when a chunk is decoded (or, for run-sequence
//! columns, from the runs alone), and are never updated afterwards.

use std::cmp::Ordering;

use arrow_array::{Array, ArrayRef};
use arrow_ord::ord::make_comparator;
use arrow_schema::{DataType, SortOptions};
use arrow_select::concat::concat;
use deepsize::DeepSizeOf;

use h5db_core::Result;

/// Min/max/null summary of the values of one chunk.
///
/// `min` and `max` are single-element arrays of the column's type; they are
/// `None` when the chunk holds no non-null values or when the type has no
/// ordering we prune on (nested list columns).
#[derive(Debug, Clone)]
pub struct ChunkStatistics {
    pub min: Option<ArrayRef>,
    pub max: Option<ArrayRef>,
    pub null_count: u64,
    pub row_count: u64,
    /// Number of runs when the chunk came from a run-sequence encoding.
    pub run_count: Option<u64>,
}

impl DeepSizeOf for ChunkStatistics {
    fn deep_size_of_children(&self, _context: &mut deepsize::Context) -> usize {
        self.min
            .iter()
            .chain(self.max.iter())
            .map(|a| a.get_array_memory_size())
            .sum()
    }
}

fn is_orderable(data_type: &DataType) -> bool {
    data_type.is_primitive() || matches!(data_type, DataType::Utf8 | DataType::LargeUtf8)
}

/// Position of the smallest and largest non-null value in `array`.
fn arg_min_max(array: &dyn Array) -> Result<Option<(usize, usize)>> {
    let comparator = make_comparator(array, array, SortOptions::default())?;
    let mut valid = (0..array.len()).filter(|i| array.is_valid(*i));
    let Some(first) = valid.next() else {
        return Ok(None);
    };
    let (mut min, mut max) = (first, first);
    for i in valid {
        if comparator(i, min) == Ordering::Less {
            min = i;
        }
        if comparator(i, max) == Ordering::Greater {
            max = i;
        }
    }
    Ok(Some((min, max)))
}

impl ChunkStatistics {
    /// Statistics of a dense array of decoded values.
    pub fn compute(array: &dyn Array) -> Result<Self> {
        let (min, max) = if is_orderable(array.data_type()) {
            match arg_min_max(array)? {
                Some((min, max)) => {
                    let data = array.to_data();
                    let min = arrow_array::make_array(data.slice(min, 1));
                    let max = arrow_array::make_array(data.slice(max, 1));
                    (Some(min), Some(max))
                }
                None => (None, None),
            }
        } else {
            (None, None)
        };
        Ok(Self {
            min,
            max,
            null_count: array.null_count() as u64,
            row_count: array.len() as u64,
            run_count: None,
        })
    }

    /// Statistics of a run-sequence encoded range without expanding it.
    ///
    /// `values` holds one value per run and `lengths` the number of rows each
    /// run covers. `gap_rows` rows are not covered by any run and take `fill`
    /// (or null if there is no fill value).
    pub fn from_runs(
        values: &ArrayRef,
        lengths: &[u64],
        gap_rows: u64,
        fill: Option<&ArrayRef>,
    ) -> Result<Self> {
        let run_count = lengths.len() as u64;
        let covered = lengths.iter().sum::<u64>();
        let mut null_count = lengths
            .iter()
            .enumerate()
            .filter(|(i, _)| values.is_null(*i))
            .map(|(_, len)| *len)
            .sum::<u64>();

        let candidates = match fill {
            Some(fill) if gap_rows > 0 => {
                if fill.is_null(0) {
                    null_count += gap_rows;
                }
                concat(&[values.as_ref(), fill.as_ref()])?
            }
            _ => {
                null_count += gap_rows;
                values.clone()
            }
        };
        let stats = Self::compute(candidates.as_ref())?;
        Ok(Self {
            null_count,
            row_count: covered + gap_rows,
            run_count: Some(run_count),
            ..stats
        })
    }

    pub fn all_null(&self) -> bool {
        self.null_count == self.row_count
    }
}
