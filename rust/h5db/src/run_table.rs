// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Column-level run-sequence tables.
//!
//! A run-encoded column is stored as two or three one-dimensional datasets:
//! run starts, one value per run and, optionally, run lengths. Without
//! lengths every run ends where the next one starts and the last run ends at
//! the row count of the source.
//!
//! The table is validated once when it is opened. A fault is localised to the
//! first row it can affect: chunks that end before that row are served from
//! the valid prefix of runs, chunks at or after it fail with
//! [`Error::MalformedEncoding`].

use std::ops::Range;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::UInt64Type;
use arrow_array::{Array, ArrayRef};
use arrow_schema::DataType;
use deepsize::DeepSizeOf;
use log::debug;
use snafu::location;

use h5db_core::chunk_cache::{ChunkCache, ChunkKey, DatasetLease};
use h5db_core::grid::DatasetId;
use h5db_core::{Error, Result};
use h5db_encoding::{RunSequenceDecoder, RunSequenceEncoding};

use crate::dataset::{ChunkEntry, LoadedChunk};

#[derive(Debug, Clone)]
struct RunFault {
    run_index: usize,
    /// First row whose decoding depends on the faulty run.
    row: u64,
    reason: String,
    /// Number of runs before the first faulty run.
    valid_runs: usize,
}

/// A validated run table over a row space of `num_rows` rows.
#[derive(Debug, Clone)]
pub struct RunTable {
    /// The runs before the first fault.
    encoding: RunSequenceEncoding,
    num_rows: u64,
    fault: Option<RunFault>,
    fill: Option<ArrayRef>,
}

impl DeepSizeOf for RunTable {
    fn deep_size_of_children(&self, context: &mut deepsize::Context) -> usize {
        self.encoding.deep_size_of_children(context)
            + self
                .fill
                .as_ref()
                .map(|fill| fill.get_array_memory_size())
                .unwrap_or(0)
            + self
                .fault
                .as_ref()
                .map(|fault| fault.reason.len())
                .unwrap_or(0)
    }
}

fn malformed(run_index: usize, reason: String) -> Error {
    Error::MalformedEncoding {
        column: String::new(),
        run_index,
        reason,
        location: location!(),
    }
}

/// Integer run offsets as `u64`, and the index of the first negative or null
/// entry.
fn offsets(array: &ArrayRef) -> Result<(Vec<u64>, Option<usize>)> {
    let cast = arrow_cast::cast(array.as_ref(), &DataType::UInt64)?;
    let cast = cast.as_primitive::<UInt64Type>();
    let invalid = (0..cast.len()).find(|i| cast.is_null(*i));
    let values = cast.iter().map(|v| v.unwrap_or(0)).collect();
    Ok((values, invalid))
}

fn locate_fault(
    starts: &[u64],
    lengths: &[u64],
    invalid: Option<(usize, &str)>,
    num_rows: u64,
) -> Option<RunFault> {
    let last_row = num_rows.saturating_sub(1);
    let mut previous: Option<Range<u64>> = None;
    let mut fault = None;
    for (index, (start, length)) in starts.iter().zip(lengths).enumerate() {
        let (start, length) = (*start, *length);
        let problem = match (invalid, &previous) {
            (Some((at, what)), _) if at == index => Some((0, format!("run {what} is negative"))),
            (_, Some(prev)) if start < prev.end => Some((
                start,
                format!(
                    "run starts at row {} before the previous run [{}, {}) ends",
                    start, prev.start, prev.end
                ),
            )),
            _ if length == 0 => Some((start, format!("run at row {} has zero length", start))),
            _ => match start.checked_add(length) {
                Some(end) if end <= num_rows => None,
                _ => Some((
                    start,
                    format!(
                        "run [{}, {}+{}) exceeds the logical extent of {} rows",
                        start, start, length, num_rows
                    ),
                )),
            },
        };
        if let Some((row, reason)) = problem {
            fault = Some(RunFault {
                run_index: index,
                row: row.min(last_row),
                reason,
                valid_runs: index,
            });
            break;
        }
        previous = Some(start..start + length);
    }

    // A later run that starts before the fault row is out of order as well
    if let Some(fault) = fault.as_mut() {
        for (index, start) in starts.iter().enumerate().skip(fault.run_index + 1) {
            if *start < fault.row {
                fault.row = *start;
                fault.run_index = index;
                fault.reason = format!("run starts at row {} out of order", start);
            }
        }
    }
    fault
}

impl RunTable {
    /// Validate a run table read from its datasets.
    ///
    /// Arity mismatches and tables above the decoder's run limit are fatal.
    /// Ordering and bounds faults are recorded and raised per chunk.
    pub fn try_new(
        starts: &ArrayRef,
        lengths: Option<&ArrayRef>,
        values: ArrayRef,
        num_rows: u64,
        fill: Option<ArrayRef>,
        decoder: &RunSequenceDecoder,
    ) -> Result<Self> {
        if starts.len() > decoder.max_runs() {
            return Err(malformed(
                decoder.max_runs(),
                format!(
                    "{} runs exceed the limit of {} runs",
                    starts.len(),
                    decoder.max_runs()
                ),
            ));
        }
        let (starts, invalid_start) = offsets(starts)?;
        let (encoding, invalid) = match lengths {
            Some(lengths) => {
                let (lengths, invalid_length) = offsets(lengths)?;
                let invalid = match (invalid_start, invalid_length) {
                    (Some(s), Some(l)) if l < s => Some((l, "length")),
                    (Some(s), _) => Some((s, "start")),
                    (None, Some(l)) => Some((l, "length")),
                    (None, None) => None,
                };
                (RunSequenceEncoding::try_new(starts, lengths, values)?, invalid)
            }
            None => (
                RunSequenceEncoding::from_run_starts(starts, values, num_rows)?,
                invalid_start.map(|s| (s, "start")),
            ),
        };

        let fault = locate_fault(encoding.starts(), encoding.lengths(), invalid, num_rows);
        let encoding = match &fault {
            Some(fault) => {
                debug!(
                    "Run table is malformed from row {} (run {}): {}",
                    fault.row, fault.run_index, fault.reason
                );
                let valid = fault.valid_runs;
                RunSequenceEncoding::try_new(
                    encoding.starts()[..valid].to_vec(),
                    encoding.lengths()[..valid].to_vec(),
                    encoding.values().slice(0, valid),
                )?
            }
            None => encoding,
        };
        Ok(Self {
            encoding,
            num_rows,
            fault,
            fill,
        })
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn fill(&self) -> Option<&ArrayRef> {
        self.fill.as_ref()
    }

    /// First row that cannot be decoded, if the table is malformed.
    pub fn fault_row(&self) -> Option<u64> {
        self.fault.as_ref().map(|fault| fault.row)
    }

    /// The runs covering `rows`, rebased so that `rows.start` is row 0.
    pub fn runs(&self, rows: Range<u64>) -> Result<RunSequenceEncoding> {
        if let Some(fault) = &self.fault {
            if rows.end > fault.row {
                return Err(malformed(fault.run_index, fault.reason.clone()));
            }
        }
        self.encoding.slice_rows(rows)
    }
}

/// A run-encoded column bound to the chunking of the rows it is read in.
pub struct RunColumn {
    name: String,
    id: DatasetId,
    table: Arc<RunTable>,
    decoder: RunSequenceDecoder,
    lease: DatasetLease<ChunkEntry>,
}

impl std::fmt::Debug for RunColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunColumn")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl RunColumn {
    /// `id` must identify the table and the row chunking it is read with,
    /// since decoded rows are cached per chunk index.
    pub fn new(
        name: String,
        id: DatasetId,
        table: Arc<RunTable>,
        decoder: RunSequenceDecoder,
        cache: &Arc<ChunkCache<ChunkEntry>>,
    ) -> Self {
        let lease = cache.lease(id.clone());
        Self {
            name,
            id,
            table,
            decoder,
            lease,
        }
    }

    pub fn table(&self) -> &RunTable {
        &self.table
    }

    /// Runs of one chunk of rows.
    pub fn runs(&self, rows: Range<u64>) -> Result<RunSequenceEncoding> {
        self.table
            .runs(rows)
            .map_err(|err| err.with_column(&self.name))
    }

    /// Dense values of chunk `chunk_index`, which covers `rows`.
    pub fn load_rows(&self, chunk_index: u64, rows: Range<u64>) -> Result<LoadedChunk> {
        let key = ChunkKey::new(self.id.clone(), vec![chunk_index].into());
        let mut loaded = false;
        let entry = self.lease.cache().get_or_load(&key, || {
            loaded = true;
            let len = rows.end - rows.start;
            let runs = self.runs(rows)?;
            let values = self
                .decoder
                .decode(&runs, len, self.table.fill())
                .map_err(|err| err.with_column(&self.name))?;
            let stats = runs.statistics(len, self.table.fill())?;
            Ok(ChunkEntry {
                values,
                extent: vec![len],
                stats,
            })
        })?;
        Ok(LoadedChunk {
            entry,
            from_cache: !loaded,
        })
    }
}
