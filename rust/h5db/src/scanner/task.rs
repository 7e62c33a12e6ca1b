// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

use std::collections::HashMap;
use std::iter;
use std::ops::Range;
use std::sync::Arc;

use arrow_arith::boolean::and;
use arrow_array::{
    Array, ArrayRef, BooleanArray, RecordBatch, RecordBatchOptions, StringArray, UInt64Array,
};
use arrow_schema::SchemaRef;
use arrow_select::concat::concat_batches;
use arrow_select::filter::filter_record_batch;
use log::{trace, warn};
use snafu::location;
use tracing::instrument;

use h5db_core::{Error, Result};

use super::planner::{intersect_ranges, ranges_to_mask, ChunkVerdict, FilterSet};
use super::stream::ScanStats;
use super::MalformedChunkPolicy;
use crate::dataset::LoadedChunk;
use crate::source::{ColumnReader, OpenedColumn, OpenedSource};

/// A range of dimension-0 chunks of one source's anchor column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanTask {
    /// Position of the task in the scan's global order.
    pub seq: usize,
    pub source: usize,
    pub chunks: Range<u64>,
}

impl ScanTask {
    /// Split every source into tasks of about `batch_size` rows.
    ///
    /// Tasks of different sources are interleaved round-robin so that workers
    /// advance every source at once.
    pub fn partition(sources: &[OpenedSource], batch_size: u64) -> Vec<Self> {
        let per_source = sources
            .iter()
            .map(|source| {
                let chunks_per_task = (batch_size / source.anchor.rows_per_chunk()).max(1);
                let num_chunks = if source.num_rows == 0 {
                    0
                } else {
                    source.anchor.num_row_chunks()
                };
                (0..num_chunks)
                    .step_by(chunks_per_task as usize)
                    .map(|start| start..(start + chunks_per_task).min(num_chunks))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let rounds = per_source.iter().map(Vec::len).max().unwrap_or(0);
        let mut tasks = Vec::new();
        for round in 0..rounds {
            for (source, ranges) in per_source.iter().enumerate() {
                if let Some(chunks) = ranges.get(round) {
                    tasks.push(Self {
                        seq: tasks.len(),
                        source,
                        chunks: chunks.clone(),
                    });
                }
            }
        }
        tasks
    }
}

/// Read-only state shared by the workers of a scan.
#[derive(Debug)]
pub(crate) struct TaskContext {
    pub sources: Vec<OpenedSource>,
    pub filters: FilterSet,
    /// Names of the emitted data columns, in output order.
    pub projected: Vec<String>,
    pub schema: SchemaRef,
    pub batch_size: usize,
    pub with_row_index: bool,
    pub with_source_column: bool,
    pub malformed_chunk_policy: MalformedChunkPolicy,
    pub stats: Arc<ScanStats>,
}

impl TaskContext {
    /// Scan the chunks of `task` and cut the surviving rows into batches.
    #[instrument(level = "debug", skip_all, fields(seq = task.seq, source = task.source))]
    pub fn run(&self, task: &ScanTask) -> Result<Vec<RecordBatch>> {
        let source = self.sources.get(task.source).ok_or_else(|| {
            Error::internal(
                format!("scan task refers to unknown source {}", task.source),
                location!(),
            )
        })?;
        let mut batches = Vec::new();
        for index in task.chunks.clone() {
            self.stats.record_chunk_scanned();
            match self.scan_chunk(source, index) {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(err @ Error::MalformedEncoding { .. })
                    if self.malformed_chunk_policy == MalformedChunkPolicy::SkipChunk =>
                {
                    warn!(
                        "Skipping rows {:?} of {}: {}",
                        source.anchor.chunk_rows(index),
                        source.label,
                        err
                    );
                    self.stats.record_malformed_chunk();
                }
                Err(err) => return Err(err),
            }
        }
        self.stats.record_task();

        if batches.is_empty() {
            return Ok(batches);
        }
        let batch = concat_batches(&self.schema, &batches)?;
        let mut output = Vec::with_capacity(batch.num_rows().div_ceil(self.batch_size));
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = self.batch_size.min(batch.num_rows() - offset);
            output.push(batch.slice(offset, len));
            offset += len;
        }
        self.stats.record_rows(batch.num_rows());
        Ok(output)
    }

    fn on_load(&self, loaded: &LoadedChunk) {
        self.stats.record_load(loaded.from_cache);
    }

    fn column<'a>(&self, source: &'a OpenedSource, name: &str) -> Result<&'a OpenedColumn> {
        source.column(name).ok_or_else(|| {
            Error::internal(
                format!("column {} of {} was not opened", name, source.label),
                location!(),
            )
        })
    }

    fn read_column(
        &self,
        column: &OpenedColumn,
        index: u64,
        rows: Range<u64>,
    ) -> Result<ArrayRef> {
        match &column.reader {
            ColumnReader::Dataset(handle) => handle.read_rows(rows, |loaded| self.on_load(loaded)),
            ColumnReader::RunEncoded(runs) => {
                let loaded = runs.load_rows(index, rows)?;
                self.on_load(&loaded);
                Ok(loaded.entry.values.clone())
            }
        }
    }

    /// Rows of anchor chunk `index` that pass every filter, or `None` if
    /// none do.
    ///
    /// Run-encoded filter columns are resolved first, from their runs alone.
    /// Regular filter columns are decoded next and pruned by the statistics
    /// of their chunks. Other columns are only read once both have passed.
    fn scan_chunk(&self, source: &OpenedSource, index: u64) -> Result<Option<RecordBatch>> {
        let rows = source.anchor.chunk_rows(index);
        let len = rows.end - rows.start;

        let mut selected: Option<Vec<Range<u64>>> = None;
        for name in self.filters.columns() {
            let ColumnReader::RunEncoded(column) = &self.column(source, name)?.reader else {
                continue;
            };
            let runs = column.runs(rows.clone())?;
            let fill = column.table().fill();
            let stats = runs.statistics(len, fill)?;
            if self.filters.column_verdict(name, &stats)? == ChunkVerdict::Skip {
                trace!(
                    "Skipping rows {:?} of {}: {} excludes every run",
                    rows,
                    source.label,
                    name
                );
                self.stats.record_runs_skipped(runs.num_runs());
                self.stats.record_chunk_skipped();
                return Ok(None);
            }
            let (matching, skipped) = self.filters.matching_runs(name, &runs, len, fill)?;
            self.stats.record_runs_skipped(skipped);
            let ranges = match selected {
                Some(previous) => intersect_ranges(&previous, &matching),
                None => matching,
            };
            if ranges.is_empty() {
                self.stats.record_chunk_skipped();
                return Ok(None);
            }
            selected = Some(ranges);
        }

        let mut values: HashMap<&str, ArrayRef> = HashMap::new();
        let mut residual = Vec::new();
        let mut verdict = ChunkVerdict::All;
        for name in self.filters.columns() {
            let ColumnReader::Dataset(handle) = &self.column(source, name)?.reader else {
                continue;
            };
            let mut entries = Vec::new();
            let array = handle.read_rows(rows.clone(), |loaded| {
                self.on_load(loaded);
                entries.push(loaded.entry.clone());
            })?;
            let mut column_verdict: Option<ChunkVerdict> = None;
            for entry in &entries {
                let chunk_verdict = self.filters.column_verdict(name, &entry.stats)?;
                column_verdict = Some(match column_verdict {
                    Some(previous) => previous.union(chunk_verdict),
                    None => chunk_verdict,
                });
            }
            let column_verdict = column_verdict.unwrap_or(ChunkVerdict::Partial);
            verdict = verdict.and(column_verdict);
            if verdict == ChunkVerdict::Skip {
                trace!(
                    "Skipping rows {:?} of {}: statistics of {}",
                    rows,
                    source.label,
                    name
                );
                self.stats.record_chunk_skipped();
                return Ok(None);
            }
            if column_verdict != ChunkVerdict::All {
                residual.push(name);
            }
            values.insert(name, array);
        }

        let mut mask = selected.map(|ranges| ranges_to_mask(&ranges, len));
        for name in residual {
            let matched = match values.get(name) {
                Some(array) => self.filters.evaluate(name, array)?,
                None => continue,
            };
            mask = Some(match mask {
                Some(mask) => and(&mask, &matched)?,
                None => matched,
            });
        }
        if mask.as_ref().is_some_and(|mask| mask.true_count() == 0) {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for name in &self.projected {
            let array = match values.remove(name.as_str()) {
                Some(array) => array,
                None => self.read_column(self.column(source, name)?, index, rows.clone())?,
            };
            columns.push(array);
        }
        if self.with_row_index {
            columns.push(Arc::new(UInt64Array::from_iter_values(rows.clone())));
        }
        if self.with_source_column {
            columns.push(Arc::new(StringArray::from_iter_values(
                iter::repeat(source.label.as_str()).take(len as usize),
            )));
        }
        let options = RecordBatchOptions::new().with_row_count(Some(len as usize));
        let batch = RecordBatch::try_new_with_options(self.schema.clone(), columns, &options)?;
        Ok(Some(match mask {
            Some(mask) => filter(&batch, &mask)?,
            None => batch,
        }))
    }
}

fn filter(batch: &RecordBatch, mask: &BooleanArray) -> Result<RecordBatch> {
    if mask.true_count() == mask.len() {
        return Ok(batch.clone());
    }
    Ok(filter_record_batch(batch, mask)?)
}
