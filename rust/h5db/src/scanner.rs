// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Parallel, filter-aware scans over one or more [`TableSource`]s.
//!
//! Opening a scan reads only metadata (and run tables). Every fault that can
//! be detected that way is raised by [`Scanner::try_into_stream`] before any
//! worker starts. The rows themselves are produced by a fixed pool of worker
//! threads that pull [`task::ScanTask`]s from a shared queue.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::{Field as ArrowField, Schema as ArrowSchema, SchemaRef};
use log::warn;
use snafu::location;
use tracing::instrument;

use h5db_core::utils::env::get_num_compute_intensive_cpus;
use h5db_core::{Error, Result, ROW_INDEX_FIELD, SOURCE_FIELD};

use crate::session::Session;
use crate::source::{OpenContext, SourceLayout, TableSource};

pub mod planner;
mod stream;
mod task;

pub use planner::{ChunkVerdict, ColumnFilter, FilterSet, Literal, Predicate};
pub use stream::{ScanStats, ScanStream};

use task::{ScanTask, TaskContext};

pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// What a scan does with a chunk whose run-sequence data is malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedChunkPolicy {
    /// Fail the scan.
    #[default]
    Abort,
    /// Log a warning and emit no rows for the chunk.
    SkipChunk,
}

/// Dataset Scanner
///
/// ```rust,ignore
/// let mut scanner = session.scan([source]);
/// scanner
///     .project(&["energy", "flag"])
///     .filter(ColumnFilter::eq("flag", 2))
///     .batch_size(4096);
/// for batch in scanner.try_into_stream()? {
///     let batch = batch?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Scanner {
    session: Session,
    sources: Vec<TableSource>,
    projection: Option<Vec<String>>,
    filters: Vec<ColumnFilter>,
    batch_size: usize,
    worker_count: Option<usize>,
    ordered: bool,
    with_row_index: bool,
    with_source_column: bool,
    skip_unsupported_columns: bool,
    malformed_chunk_policy: MalformedChunkPolicy,
    read_retries: u32,
}

/// Columns a scan reads from every source, resolved against metadata.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedColumns {
    /// Emitted columns, in output order.
    projected: Vec<ArrowField>,
    /// Filtered columns that are not projected.
    filter_only: Vec<ArrowField>,
}

impl ResolvedColumns {
    fn read_schema(&self) -> ArrowSchema {
        ArrowSchema::new(
            self.projected
                .iter()
                .chain(&self.filter_only)
                .cloned()
                .collect::<Vec<_>>(),
        )
    }

    fn names(&self) -> Vec<&str> {
        self.projected
            .iter()
            .chain(&self.filter_only)
            .map(|field| field.name().as_str())
            .collect()
    }
}

struct ScanPlan {
    layouts: Vec<SourceLayout>,
    columns: ResolvedColumns,
    filters: FilterSet,
    schema: SchemaRef,
}

impl Scanner {
    pub(crate) fn new(session: Session, sources: Vec<TableSource>) -> Self {
        Self {
            session,
            sources,
            projection: None,
            filters: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: None,
            ordered: false,
            with_row_index: false,
            with_source_column: false,
            skip_unsupported_columns: false,
            malformed_chunk_policy: MalformedChunkPolicy::default(),
            read_retries: 0,
        }
    }

    /// Projection.
    ///
    /// Only emit the specified columns, in the given order. By default every
    /// column of the sources is emitted.
    pub fn project<T: AsRef<str>>(&mut self, columns: &[T]) -> &mut Self {
        self.projection = Some(columns.iter().map(|c| c.as_ref().to_string()).collect());
        self
    }

    /// Add a filter. Filters are combined with AND and may refer to columns
    /// that are not projected.
    pub fn filter(&mut self, filter: ColumnFilter) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(&mut self, filters: impl IntoIterator<Item = ColumnFilter>) -> &mut Self {
        self.filters.extend(filters);
        self
    }

    /// Maximum number of rows per emitted batch.
    pub fn batch_size(&mut self, batch_size: usize) -> &mut Self {
        self.batch_size = batch_size;
        self
    }

    /// Number of worker threads. Defaults to `H5DB_CPU_THREADS` or the
    /// number of CPUs.
    pub fn worker_count(&mut self, workers: usize) -> &mut Self {
        self.worker_count = Some(workers);
        self
    }

    /// Emit batches in task order: sources round-robin, and chunk order
    /// within a source.
    ///
    /// By default batches are emitted as soon as a worker finishes them.
    pub fn scan_in_order(&mut self, ordered: bool) -> &mut Self {
        self.ordered = ordered;
        self
    }

    /// Emit the `_rowindex` column: the row's index within its source.
    pub fn with_row_index(&mut self) -> &mut Self {
        self.with_row_index = true;
        self
    }

    /// Emit the `_source` column: the label of the row's source.
    pub fn with_source_column(&mut self) -> &mut Self {
        self.with_source_column = true;
        self
    }

    /// Drop projected columns of unsupported type instead of failing.
    ///
    /// Filtering on such a column is still an error.
    pub fn skip_unsupported_columns(&mut self, skip: bool) -> &mut Self {
        self.skip_unsupported_columns = skip;
        self
    }

    pub fn malformed_chunk_policy(&mut self, policy: MalformedChunkPolicy) -> &mut Self {
        self.malformed_chunk_policy = policy;
        self
    }

    /// Retry a failed raw chunk read up to `retries` times.
    pub fn read_retries(&mut self, retries: u32) -> &mut Self {
        self.read_retries = retries;
        self
    }

    /// The schema of the emitted batches. Reads metadata only.
    pub fn schema(&self) -> Result<SchemaRef> {
        Ok(self.plan()?.schema)
    }

    fn output_schema(&self, columns: &ResolvedColumns) -> SchemaRef {
        let mut fields = columns.projected.clone();
        if self.with_row_index {
            fields.push(ROW_INDEX_FIELD.clone());
        }
        if self.with_source_column {
            fields.push(SOURCE_FIELD.clone());
        }
        Arc::new(ArrowSchema::new(fields))
    }

    /// Decide the projected and filtered columns of one source.
    fn resolve(&self, layout: &SourceLayout) -> Result<ResolvedColumns> {
        let find = |name: &str| {
            layout
                .columns
                .iter()
                .find(|column| column.name == name)
                .ok_or_else(|| {
                    Error::invalid_input(
                        format!("{} has no column named {}", layout.file.path(), name),
                        location!(),
                    )
                })
        };

        let names: Vec<&str> = match &self.projection {
            Some(projection) => projection.iter().map(String::as_str).collect(),
            None => layout.columns.iter().map(|c| c.name.as_str()).collect(),
        };
        let mut seen = HashSet::new();
        let mut projected = Vec::with_capacity(names.len());
        for name in names {
            if !seen.insert(name) {
                return Err(Error::invalid_input(
                    format!("column {} is projected twice", name),
                    location!(),
                ));
            }
            match &find(name)?.data_type {
                Ok(data_type) => projected.push(ArrowField::new(name, data_type.clone(), true)),
                Err(err) if self.skip_unsupported_columns => {
                    warn!(
                        "Skipping column {} of {}: {}",
                        name,
                        layout.file.path(),
                        err
                    );
                }
                Err(err) => return Err(err.clone()),
            }
        }

        let mut filter_only: Vec<ArrowField> = Vec::new();
        for filter in &self.filters {
            let name = filter.column.as_str();
            let read = projected
                .iter()
                .chain(&filter_only)
                .any(|field| field.name() == name);
            if read {
                continue;
            }
            match &find(name)?.data_type {
                Ok(data_type) => filter_only.push(ArrowField::new(name, data_type.clone(), true)),
                Err(err) => return Err(err.clone()),
            }
        }
        Ok(ResolvedColumns {
            projected,
            filter_only,
        })
    }

    /// Inspect every source and bind the filters. Reads metadata only.
    fn plan(&self) -> Result<ScanPlan> {
        if self.sources.is_empty() {
            return Err(Error::invalid_input(
                "a scan needs at least one source",
                location!(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_input(
                "batch size must be positive",
                location!(),
            ));
        }
        if self.worker_count == Some(0) {
            return Err(Error::invalid_input(
                "worker count must be positive",
                location!(),
            ));
        }

        let mut layouts = Vec::with_capacity(self.sources.len());
        let mut resolved: Option<ResolvedColumns> = None;
        for source in &self.sources {
            let layout = SourceLayout::inspect(
                self.session.store.as_ref(),
                source,
                &self.session.metadata_cache,
            )?;
            layout.rows()?;
            let columns = self.resolve(&layout)?;
            match &resolved {
                None => resolved = Some(columns),
                Some(first) if *first != columns => {
                    return Err(Error::invalid_input(
                        format!(
                            "source {} reads columns {:?} but source {} reads {:?}",
                            source.file(),
                            columns.read_schema(),
                            self.sources[0].file(),
                            first.read_schema()
                        ),
                        location!(),
                    ));
                }
                Some(_) => {}
            }
            layouts.push(layout);
        }
        let columns = resolved.ok_or_else(|| Error::internal("no sources", location!()))?;
        let filters = FilterSet::bind(&self.filters, &columns.read_schema())?;
        let schema = self.output_schema(&columns);
        Ok(ScanPlan {
            layouts,
            columns,
            filters,
            schema,
        })
    }

    /// Open the scan and start its workers.
    ///
    /// Every fault detectable from metadata and run tables is returned here,
    /// before a single row is produced.
    #[instrument(level = "debug", skip_all, fields(sources = self.sources.len()))]
    pub fn try_into_stream(&self) -> Result<ScanStream> {
        let plan = self.plan()?;
        let context = OpenContext {
            cache: &self.session.chunk_cache,
            metadata_cache: &self.session.metadata_cache,
            decoder: &self.session.decoder,
            read_retries: self.read_retries,
        };
        let needed = plan.columns.names();
        let sources = plan
            .layouts
            .iter()
            .map(|layout| layout.open(&needed, context))
            .collect::<Result<Vec<_>>>()?;

        let tasks = ScanTask::partition(&sources, self.batch_size as u64);
        let workers = self
            .worker_count
            .unwrap_or_else(get_num_compute_intensive_cpus);
        let context = TaskContext {
            sources,
            filters: plan.filters,
            projected: plan
                .columns
                .projected
                .iter()
                .map(|field| field.name().clone())
                .collect(),
            schema: plan.schema,
            batch_size: self.batch_size,
            with_row_index: self.with_row_index,
            with_source_column: self.with_source_column,
            malformed_chunk_policy: self.malformed_chunk_policy,
            stats: Arc::new(ScanStats::default()),
        };
        ScanStream::start(context, tasks, workers, self.ordered)
    }

    /// Scan and collect every batch.
    pub fn try_into_batches(&self) -> Result<Vec<RecordBatch>> {
        self.try_into_stream()?.collect()
    }

    /// Number of rows the scan produces. Only filtered columns are read.
    pub fn count_rows(&self) -> Result<u64> {
        let mut scanner = self.clone();
        scanner.projection = Some(Vec::new());
        scanner.with_row_index = false;
        scanner.with_source_column = false;
        scanner.ordered = false;
        let mut count = 0;
        for batch in scanner.try_into_stream()? {
            count += batch?.num_rows() as u64;
        }
        Ok(count)
    }
}
