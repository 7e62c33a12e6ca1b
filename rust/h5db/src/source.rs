// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Table sources: a file plus the columns read from it.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::ArrayRef;
use arrow_schema::DataType;
use log::debug;
use snafu::location;
use tracing::instrument;

use h5db_core::cache::MetadataCache;
use h5db_core::chunk_cache::ChunkCache;
use h5db_core::grid::{ChunkGrid, DatasetId};
use h5db_core::{Error, Result};
use h5db_encoding::RunSequenceDecoder;
use h5db_io::{DatasetMetadata, FileStore, H5File};

use crate::dataset::{ChunkEntry, DatasetHandle};
use crate::run_table::{RunColumn, RunTable};

/// One column of a [`TableSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSpec {
    /// A regular dataset. Its first dimension is the row dimension.
    Dataset { path: String, alias: Option<String> },
    /// A run-sequence encoded column stored as a table of runs.
    ///
    /// Without `run_lengths` every run ends where the next one starts and
    /// the last run ends at the row count of the source.
    RunEncoded {
        run_starts: String,
        values: String,
        run_lengths: Option<String>,
        alias: Option<String>,
    },
}

impl ColumnSpec {
    pub fn dataset(path: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            alias: None,
        }
    }

    pub fn run_encoded(run_starts: impl Into<String>, values: impl Into<String>) -> Self {
        Self::RunEncoded {
            run_starts: run_starts.into(),
            values: values.into(),
            run_lengths: None,
            alias: None,
        }
    }

    /// Read explicit run lengths from `path`. Ignored for regular datasets.
    pub fn with_run_lengths(self, path: impl Into<String>) -> Self {
        match self {
            Self::RunEncoded {
                run_starts,
                values,
                alias,
                ..
            } => Self::RunEncoded {
                run_starts,
                values,
                run_lengths: Some(path.into()),
                alias,
            },
            other => other,
        }
    }

    pub fn with_alias(self, name: impl Into<String>) -> Self {
        let name = Some(name.into());
        match self {
            Self::Dataset { path, .. } => Self::Dataset { path, alias: name },
            Self::RunEncoded {
                run_starts,
                values,
                run_lengths,
                ..
            } => Self::RunEncoded {
                run_starts,
                values,
                run_lengths,
                alias: name,
            },
        }
    }

    /// The dataset holding the column's values.
    pub fn values_path(&self) -> &str {
        match self {
            Self::Dataset { path, .. } => path,
            Self::RunEncoded { values, .. } => values,
        }
    }

    pub fn is_run_encoded(&self) -> bool {
        matches!(self, Self::RunEncoded { .. })
    }

    /// The alias, or the last component of the values path, or `data`.
    pub fn name(&self) -> String {
        let alias = match self {
            Self::Dataset { alias, .. } | Self::RunEncoded { alias, .. } => alias,
        };
        if let Some(alias) = alias {
            return alias.clone();
        }
        match self.values_path().trim_end_matches('/').rsplit('/').next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => "data".to_string(),
        }
    }
}

/// A file and the columns that make up its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSource {
    file: String,
    columns: Vec<ColumnSpec>,
    label: Option<String>,
}

impl TableSource {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            columns: Vec::new(),
            label: None,
        }
    }

    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_columns(mut self, columns: impl IntoIterator<Item = ColumnSpec>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Value of the `_source` column for rows of this source. Defaults to
    /// the file path.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.file)
    }
}

fn read_metadata(
    file: &dyn H5File,
    path: &str,
    metadata_cache: &MetadataCache,
) -> Result<Arc<DatasetMetadata>> {
    let key = format!("{}:{}", file.path(), path);
    metadata_cache.get_or_insert(&key, |_| {
        let reader = file.open_dataset(path)?;
        Ok(DatasetMetadata::read(reader.as_ref()))
    })
}

/// A column of a source as described by metadata alone.
#[derive(Debug, Clone)]
pub(crate) struct ColumnLayout {
    pub name: String,
    pub spec: ColumnSpec,
    /// Metadata of the values dataset.
    pub metadata: Arc<DatasetMetadata>,
    /// Arrow type of one row, or why there is none.
    pub data_type: Result<DataType>,
}

/// Every column of a source, described without reading chunk data.
#[derive(Debug, Clone)]
pub(crate) struct SourceLayout {
    pub file: Arc<dyn H5File>,
    pub label: String,
    pub columns: Vec<ColumnLayout>,
}

fn unsupported(column: &str, dtype: String) -> Error {
    Error::UnsupportedType {
        column: column.to_string(),
        dtype,
        location: location!(),
    }
}

impl SourceLayout {
    /// Open the file and read the metadata of every column.
    ///
    /// Fails if the file or a dataset cannot be opened or if two columns
    /// share a name. Unsupported column types are recorded per column.
    pub fn inspect(
        store: &dyn FileStore,
        source: &TableSource,
        metadata_cache: &MetadataCache,
    ) -> Result<Self> {
        let file = store.open(source.file())?;
        let mut names = HashSet::new();
        let mut columns = Vec::with_capacity(source.columns().len());
        for spec in source.columns() {
            let name = spec.name();
            if !names.insert(name.clone()) {
                return Err(Error::invalid_input(
                    format!("column name {} is used twice in {}", name, source.file()),
                    location!(),
                ));
            }
            let metadata = read_metadata(file.as_ref(), spec.values_path(), metadata_cache)?;
            let data_type = match spec {
                ColumnSpec::Dataset { .. } => metadata
                    .dtype
                    .to_arrow_for_shape(&metadata.shape)
                    .map_err(|err| err.with_column(&name)),
                ColumnSpec::RunEncoded {
                    run_starts,
                    run_lengths,
                    ..
                } => {
                    let mut data_type = Ok(());
                    for path in std::iter::once(run_starts).chain(run_lengths) {
                        let offsets = read_metadata(file.as_ref(), path, metadata_cache)?;
                        if !offsets.dtype.is_integer() {
                            let dtype = format!("run offsets of type {}", offsets.dtype);
                            data_type = Err(unsupported(&name, dtype));
                            break;
                        }
                    }
                    if data_type.is_ok() && metadata.shape.len() != 1 {
                        let dtype = format!("{}-dimensional run values", metadata.shape.len());
                        data_type = Err(unsupported(&name, dtype));
                    }
                    data_type.and_then(|_| {
                        metadata
                            .dtype
                            .to_arrow()
                            .map_err(|err| err.with_column(&name))
                    })
                }
            };
            columns.push(ColumnLayout {
                name,
                spec: spec.clone(),
                metadata,
                data_type,
            });
        }
        Ok(Self {
            file,
            label: source.label().to_string(),
            columns,
        })
    }

    /// The anchor column and the number of rows of the source.
    ///
    /// The anchor is the first regular dataset column. Every regular column
    /// must have at least one dimension, no empty non-row dimension and the
    /// same row count as the anchor.
    pub fn rows(&self) -> Result<(usize, u64)> {
        let mut anchor: Option<(usize, u64)> = None;
        for (index, column) in self.columns.iter().enumerate() {
            if column.spec.is_run_encoded() {
                continue;
            }
            let shape = &column.metadata.shape;
            let Some(rows) = shape.first().copied() else {
                return Err(Error::shape_mismatch(
                    format!(
                        "column {} is a scalar dataset and has no row dimension",
                        column.name
                    ),
                    location!(),
                ));
            };
            if rows > 0 && shape.iter().skip(1).any(|extent| *extent == 0) {
                return Err(Error::shape_mismatch(
                    format!(
                        "column {} has shape {:?}: {} rows of zero elements",
                        column.name, shape, rows
                    ),
                    location!(),
                ));
            }
            match anchor {
                None => anchor = Some((index, rows)),
                Some((anchor_index, anchor_rows)) if anchor_rows != rows => {
                    return Err(Error::shape_mismatch(
                        format!(
                            "column {} has {} rows but column {} has {}",
                            column.name, rows, self.columns[anchor_index].name, anchor_rows
                        ),
                        location!(),
                    ));
                }
                Some(_) => {}
            }
        }
        anchor.ok_or_else(|| {
            Error::invalid_input(
                format!(
                    "{} needs at least one regular dataset column to define its rows",
                    self.file.path()
                ),
                location!(),
            )
        })
    }
}

/// How a needed column is read during a scan.
#[derive(Debug)]
pub(crate) enum ColumnReader {
    Dataset(DatasetHandle),
    RunEncoded(RunColumn),
}

#[derive(Debug)]
pub(crate) struct OpenedColumn {
    pub name: String,
    pub reader: ColumnReader,
}

/// A source whose needed columns are open and validated.
#[derive(Debug)]
pub(crate) struct OpenedSource {
    pub label: String,
    pub num_rows: u64,
    /// Chunking of the anchor column. Scan tasks are ranges of its
    /// dimension-0 chunks.
    pub anchor: ChunkGrid,
    pub columns: Vec<OpenedColumn>,
}

impl OpenedSource {
    pub fn column(&self, name: &str) -> Option<&OpenedColumn> {
        self.columns.iter().find(|column| column.name == name)
    }
}

/// Everything opening a column needs from the session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenContext<'a> {
    pub cache: &'a Arc<ChunkCache<ChunkEntry>>,
    pub metadata_cache: &'a MetadataCache,
    pub decoder: &'a RunSequenceDecoder,
    pub read_retries: u32,
}

impl OpenContext<'_> {
    fn open_dataset(&self, file: &dyn H5File, path: &str) -> Result<DatasetHandle> {
        Ok(DatasetHandle::open(file, path, self.cache, self.metadata_cache)?
            .with_read_retries(self.read_retries))
    }

    fn read_all(&self, file: &dyn H5File, path: &str) -> Result<(ArrayRef, DatasetHandle)> {
        let handle = self.open_dataset(file, path)?;
        let values = handle.read_rows(0..handle.num_rows(), |_| {})?;
        Ok((values, handle))
    }
}

impl SourceLayout {
    /// Open the columns named in `needed`.
    ///
    /// Run tables are read in full and validated here; arity and size faults
    /// fail the open while ordering faults are raised by the chunks they
    /// affect.
    #[instrument(level = "debug", skip_all, fields(file = self.file.path()))]
    pub fn open(&self, needed: &[&str], context: OpenContext<'_>) -> Result<OpenedSource> {
        let (anchor_index, num_rows) = self.rows()?;
        let anchor_metadata = &self.columns[anchor_index].metadata;
        let anchor = ChunkGrid::try_new(
            anchor_metadata.shape.clone(),
            anchor_metadata.effective_chunk_shape(),
        )?;

        let file = self.file.as_ref();
        let mut columns = Vec::with_capacity(needed.len());
        for column in self.columns.iter().filter(|c| needed.contains(&c.name.as_str())) {
            if let Err(err) = &column.data_type {
                return Err(err.clone());
            }
            let reader = match &column.spec {
                ColumnSpec::Dataset { path, .. } => {
                    ColumnReader::Dataset(context.open_dataset(file, path)?)
                }
                ColumnSpec::RunEncoded {
                    run_starts,
                    values,
                    run_lengths,
                    ..
                } => {
                    // Decoded rows depend on the row count as well as the run table.
                    let table_path = format!(
                        "{}#runs({}, {})/{}",
                        values,
                        run_starts,
                        run_lengths.as_deref().unwrap_or("-"),
                        num_rows
                    );
                    let key = format!("{}:{}", file.path(), table_path);
                    let table = context
                        .metadata_cache
                        .get_or_insert(&key, |_| {
                            let (starts, _) = context.read_all(file, run_starts)?;
                            let lengths = run_lengths
                                .as_deref()
                                .map(|path| context.read_all(file, path))
                                .transpose()?
                                .map(|(lengths, _)| lengths);
                            let (values, handle) = context.read_all(file, values)?;
                            RunTable::try_new(
                                &starts,
                                lengths.as_ref(),
                                values,
                                num_rows,
                                handle.fill_value().cloned(),
                                context.decoder,
                            )
                        })
                        .map_err(|err| err.with_column(&column.name))?;
                    let id = DatasetId::new(
                        file.path(),
                        format!("{}/{}", table_path, anchor.rows_per_chunk()),
                    );
                    ColumnReader::RunEncoded(RunColumn::new(
                        column.name.clone(),
                        id,
                        table,
                        *context.decoder,
                        context.cache,
                    ))
                }
            };
            columns.push(OpenedColumn {
                name: column.name.clone(),
                reader,
            });
        }
        debug!(
            "Opened {} of {} columns of {} ({} rows, {} row chunks)",
            columns.len(),
            self.columns.len(),
            file.path(),
            num_rows,
            anchor.num_row_chunks()
        );
        Ok(OpenedSource {
            label: self.label.clone(),
            num_rows,
            anchor,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Float32Array, Int32Array, Int64Array};
    use rstest::rstest;

    use h5db_io::memory::{InMemoryDataset, InMemoryFile, InMemoryStore};

    use super::*;

    #[rstest]
    #[case(ColumnSpec::dataset("/entry/energy"), "energy")]
    #[case(ColumnSpec::dataset("/"), "data")]
    #[case(ColumnSpec::dataset("/energy").with_alias("e"), "e")]
    #[case(ColumnSpec::run_encoded("/flags/starts", "/flags/values"), "values")]
    fn test_column_names(#[case] spec: ColumnSpec, #[case] expected: &str) {
        assert_eq!(spec.name(), expected);
    }

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.add_file(
            InMemoryFile::new("f.h5")
                .with_dataset(
                    InMemoryDataset::builder("/a", Arc::new(Int32Array::from_iter_values(0..10)))
                        .build()
                        .unwrap(),
                )
                .with_dataset(
                    InMemoryDataset::builder("/b", Arc::new(Int32Array::from_iter_values(0..12)))
                        .build()
                        .unwrap(),
                )
                .with_dataset(
                    InMemoryDataset::builder("/scalar", Arc::new(Int32Array::from(vec![7])))
                        .shape(vec![])
                        .build()
                        .unwrap(),
                )
                .with_dataset(
                    InMemoryDataset::builder("/starts", Arc::new(Float32Array::from(vec![0.0])))
                        .build()
                        .unwrap(),
                )
                .with_dataset(
                    InMemoryDataset::builder("/values", Arc::new(Int64Array::from(vec![1])))
                        .build()
                        .unwrap(),
                ),
        );
        store
    }

    #[test]
    fn test_row_count_mismatch() {
        let store = store();
        let source = TableSource::new("f.h5")
            .with_column(ColumnSpec::dataset("/a"))
            .with_column(ColumnSpec::dataset("/b"));
        let layout = SourceLayout::inspect(&store, &source, &MetadataCache::no_cache()).unwrap();
        let err = layout.rows().unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_scalar_dataset_has_no_rows() {
        let store = store();
        let source = TableSource::new("f.h5").with_column(ColumnSpec::dataset("/scalar"));
        let layout = SourceLayout::inspect(&store, &source, &MetadataCache::no_cache()).unwrap();
        let err = layout.rows().unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_duplicate_names() {
        let store = store();
        let source = TableSource::new("f.h5")
            .with_column(ColumnSpec::dataset("/a"))
            .with_column(ColumnSpec::dataset("/b").with_alias("a"));
        let err = SourceLayout::inspect(&store, &source, &MetadataCache::no_cache()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{err}");
    }

    #[test]
    fn test_run_offsets_must_be_integers() {
        let store = store();
        let source = TableSource::new("f.h5")
            .with_column(ColumnSpec::dataset("/a"))
            .with_column(ColumnSpec::run_encoded("/starts", "/values"));
        let layout = SourceLayout::inspect(&store, &source, &MetadataCache::no_cache()).unwrap();
        assert_eq!(layout.rows().unwrap(), (0, 10));
        let err = layout.columns[1].data_type.clone().unwrap_err();
        assert!(err.is_unsupported_type(), "{err}");
    }

    #[test]
    fn test_missing_dataset() {
        let store = store();
        let source = TableSource::new("f.h5").with_column(ColumnSpec::dataset("/nope"));
        let err = SourceLayout::inspect(&store, &source, &MetadataCache::no_cache()).unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound { .. }), "{err}");
    }
}
