// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Metadata-only views of files and sources.
//!
//! Nothing here reads a chunk payload.

use std::sync::Arc;

use arrow_array::builder::{ListBuilder, StringBuilder, UInt64Builder};
use arrow_array::{new_null_array, Array, ArrayRef, ListArray, RecordBatch};
use arrow_buffer::OffsetBuffer;
use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema};
use snafu::location;
use tracing::instrument;

use h5db_core::{Error, Result};
use h5db_io::AttributeValue;

use crate::session::Session;
use crate::source::{SourceLayout, TableSource};

/// What a column of a [`TableSource`] looks like on disk and in Arrow.
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub name: String,
    /// Element type name of the values dataset, e.g. `float64`.
    pub dtype: String,
    pub shape: Vec<u64>,
    /// `None` for contiguous storage.
    pub chunk_shape: Option<Vec<u64>>,
    /// Arrow type of one row; `None` if the column is unsupported.
    pub data_type: Option<DataType>,
    pub run_encoded: bool,
    /// Why the column cannot be read, if it cannot.
    pub unsupported: Option<Error>,
}

impl ColumnDescription {
    pub fn is_supported(&self) -> bool {
        self.unsupported.is_none()
    }
}

impl Session {
    /// Describe every column of `source`.
    ///
    /// Unsupported columns are described rather than rejected; the scan
    /// would fail on them unless they are skipped.
    #[instrument(level = "debug", skip_all, fields(file = source.file()))]
    pub fn describe(&self, source: &TableSource) -> Result<Vec<ColumnDescription>> {
        let layout = SourceLayout::inspect(self.store.as_ref(), source, &self.metadata_cache)?;
        Ok(layout
            .columns
            .into_iter()
            .map(|column| {
                let (data_type, unsupported) = match column.data_type {
                    Ok(data_type) => (Some(data_type), None),
                    Err(err) => (None, Some(err)),
                };
                ColumnDescription {
                    name: column.name,
                    dtype: column.metadata.dtype.to_string(),
                    shape: column.metadata.shape.clone(),
                    chunk_shape: column.metadata.chunk_shape.clone(),
                    data_type,
                    run_encoded: column.spec.is_run_encoded(),
                    unsupported,
                }
            })
            .collect())
    }

    /// Every group and dataset of `file`.
    ///
    /// Columns are `path`, `type` (`group` or `dataset`), `dtype` and
    /// `shape`. The last two are null for groups.
    pub fn tree(&self, file: &str) -> Result<RecordBatch> {
        let objects = self.store.open(file)?.list_objects()?;
        let mut paths = StringBuilder::new();
        let mut kinds = StringBuilder::new();
        let mut dtypes = StringBuilder::new();
        let mut shapes = ListBuilder::new(UInt64Builder::new())
            .with_field(Arc::new(ArrowField::new("item", DataType::UInt64, false)));
        for object in &objects {
            paths.append_value(&object.path);
            kinds.append_value(object.kind.to_string());
            dtypes.append_option(object.dtype.as_ref().map(ToString::to_string));
            match &object.shape {
                Some(shape) => {
                    shapes.values().append_slice(shape);
                    shapes.append(true);
                }
                None => shapes.append_null(),
            }
        }
        let shapes = shapes.finish();
        let schema = ArrowSchema::new(vec![
            ArrowField::new("path", DataType::Utf8, false),
            ArrowField::new("type", DataType::Utf8, false),
            ArrowField::new("dtype", DataType::Utf8, true),
            ArrowField::new("shape", shapes.data_type().clone(), true),
        ]);
        Ok(RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(paths.finish()),
                Arc::new(kinds.finish()),
                Arc::new(dtypes.finish()),
                Arc::new(shapes),
            ],
        )?)
    }

    /// The attributes of `object` in `file` as a single row.
    ///
    /// Scalar attributes keep their type; array attributes become a `List`
    /// of it. An object without attributes is an `InvalidInput` error.
    pub fn attributes(&self, file: &str, object: &str) -> Result<RecordBatch> {
        let attributes = self.store.open(file)?.attributes(object)?;
        if attributes.is_empty() {
            return Err(Error::invalid_input(
                format!("Object {object} in {file} has no attributes"),
                location!(),
            ));
        }
        let mut fields = Vec::with_capacity(attributes.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            let column = match attribute.value {
                AttributeValue::Scalar(value) if value.len() == 1 => value,
                AttributeValue::Scalar(value) => new_null_array(value.data_type(), 1),
                AttributeValue::Array(values) => {
                    let item = Arc::new(ArrowField::new("item", values.data_type().clone(), true));
                    let offsets = OffsetBuffer::from_lengths([values.len()]);
                    Arc::new(ListArray::try_new(item, offsets, values, None)?)
                }
            };
            fields.push(ArrowField::new(
                attribute.name,
                column.data_type().clone(),
                true,
            ));
            columns.push(column);
        }
        Ok(RecordBatch::try_new(
            Arc::new(ArrowSchema::new(fields)),
            columns,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Int64Type, UInt64Type};
    use arrow_array::{Float64Array, Int32Array, Int64Array, StringArray};

    use h5db_core::datatypes::ElementType;
    use h5db_io::memory::{InMemoryDataset, InMemoryFile, InMemoryStore};

    use super::*;
    use crate::source::ColumnSpec;

    fn session() -> Session {
        let store = InMemoryStore::new();
        store.add_file(
            InMemoryFile::new("run.h5")
                .with_group("/meta")
                .with_dataset(
                    InMemoryDataset::builder(
                        "/entry/energy",
                        Arc::new(Float64Array::from_iter_values((0..24).map(f64::from))),
                    )
                    .shape(vec![8, 3])
                    .chunk_shape(vec![4, 3])
                    .build()
                    .unwrap(),
                )
                .with_dataset(
                    InMemoryDataset::builder(
                        "/entry/half",
                        Arc::new(Int32Array::from_iter_values(0..8)),
                    )
                    .dtype(ElementType::Unsupported {
                        description: "float16".to_string(),
                    })
                    .build()
                    .unwrap(),
                )
                .with_attribute(
                    "/entry/energy",
                    "units",
                    AttributeValue::Scalar(Arc::new(StringArray::from(vec!["keV"]))),
                )
                .with_attribute(
                    "/entry/energy",
                    "calibration",
                    AttributeValue::Array(Arc::new(Int64Array::from(vec![1, 2, 3]))),
                ),
        );
        Session::new(Arc::new(store))
    }

    #[test]
    fn test_describe() {
        let session = session();
        let source = TableSource::new("run.h5")
            .with_column(ColumnSpec::dataset("/entry/energy"))
            .with_column(ColumnSpec::dataset("/entry/half"));
        let columns = session.describe(&source).unwrap();
        assert_eq!(columns.len(), 2);

        let energy = &columns[0];
        assert_eq!(energy.name, "energy");
        assert_eq!(energy.dtype, "float64");
        assert_eq!(energy.shape, vec![8, 3]);
        assert_eq!(energy.chunk_shape, Some(vec![4, 3]));
        assert!(energy.is_supported());
        assert!(matches!(
            energy.data_type,
            Some(DataType::FixedSizeList(_, 3))
        ));

        let half = &columns[1];
        assert!(!half.is_supported());
        assert!(half.unsupported.as_ref().unwrap().is_unsupported_type());
        // Nothing was decoded.
        assert_eq!(session.chunk_cache_stats().loads, 0);
    }

    #[test]
    fn test_tree() {
        let tree = session().tree("run.h5").unwrap();
        let paths = tree.column(0).as_string::<i32>();
        let kinds = tree.column(1).as_string::<i32>();
        let dtypes = tree.column(2).as_string::<i32>();
        let shapes = tree.column(3).as_list::<i32>();

        let energy = (0..tree.num_rows())
            .find(|i| paths.value(*i) == "/entry/energy")
            .unwrap();
        assert_eq!(kinds.value(energy), "dataset");
        assert_eq!(dtypes.value(energy), "float64");
        assert_eq!(
            shapes.value(energy).as_primitive::<UInt64Type>().values().to_vec(),
            vec![8, 3]
        );

        let meta = (0..tree.num_rows())
            .find(|i| paths.value(*i) == "/meta")
            .unwrap();
        assert_eq!(kinds.value(meta), "group");
        assert!(dtypes.is_null(meta));
        assert!(shapes.is_null(meta));
    }

    #[test]
    fn test_attributes() {
        let attributes = session().attributes("run.h5", "/entry/energy").unwrap();
        assert_eq!(attributes.num_rows(), 1);
        assert_eq!(
            attributes.column_by_name("units").unwrap().as_string::<i32>().value(0),
            "keV"
        );
        let calibration = attributes.column_by_name("calibration").unwrap();
        assert!(matches!(calibration.data_type(), DataType::List(_)));
        let values = calibration.as_list::<i32>().value(0);
        assert_eq!(values.as_primitive::<Int64Type>().values().to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_object_without_attributes() {
        let err = session().attributes("run.h5", "/meta").unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{err}");
        assert!(err.to_string().contains("/meta"), "{err}");
    }

    #[test]
    fn test_missing_object() {
        let err = session().attributes("run.h5", "/nope").unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound { .. }), "{err}");
    }
}
