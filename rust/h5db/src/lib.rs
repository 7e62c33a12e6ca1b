// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! H5DB: tabular scans over chunked hierarchical array files.
//!
//! A [`TableSource`] names a file and the datasets that make up the columns
//! of its rows. A [`Session`] opens sources through a [`FileStore`] and scans
//! them in parallel, yielding Arrow [`RecordBatch`](arrow_array::RecordBatch)es.
//!
//! ```rust,ignore
//! let session = Session::new(store);
//! let source = TableSource::new("run_0042.h5")
//!     .with_column(ColumnSpec::dataset("/entry/energy"))
//!     .with_column(ColumnSpec::run_encoded("/entry/flag/starts", "/entry/flag/values"));
//! let mut scanner = session.scan([source]);
//! scanner.filter(ColumnFilter::eq("values", 2)).worker_count(4);
//! for batch in scanner.try_into_stream()? {
//!     println!("{}", batch?.num_rows());
//! }
//! ```
//!
//! Decoded chunks are shared by every scan of a session through its
//! [`ChunkCache`](h5db_core::chunk_cache::ChunkCache).

pub mod dataset;
pub mod introspection;
pub mod run_table;
pub mod scanner;
pub mod session;
pub mod source;

pub use h5db_core::{Error, Result};
pub use h5db_io::FileStore;

pub use dataset::DatasetHandle;
pub use introspection::ColumnDescription;
pub use scanner::{
    ColumnFilter, MalformedChunkPolicy, Predicate, ScanStats, ScanStream, Scanner,
};
pub use session::{Session, SessionBuilder};
pub use source::{ColumnSpec, TableSource};
