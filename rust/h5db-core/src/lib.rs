// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

use arrow_schema::{DataType, Field as ArrowField};
use std::sync::LazyLock;

pub mod cache;
pub mod chunk_cache;
pub mod datatypes;
pub mod error;
pub mod grid;
pub mod utils;

pub use error::{ArrowResult, Error, Result};

/// Column name for the row index within a source.
pub const ROW_INDEX: &str = "_rowindex";
/// Column name for the label of the source a row came from.
pub const SOURCE: &str = "_source";

/// Row index field.
pub static ROW_INDEX_FIELD: LazyLock<ArrowField> =
    LazyLock::new(|| ArrowField::new(ROW_INDEX, DataType::UInt64, false));
/// Source label field.
pub static SOURCE_FIELD: LazyLock<ArrowField> =
    LazyLock::new(|| ArrowField::new(SOURCE, DataType::Utf8, false));
