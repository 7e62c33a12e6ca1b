// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Element types of on-disk datasets and their Arrow mapping.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use arrow_schema::{DataType, Field as ArrowField};
use deepsize::DeepSizeOf;
use snafu::location;

use crate::{Error, Result};

/// Datasets with more dimensions than this cannot be mapped to a column.
pub const MAX_DIMENSIONS: usize = 4;

/// The element type of a dataset as reported by the file-format library.
///
/// Numeric types are stored little-endian. Anything the scan cannot decode is
/// carried as [`ElementType::Unsupported`] so that the failure is raised only
/// when (and if) the column is actually read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, DeepSizeOf)]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// NUL padded UTF-8 of a fixed byte width.
    FixedString {
        size: usize,
    },
    Unsupported {
        description: String,
    },
}

impl ElementType {
    /// Number of bytes one element occupies in a raw chunk.
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::FixedString { size } => Some(*size),
            Self::Unsupported { .. } => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported { .. })
    }

    /// The Arrow type of a single element.
    pub fn to_arrow(&self) -> Result<DataType> {
        Ok(match self {
            Self::Int8 => DataType::Int8,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::UInt8 => DataType::UInt8,
            Self::UInt16 => DataType::UInt16,
            Self::UInt32 => DataType::UInt32,
            Self::UInt64 => DataType::UInt64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
            Self::FixedString { .. } => DataType::Utf8,
            Self::Unsupported { description } => {
                return Err(Error::UnsupportedType {
                    column: String::new(),
                    dtype: description.clone(),
                    location: location!(),
                })
            }
        })
    }

    /// The Arrow type of one row of a dataset with the given shape.
    ///
    /// The first dimension is the row dimension. Every further dimension
    /// wraps the element type in a `FixedSizeList`, innermost dimension last.
    pub fn to_arrow_for_shape(&self, shape: &[u64]) -> Result<DataType> {
        if shape.len() > MAX_DIMENSIONS {
            return Err(Error::UnsupportedType {
                column: String::new(),
                dtype: format!("{}-dimensional {}", shape.len(), self),
                location: location!(),
            });
        }
        let mut data_type = self.to_arrow()?;
        for extent in shape.iter().skip(1).rev() {
            let size = i32::try_from(*extent).map_err(|_| {
                Error::invalid_input(
                    format!("dimension extent {extent} is too large for a list column"),
                    location!(),
                )
            })?;
            data_type =
                DataType::FixedSizeList(Arc::new(ArrowField::new("item", data_type, true)), size);
        }
        Ok(data_type)
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => write!(f, "int8"),
            Self::Int16 => write!(f, "int16"),
            Self::Int32 => write!(f, "int32"),
            Self::Int64 => write!(f, "int64"),
            Self::UInt8 => write!(f, "uint8"),
            Self::UInt16 => write!(f, "uint16"),
            Self::UInt32 => write!(f, "uint32"),
            Self::UInt64 => write!(f, "uint64"),
            Self::Float32 => write!(f, "float32"),
            Self::Float64 => write!(f, "float64"),
            Self::FixedString { .. } => write!(f, "string"),
            Self::Unsupported { description } => write!(f, "{description}"),
        }
    }
}

impl TryFrom<&DataType> for ElementType {
    type Error = Error;

    fn try_from(value: &DataType) -> Result<Self> {
        Ok(match value {
            DataType::Int8 => Self::Int8,
            DataType::Int16 => Self::Int16,
            DataType::Int32 => Self::Int32,
            DataType::Int64 => Self::Int64,
            DataType::UInt8 => Self::UInt8,
            DataType::UInt16 => Self::UInt16,
            DataType::UInt32 => Self::UInt32,
            DataType::UInt64 => Self::UInt64,
            DataType::Float32 => Self::Float32,
            DataType::Float64 => Self::Float64,
            other => {
                return Err(Error::invalid_input(
                    format!("no element type for arrow type {other}"),
                    location!(),
                ))
            }
        })
    }
}
