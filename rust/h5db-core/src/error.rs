// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

use arrow_schema::ArrowError;
use snafu::{Location, Snafu};

/// H5DB's error type.
///
/// Every variant carries only owned, cloneable payloads so that a single
/// failure (for example a chunk load) can be handed to every thread that was
/// waiting on it.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("File not found: {path}, {location}"))]
    FileNotFound { path: String, location: Location },
    #[snafu(display("Dataset {dataset} not found in {path}, {location}"))]
    DatasetNotFound {
        path: String,
        dataset: String,
        location: Location,
    },
    #[snafu(display("Encountered corrupt file {path}: {message}, {location}"))]
    CorruptFile {
        path: String,
        message: String,
        location: Location,
    },
    #[snafu(display(
        "Malformed run-sequence encoding in column {column} at run {run_index}: {reason}, {location}"
    ))]
    MalformedEncoding {
        column: String,
        run_index: usize,
        reason: String,
        location: Location,
    },
    #[snafu(display("Shape mismatch: {message}, {location}"))]
    ShapeMismatch { message: String, location: Location },
    #[snafu(display(
        "Failed to read chunk {coordinate} of dataset {dataset}: {message}, {location}"
    ))]
    ChunkRead {
        dataset: String,
        coordinate: String,
        message: String,
        location: Location,
    },
    #[snafu(display("Column {column} has unsupported type {dtype}, {location}"))]
    UnsupportedType {
        column: String,
        dtype: String,
        location: Location,
    },
    #[snafu(display("Invalid user input: {message}, {location}"))]
    InvalidInput { message: String, location: Location },
    #[snafu(display("H5DBError(Arrow): {message}, {location}"))]
    Arrow { message: String, location: Location },
    #[snafu(display("H5DBError(IO): {message}, {location}"))]
    IO { message: String, location: Location },
    #[snafu(display("Encountered internal error: {message}, {location}"))]
    Internal { message: String, location: Location },
}

impl Error {
    pub fn invalid_input(message: impl Into<String>, location: Location) -> Self {
        Self::InvalidInput {
            message: message.into(),
            location,
        }
    }

    pub fn internal(message: impl Into<String>, location: Location) -> Self {
        Self::Internal {
            message: message.into(),
            location,
        }
    }

    pub fn corrupt_file(
        path: impl Into<String>,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        Self::CorruptFile {
            path: path.into(),
            message: message.into(),
            location,
        }
    }

    pub fn shape_mismatch(message: impl Into<String>, location: Location) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
            location,
        }
    }

    pub fn io(message: impl Into<String>, location: Location) -> Self {
        Self::IO {
            message: message.into(),
            location,
        }
    }

    /// Attach the column name to a [`Error::MalformedEncoding`] raised by code
    /// that only knows about run indices.
    pub fn with_column(self, name: &str) -> Self {
        match self {
            Self::MalformedEncoding {
                run_index,
                reason,
                location,
                ..
            } => Self::MalformedEncoding {
                column: name.to_string(),
                run_index,
                reason,
                location,
            },
            Self::UnsupportedType {
                dtype, location, ..
            } => Self::UnsupportedType {
                column: name.to_string(),
                dtype,
                location,
            },
            other => other,
        }
    }

    /// True for faults that identify a single column as unusable.
    pub fn is_unsupported_type(&self) -> bool {
        matches!(self, Self::UnsupportedType { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type ArrowResult<T> = std::result::Result<T, ArrowError>;

impl From<ArrowError> for Error {
    #[track_caller]
    fn from(e: ArrowError) -> Self {
        Self::Arrow {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<&ArrowError> for Error {
    #[track_caller]
    fn from(e: &ArrowError) -> Self {
        Self::Arrow {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::IO {
            message: e.to_string(),
            location: std::panic::Location::caller().to_snafu_location(),
        }
    }
}

impl From<Error> for ArrowError {
    fn from(value: Error) -> Self {
        match value {
            Error::Arrow { message, .. } => Self::ComputeError(message),
            Error::IO { message, .. } => Self::IoError(message, std::io::Error::other("h5db")),
            Error::InvalidInput { message, .. } => Self::InvalidArgumentError(message),
            e => Self::ExternalError(Box::new(e)),
        }
    }
}

trait ToSnafuLocation {
    fn to_snafu_location(&'static self) -> Location;
}

impl ToSnafuLocation for std::panic::Location<'static> {
    fn to_snafu_location(&'static self) -> Location {
        Location::new(self.file(), self.line(), self.column())
    }
}

#[cfg(test)]
mod tests {
    use snafu::location;

    use super::*;

    #[test]
    fn test_caller_location_capture() {
        let current_fn = std::panic::Location::caller();
        // Arrow conversions should point at the call site, not this module.
        let f: Box<dyn Fn() -> Result<()>> = Box::new(|| {
            Err(ArrowError::SchemaError("oops".to_string()))?;
            Ok(())
        });
        match f().unwrap_err() {
            Error::Arrow { location, .. } => {
                assert_eq!(location.line, current_fn.line() + 3, "{}", location)
            }
            other => panic!("expected arrow error, got {other:?}"),
        }
    }

    #[test]
    fn test_with_column_rewrites_malformed() {
        let err = Error::MalformedEncoding {
            column: String::new(),
            run_index: 3,
            reason: "overlap".to_string(),
            location: location!(),
        }
        .with_column("flags");
        match err {
            Error::MalformedEncoding {
                column, run_index, ..
            } => {
                assert_eq!(column, "flags");
                assert_eq!(run_index, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_errors_clone_with_payload() {
        let err = Error::ChunkRead {
            dataset: "f.h5:/x".to_string(),
            coordinate: "[1, 0]".to_string(),
            message: "timeout".to_string(),
            location: location!(),
        };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(cloned.to_string().contains("[1, 0]"));
    }
}
