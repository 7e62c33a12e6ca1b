// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

pub mod memory;
pub mod testing;
pub mod traits;

pub use traits::{
    Attribute, AttributeValue, DatasetMetadata, DatasetReader, FileStore, H5File, ObjectInfo,
    ObjectKind,
};
