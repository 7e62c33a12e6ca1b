// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Encodings used by H5DB chunk payloads.
//!
//! * [`rse`] expands run-sequence encoded columns
//! * [`statistics`] summarises decoded chunks for pruning
//! * [`compression`] undoes the block compression of raw chunks

pub mod compression;
pub mod rse;
pub mod statistics;

pub use compression::{BufferCompressor, CompressionScheme, GeneralBufferCompressor};
pub use rse::{RunSequenceDecoder, RunSequenceEncoding};
pub use statistics::ChunkStatistics;
