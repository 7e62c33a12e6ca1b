// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

use std::sync::Arc;

use deepsize::DeepSizeOf;

use h5db_core::cache::MetadataCache;
use h5db_core::chunk_cache::{CacheStats, ChunkCache};
use h5db_core::utils::env::{CHUNK_CACHE_SIZE, MAX_RUNS, METADATA_CACHE_SIZE};
use h5db_core::Result;
use h5db_encoding::RunSequenceDecoder;
use h5db_io::FileStore;

use crate::dataset::{ChunkEntry, DatasetHandle};
use crate::scanner::Scanner;
use crate::source::TableSource;

/// A user session tracks the caches shared by every scan.
///
/// Sessions are cheap to clone; clones share their caches. Scans opened on
/// the same session share decoded chunks of the datasets they have in
/// common.
#[derive(Clone)]
pub struct Session {
    pub(crate) store: Arc<dyn FileStore>,
    pub(crate) chunk_cache: Arc<ChunkCache<ChunkEntry>>,
    pub(crate) metadata_cache: MetadataCache,
    pub(crate) decoder: RunSequenceDecoder,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("chunk_cache", &self.chunk_cache)
            .finish()
    }
}

impl DeepSizeOf for Session {
    fn deep_size_of_children(&self, context: &mut deepsize::Context) -> usize {
        self.chunk_cache.stats().used_bytes + self.metadata_cache.deep_size_of_children(context)
    }
}

impl Session {
    /// A session with default cache sizes, reading files through `store`.
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        SessionBuilder::new(store).build()
    }

    pub fn builder(store: Arc<dyn FileStore>) -> SessionBuilder {
        SessionBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn chunk_cache(&self) -> &Arc<ChunkCache<ChunkEntry>> {
        &self.chunk_cache
    }

    pub fn chunk_cache_stats(&self) -> CacheStats {
        self.chunk_cache.stats()
    }

    /// Start building a scan over `sources`.
    pub fn scan(&self, sources: impl IntoIterator<Item = TableSource>) -> Scanner {
        Scanner::new(self.clone(), sources.into_iter().collect())
    }

    /// Forget the cached metadata and run tables of `file`.
    ///
    /// Call this after `file` was rewritten; later scans re-read its
    /// metadata. Decoded chunks are dropped with the last handle of their
    /// dataset and need no invalidation.
    pub fn invalidate_file(&self, file: &str) -> Result<()> {
        self.metadata_cache.invalidate_prefix(&format!("{file}:"))
    }

    /// Open a single dataset for chunk-level access.
    pub fn open_dataset(&self, file: &str, path: &str) -> Result<DatasetHandle> {
        let file = self.store.open(file)?;
        DatasetHandle::open(
            file.as_ref(),
            path,
            &self.chunk_cache,
            &self.metadata_cache,
        )
    }
}

/// Options of a [`Session`].
///
/// Unset sizes default to the `H5DB_CHUNK_CACHE_SIZE`,
/// `H5DB_METADATA_CACHE_SIZE` and `H5DB_MAX_RUNS` environment variables.
#[derive(Debug)]
pub struct SessionBuilder {
    store: Arc<dyn FileStore>,
    chunk_cache_size: Option<usize>,
    metadata_cache_size: Option<usize>,
    max_runs: Option<usize>,
}

impl SessionBuilder {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            chunk_cache_size: None,
            metadata_cache_size: None,
            max_runs: None,
        }
    }

    /// Capacity of the chunk cache in bytes of decoded values.
    pub fn chunk_cache_size(mut self, bytes: usize) -> Self {
        self.chunk_cache_size = Some(bytes);
        self
    }

    /// Capacity of the metadata cache in bytes. Zero disables it.
    pub fn metadata_cache_size(mut self, bytes: usize) -> Self {
        self.metadata_cache_size = Some(bytes);
        self
    }

    /// Largest number of runs accepted in a run-encoded column.
    pub fn max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn build(self) -> Session {
        let metadata_cache = match self.metadata_cache_size.unwrap_or(*METADATA_CACHE_SIZE) {
            0 => MetadataCache::no_cache(),
            size => MetadataCache::new(size),
        };
        Session {
            store: self.store,
            chunk_cache: Arc::new(ChunkCache::new(
                self.chunk_cache_size.unwrap_or(*CHUNK_CACHE_SIZE),
            )),
            metadata_cache,
            decoder: RunSequenceDecoder::new(self.max_runs.unwrap_or(*MAX_RUNS)),
        }
    }
}
