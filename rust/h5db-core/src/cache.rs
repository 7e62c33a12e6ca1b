// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Cache for dataset metadata and run tables.

use std::any::{Any, TypeId};
use std::sync::Arc;

use moka::sync::Cache;
use snafu::location;

use crate::{Error, Result};

pub use deepsize::{Context, DeepSizeOf};

type ArcAny = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
struct SizedRecord {
    record: ArcAny,
    size_accessor: Arc<dyn Fn(&ArcAny) -> usize + Send + Sync>,
}

impl std::fmt::Debug for SizedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizedRecord")
            .field("record", &self.record)
            .finish()
    }
}

impl SizedRecord {
    fn new<T: DeepSizeOf + Send + Sync + 'static>(record: Arc<T>) -> Self {
        let size_accessor = |record: &ArcAny| -> usize {
            record
                .downcast_ref::<T>()
                .map(|record| record.deep_size_of())
                .unwrap_or(0)
        };
        Self {
            record,
            size_accessor: Arc::new(size_accessor),
        }
    }
}

/// Cache for metadata read from files.
///
/// The cache is keyed by a string (usually `file:dataset`) and the type of
/// the metadata, and is bounded by the deep size of its records.
#[derive(Clone, Debug)]
pub struct MetadataCache {
    cache: Option<Arc<Cache<(String, TypeId), SizedRecord>>>,
}

impl DeepSizeOf for MetadataCache {
    fn deep_size_of_children(&self, _: &mut Context) -> usize {
        self.cache
            .as_ref()
            .map(|cache| {
                cache
                    .iter()
                    .map(|(_, v)| (v.size_accessor)(&v.record))
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl MetadataCache {
    /// Create a cache bounded to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Some(Arc::new(
                Cache::builder()
                    .max_capacity(capacity as u64)
                    .support_invalidation_closures()
                    .weigher(|_, v: &SizedRecord| {
                        (v.size_accessor)(&v.record).try_into().unwrap_or(u32::MAX)
                    })
                    .build(),
            )),
        }
    }

    /// Instantiates a dummy cache that will never cache anything.
    pub fn no_cache() -> Self {
        Self { cache: None }
    }

    /// Fetch an item from the cache
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let cache = self.cache.as_ref()?;
        cache
            .get(&(key.to_owned(), TypeId::of::<T>()))
            .and_then(|metadata| metadata.record.downcast::<T>().ok())
    }

    /// Insert an item into the cache
    pub fn insert<T: DeepSizeOf + Send + Sync + 'static>(&self, key: String, metadata: Arc<T>) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        cache.insert((key, TypeId::of::<T>()), SizedRecord::new(metadata));
    }

    /// Drop every record whose key starts with `prefix`, whatever its type.
    pub fn invalidate_prefix(&self, prefix: &str) -> Result<()> {
        let Some(cache) = self.cache.as_ref() else {
            return Ok(());
        };
        let prefix = prefix.to_owned();
        cache
            .invalidate_entries_if(move |(key, _), _| key.starts_with(&prefix))
            .map_err(|err| {
                Error::internal(
                    format!("failed to invalidate metadata cache: {err}"),
                    location!(),
                )
            })?;
        Ok(())
    }

    /// Get an item
    ///
    /// If it exists in the cache return that
    ///
    /// If it doesn't then run `loader` to load the item, insert into cache, and return
    pub fn get_or_insert<T, F>(&self, key: &str, loader: F) -> Result<Arc<T>>
    where
        T: DeepSizeOf + Send + Sync + 'static,
        F: FnOnce(&str) -> Result<T>,
    {
        if let Some(metadata) = self.get::<T>(key) {
            return Ok(metadata);
        }

        let metadata = Arc::new(loader(key)?);
        self.insert(key.to_owned(), metadata.clone());
        Ok(metadata)
    }
}
