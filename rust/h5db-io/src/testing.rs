// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Testing utilities

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arrow_array::ArrayRef;
use bytes::Bytes;

use h5db_core::datatypes::ElementType;
use h5db_core::grid::ChunkCoordinate;
use h5db_core::Result;
use h5db_encoding::CompressionScheme;

use crate::traits::{Attribute, DatasetReader, FileStore, H5File, ObjectInfo};

// A policy function takes in the name of the operation (e.g. "read_chunk"),
// the object being accessed and, for chunk reads, the chunk coordinate, and
// returns an optional error.
pub trait PolicyFnT: Fn(&str, &str, Option<&ChunkCoordinate>) -> Result<()> + Send + Sync {}
impl<F> PolicyFnT for F where F: Fn(&str, &str, Option<&ChunkCoordinate>) -> Result<()> + Send + Sync
{}
impl Debug for dyn PolicyFnT {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PolicyFn")
    }
}
pub type PolicyFn = Arc<dyn PolicyFnT>;

/// A policy container, meant to be shared between test code and the proxy store.
///
/// Typically, you would use this to simulate I/O errors or slow reads, and to
/// count how often each dataset's chunks were read.
#[derive(Debug, Default)]
pub struct ProxyStorePolicy {
    /// Policies which run before a method is invoked.  If the policy returns
    /// an error then the target method will not be invoked and the error will
    /// be returned instead.
    before_policies: HashMap<String, PolicyFn>,
    read_delay: Option<Duration>,
    chunk_reads: HashMap<String, Vec<ChunkCoordinate>>,
}

impl ProxyStorePolicy {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set a new policy with the given name
    ///
    /// The name can be used to later remove this policy
    pub fn set_before_policy(&mut self, name: &str, policy: PolicyFn) {
        self.before_policies.insert(name.to_string(), policy);
    }

    pub fn clear_before_policy(&mut self, name: &str) {
        self.before_policies.remove(name);
    }

    /// Sleep this long in every chunk read.
    pub fn set_read_delay(&mut self, delay: Option<Duration>) {
        self.read_delay = delay;
    }

    /// Chunk coordinates read from `dataset`, in the order they were read.
    pub fn chunk_reads(&self, dataset: &str) -> Vec<ChunkCoordinate> {
        self.chunk_reads.get(dataset).cloned().unwrap_or_default()
    }

    pub fn total_chunk_reads(&self) -> usize {
        self.chunk_reads.values().map(Vec::len).sum()
    }
}

type SharedPolicy = Arc<Mutex<ProxyStorePolicy>>;

fn lock(policy: &SharedPolicy) -> MutexGuard<'_, ProxyStorePolicy> {
    policy.lock().unwrap_or_else(PoisonError::into_inner)
}

fn before_method(
    policy: &SharedPolicy,
    method: &str,
    object: &str,
    coordinate: Option<&ChunkCoordinate>,
) -> Result<()> {
    // Policies may sleep, so they run without the lock held.
    let policies = lock(policy).before_policies.values().cloned().collect::<Vec<_>>();
    for policy in policies {
        policy(method, object, coordinate)?;
    }
    Ok(())
}

/// A proxy store
///
/// This store wraps another store and applies the given policy to all calls
/// made to it, and to the files and datasets opened through it.
#[derive(Debug)]
pub struct ProxyStore {
    target: Arc<dyn FileStore>,
    policy: SharedPolicy,
}

impl ProxyStore {
    pub fn new(target: Arc<dyn FileStore>, policy: Arc<Mutex<ProxyStorePolicy>>) -> Self {
        Self { target, policy }
    }
}

impl FileStore for ProxyStore {
    fn open(&self, path: &str) -> Result<Arc<dyn H5File>> {
        before_method(&self.policy, "open", path, None)?;
        let target = self.target.open(path)?;
        Ok(Arc::new(ProxyFile {
            target,
            policy: self.policy.clone(),
        }))
    }
}

#[derive(Debug)]
struct ProxyFile {
    target: Arc<dyn H5File>,
    policy: SharedPolicy,
}

impl H5File for ProxyFile {
    fn path(&self) -> &str {
        self.target.path()
    }

    fn open_dataset(&self, path: &str) -> Result<Arc<dyn DatasetReader>> {
        before_method(&self.policy, "open_dataset", path, None)?;
        let target = self.target.open_dataset(path)?;
        Ok(Arc::new(ProxyDataset {
            target,
            policy: self.policy.clone(),
        }))
    }

    fn list_objects(&self) -> Result<Vec<ObjectInfo>> {
        before_method(&self.policy, "list_objects", self.target.path(), None)?;
        self.target.list_objects()
    }

    fn attributes(&self, object: &str) -> Result<Vec<Attribute>> {
        before_method(&self.policy, "attributes", object, None)?;
        self.target.attributes(object)
    }
}

#[derive(Debug)]
struct ProxyDataset {
    target: Arc<dyn DatasetReader>,
    policy: SharedPolicy,
}

impl DatasetReader for ProxyDataset {
    fn path(&self) -> &str {
        self.target.path()
    }

    fn shape(&self) -> Vec<u64> {
        self.target.shape()
    }

    fn chunk_shape(&self) -> Option<Vec<u64>> {
        self.target.chunk_shape()
    }

    fn dtype(&self) -> ElementType {
        self.target.dtype()
    }

    fn compression(&self) -> CompressionScheme {
        self.target.compression()
    }

    fn fill_value(&self) -> Option<ArrayRef> {
        self.target.fill_value()
    }

    fn read_chunk(&self, coordinate: &ChunkCoordinate) -> Result<Bytes> {
        before_method(&self.policy, "read_chunk", self.path(), Some(coordinate))?;
        let delay = {
            let mut policy = lock(&self.policy);
            policy
                .chunk_reads
                .entry(self.path().to_string())
                .or_default()
                .push(coordinate.clone());
            policy.read_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.target.read_chunk(coordinate)
    }
}
