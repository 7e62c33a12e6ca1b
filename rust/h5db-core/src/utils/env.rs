// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

//! Process-wide defaults that can be overridden through the environment.

use std::str::FromStr;
use std::sync::LazyLock;

/// Default capacity of the chunk cache: 256 MiB.
pub const DEFAULT_CHUNK_CACHE_SIZE: usize = 256 * 1024 * 1024;
/// Default capacity of the metadata cache: 16 MiB.
pub const DEFAULT_METADATA_CACHE_SIZE: usize = 16 * 1024 * 1024;
/// Default upper bound on the number of runs of a run-sequence column.
pub const DEFAULT_MAX_RUNS: usize = 1 << 26;

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Ignoring invalid value {:?} for {}", value, name);
            None
        }
    }
}

/// Number of worker threads a scan uses unless told otherwise.
///
/// Reads `H5DB_CPU_THREADS`, falling back to the number of logical CPUs.
pub fn get_num_compute_intensive_cpus() -> usize {
    match parse_env::<usize>("H5DB_CPU_THREADS") {
        Some(0) => {
            log::warn!("H5DB_CPU_THREADS must be positive, using 1 worker");
            1
        }
        Some(threads) => threads,
        None => num_cpus::get().max(1),
    }
}

pub static CHUNK_CACHE_SIZE: LazyLock<usize> = LazyLock::new(|| {
    parse_env("H5DB_CHUNK_CACHE_SIZE").unwrap_or(DEFAULT_CHUNK_CACHE_SIZE)
});

pub static METADATA_CACHE_SIZE: LazyLock<usize> = LazyLock::new(|| {
    parse_env("H5DB_METADATA_CACHE_SIZE").unwrap_or(DEFAULT_METADATA_CACHE_SIZE)
});

pub static MAX_RUNS: LazyLock<usize> =
    LazyLock::new(|| parse_env("H5DB_MAX_RUNS").unwrap_or(DEFAULT_MAX_RUNS));
