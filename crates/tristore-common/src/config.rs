//! Configuration structures for tristore.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Default number of buckets of a freshly initialized hash table.
pub const HASH_TABLE_INITIAL_SIZE: usize = 32768;

/// Fraction of used buckets at which a hash table doubles.
pub const HASH_TABLE_LOAD_FACTOR: f64 = 0.7;

/// Largest object id the thread-context registry hands out.
pub const MAX_OBJECT_ID: u32 = 65535;

/// Largest thread-context id; ids start at 1.
pub const MAX_THREAD_CONTEXT_ID: u32 = 65535;

/// Number of old buckets migrated per unit of cooperative resize work.
pub const RESIZE_CHUNK_SIZE: usize = 1024;

/// Share of the bucket count a thread may insert before publishing its count.
pub const PARALLEL_HASH_TABLE_WINDOW_FACTOR: f64 = 0.1;

/// Storage configuration for a triple table and its indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of triple slots reserved up front.
    pub initial_triple_capacity: usize,
    /// Number of resource ids the one-key indexes cover up front.
    pub initial_resource_capacity: usize,
    /// Hard upper bound on the number of triple slots.
    pub max_triple_capacity: usize,
    /// Hard upper bound on resource ids accepted by one-key indexes.
    pub max_resource_id: u64,
    /// Minimum bucket count of every hash table (power of two).
    pub hash_table_initial_size: usize,
    /// Used-bucket ratio that triggers a resize.
    pub hash_table_load_factor: f64,
    /// Byte budget shared by all growable regions (0 = unlimited).
    pub memory_budget_bytes: usize,
    /// Number of threads expected to insert concurrently.
    pub number_of_threads: usize,
    /// Size of the object-id pool of the thread-context registry.
    pub max_objects: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_triple_capacity: 0,
            initial_resource_capacity: 0,
            max_triple_capacity: 1 << 32,
            max_resource_id: 1 << 32,
            hash_table_initial_size: HASH_TABLE_INITIAL_SIZE,
            hash_table_load_factor: HASH_TABLE_LOAD_FACTOR,
            memory_budget_bytes: 0,
            number_of_threads: num_cpus(),
            max_objects: MAX_OBJECT_ID as usize + 1,
        }
    }
}

impl StoreConfig {
    /// Checks that the configuration can drive a triple table.
    pub fn validate(&self) -> Result<()> {
        if !self.hash_table_initial_size.is_power_of_two() {
            return Err(StoreError::InvalidParameter {
                name: "hash_table_initial_size".to_string(),
                value: self.hash_table_initial_size.to_string(),
            });
        }
        if !(self.hash_table_load_factor > 0.0 && self.hash_table_load_factor < 1.0) {
            return Err(StoreError::InvalidParameter {
                name: "hash_table_load_factor".to_string(),
                value: self.hash_table_load_factor.to_string(),
            });
        }
        if self.number_of_threads == 0 {
            return Err(StoreError::InvalidParameter {
                name: "number_of_threads".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_objects == 0 || self.max_objects > MAX_OBJECT_ID as usize + 1 {
            return Err(StoreError::InvalidParameter {
                name: "max_objects".to_string(),
                value: self.max_objects.to_string(),
            });
        }
        if self.initial_triple_capacity > self.max_triple_capacity {
            return Err(StoreError::ConfigError(format!(
                "initial triple capacity {} exceeds maximum {}",
                self.initial_triple_capacity, self.max_triple_capacity
            )));
        }
        Ok(())
    }

    /// Returns the bucket count needed to hold `entries` under the load factor.
    ///
    /// The result is a power of two and never below `hash_table_initial_size`.
    pub fn hash_table_size(&self, entries: usize) -> usize {
        let with_load_factor = (entries as f64 / self.hash_table_load_factor) as usize + 1;
        with_load_factor
            .next_power_of_two()
            .max(self.hash_table_initial_size)
    }

    /// Returns a small-footprint configuration suitable for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_triple_capacity: 0,
            initial_resource_capacity: 0,
            max_triple_capacity: 1 << 24,
            max_resource_id: 1 << 24,
            hash_table_initial_size: 1024,
            hash_table_load_factor: HASH_TABLE_LOAD_FACTOR,
            memory_budget_bytes: 0,
            number_of_threads: 4,
            max_objects: 256,
        }
    }
}

/// Returns the number of available CPUs.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
