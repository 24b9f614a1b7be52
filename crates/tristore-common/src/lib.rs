//! tristore common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all tristore components.

pub mod config;
pub mod error;
pub mod statistics;
pub mod types;

pub use config::{
    StoreConfig, HASH_TABLE_INITIAL_SIZE, HASH_TABLE_LOAD_FACTOR, MAX_OBJECT_ID,
    MAX_THREAD_CONTEXT_ID, PARALLEL_HASH_TABLE_WINDOW_FACTOR, RESIZE_CHUNK_SIZE,
};
pub use error::{Result, StoreError};
pub use statistics::{ComponentStatistics, StatisticValue};
pub use types::{ResourceComponent, ResourceId, Triple, TupleIndex, TupleStatus};
