//! Concurrent triple storage and multi-key indexing for tristore.
//!
//! This crate provides:
//! - Triple lists holding ids, per-component next pointers and status bytes
//! - Open-addressing hash tables with pluggable bucket policies
//! - One-key indexes of per-resource chain heads and counts
//! - Index managers that link every triple into its chains
//! - `TripleTable`, which ties them together and answers triple patterns
//! - `SequentialTripleTable`, the single-writer layout over the same indexes

mod hash_table;
mod managers;
mod one_key_index;
mod table;
mod triple_list;

pub use hash_table::{
    hash_finish, hash_mix, hash_resource_ids, BucketDescriptor, BucketGuard, BucketPolicy,
    BucketStatus, ParallelHashTable, SequentialHashTable, ThreeKeysPolicy, TwoKeysPolicy,
    IN_INSERTION,
};
pub use managers::{
    ChainFilter, ChainScan, ChainStart, InsertToken, ThreeKeysManager, TwoKeysManagerGroupByOne,
    TwoKeysManagerGroupByTwo,
};
pub use one_key_index::OneKeyIndex;
pub use table::{
    PatternTerm, QueryShape, SequentialTripleTable, TripleIterator, TripleMatch, TriplePattern,
    TripleTable, WindowedLoader,
};
pub use triple_list::{ConcurrentTripleList, SequentialTripleList, TripleList};
