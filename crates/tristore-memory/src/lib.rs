//! Memory plumbing for tristore.
//!
//! This crate provides the building blocks the storage layer sits on:
//! - Byte budgeting shared by every growable structure
//! - Append-only regions of atomics that never relocate
//! - A checksummed binary stream codec for save/load
//! - Per-thread object locks with exclusive promotion

mod memory_manager;
mod region;
mod stream;
mod thread_context;

pub use memory_manager::MemoryManager;
pub use region::{AtomicElement, AtomicRegion};
pub use stream::{InputStream, OutputStream, RegionValue};
pub use thread_context::{
    ObjectDescriptor, SharedObjectGuard, ThreadContext, ThreadContextRegistry,
};
