//! Growable arrays of atomics whose elements never move.
//!
//! A region is a directory of lazily allocated segments with doubling sizes:
//! segment `k` holds `BASE << k` elements. Growth only appends segments, so a
//! reference to an element stays valid for the lifetime of the region and
//! readers never need a lock.

use crate::memory_manager::MemoryManager;
use crate::stream::{InputStream, OutputStream, RegionValue};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tristore_common::{Result, StoreError};

/// log2 of the element count of the first segment.
const BASE_SHIFT: u32 = 12;

/// Number of segment slots; covers every index addressable by `usize`.
const MAX_SEGMENTS: usize = (usize::BITS - BASE_SHIFT) as usize;

/// Atomic integer that can live in a region.
pub trait AtomicElement: Send + Sync + Sized {
    type Value: RegionValue + PartialEq + std::fmt::Debug;

    fn new(value: Self::Value) -> Self;
    fn load(&self, order: Ordering) -> Self::Value;
    fn store(&self, value: Self::Value, order: Ordering);
    fn compare_exchange(
        &self,
        current: Self::Value,
        new: Self::Value,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<Self::Value, Self::Value>;
    fn fetch_add(&self, value: Self::Value, order: Ordering) -> Self::Value;
    fn fetch_sub(&self, value: Self::Value, order: Ordering) -> Self::Value;
}

macro_rules! impl_atomic_element {
    ($atomic:ty, $value:ty) => {
        impl AtomicElement for $atomic {
            type Value = $value;

            #[inline(always)]
            fn new(value: $value) -> Self {
                <$atomic>::new(value)
            }

            #[inline(always)]
            fn load(&self, order: Ordering) -> $value {
                <$atomic>::load(self, order)
            }

            #[inline(always)]
            fn store(&self, value: $value, order: Ordering) {
                <$atomic>::store(self, value, order)
            }

            #[inline(always)]
            fn compare_exchange(
                &self,
                current: $value,
                new: $value,
                success: Ordering,
                failure: Ordering,
            ) -> std::result::Result<$value, $value> {
                <$atomic>::compare_exchange(self, current, new, success, failure)
            }

            #[inline(always)]
            fn fetch_add(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_add(self, value, order)
            }

            #[inline(always)]
            fn fetch_sub(&self, value: $value, order: Ordering) -> $value {
                <$atomic>::fetch_sub(self, value, order)
            }
        }
    };
}

impl_atomic_element!(AtomicU8, u8);
impl_atomic_element!(AtomicU32, u32);
impl_atomic_element!(AtomicU64, u64);

/// Maps an element index to (segment, offset within segment).
#[inline(always)]
fn locate(index: usize) -> (usize, usize) {
    let shifted = index + (1 << BASE_SHIFT);
    let top_bit = usize::BITS - 1 - shifted.leading_zeros();
    let segment = (top_bit - BASE_SHIFT) as usize;
    (segment, shifted - (1 << top_bit))
}

/// Number of elements covered by segments `0..=segment`.
#[inline(always)]
fn end_of_segment(segment: usize) -> usize {
    ((1usize << BASE_SHIFT) << (segment + 1)) - (1 << BASE_SHIFT)
}

#[cold]
#[inline(never)]
fn index_out_of_bounds(index: usize, end: usize) -> ! {
    panic!("region index {} is beyond the allocated end {}", index, end)
}

/// Lock-free readable, append-only growable array of atomics.
pub struct AtomicRegion<A: AtomicElement> {
    memory_manager: Arc<MemoryManager>,
    segments: Box<[OnceLock<Box<[A]>>]>,
    /// Elements covered by allocated segments.
    end: AtomicUsize,
    /// Largest element count this region may grow to.
    max_elements: usize,
    /// Serializes segment allocation; readers never take it.
    grow_lock: Mutex<()>,
}

impl<A: AtomicElement> AtomicRegion<A> {
    /// Creates an empty region that may grow to `max_elements`.
    pub fn new(memory_manager: Arc<MemoryManager>, max_elements: usize) -> Self {
        Self {
            memory_manager,
            segments: (0..MAX_SEGMENTS).map(|_| OnceLock::new()).collect(),
            end: AtomicUsize::new(0),
            max_elements,
            grow_lock: Mutex::new(()),
        }
    }

    /// Returns the number of elements backed by memory.
    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// Returns the growth limit.
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Returns true if `index` is backed by memory.
    #[inline]
    pub fn is_before_end(&self, index: usize) -> bool {
        index < self.end()
    }

    /// Returns the bytes held by allocated segments.
    pub fn allocated_bytes(&self) -> usize {
        self.end() * std::mem::size_of::<A>()
    }

    /// Makes sure elements `0..required_end` exist, zero-initialized.
    ///
    /// Returns false if the growth limit or the memory budget is hit; the
    /// region is left as it was before the failing segment.
    pub fn ensure_end_at_least(&self, required_end: usize) -> bool {
        if required_end > self.max_elements {
            return false;
        }
        if required_end <= self.end() {
            return true;
        }
        let _guard = self.grow_lock.lock();
        let mut end = self.end.load(Ordering::Acquire);
        while end < required_end {
            let (segment, _) = locate(end);
            let length = (1usize << BASE_SHIFT) << segment;
            let bytes = length * std::mem::size_of::<A>();
            if !self.memory_manager.allocate(bytes) {
                return false;
            }
            let storage: Box<[A]> = (0..length)
                .map(|_| A::new(A::Value::default()))
                .collect();
            if self.segments[segment].set(storage).is_err() {
                // Only reachable if `end` and the directory disagree.
                self.memory_manager.deallocate(bytes);
            }
            end = end_of_segment(segment);
            self.end.store(end, Ordering::Release);
        }
        true
    }

    /// Returns the atomic at `index`. Panics if `index` is not backed.
    #[inline(always)]
    pub fn slot(&self, index: usize) -> &A {
        let (segment, offset) = locate(index);
        match self.segments[segment].get() {
            Some(storage) => &storage[offset],
            None => index_out_of_bounds(index, self.end()),
        }
    }

    #[inline(always)]
    pub fn load(&self, index: usize, order: Ordering) -> A::Value {
        self.slot(index).load(order)
    }

    #[inline(always)]
    pub fn store(&self, index: usize, value: A::Value, order: Ordering) {
        self.slot(index).store(value, order)
    }

    /// Compare-and-swap; returns true if the element held `current`.
    #[inline(always)]
    pub fn compare_exchange(&self, index: usize, current: A::Value, new: A::Value) -> bool {
        self.slot(index)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stores `value` into every element of `start..end`.
    pub fn fill(&self, start: usize, end: usize, value: A::Value) {
        let end = end.min(self.end());
        for index in start..end {
            self.store(index, value, Ordering::Relaxed);
        }
    }

    /// Drops every segment and returns the memory to the budget.
    pub fn reset(&mut self) {
        let bytes = self.allocated_bytes();
        for segment in self.segments.iter_mut() {
            segment.take();
        }
        *self.end.get_mut() = 0;
        self.memory_manager.deallocate(bytes);
    }

    /// Writes elements `0..length` as one region.
    pub fn save<W: Write>(&self, output: &mut OutputStream<W>, length: usize) -> Result<()> {
        let length = length.min(self.end());
        output.write_region((0..length).map(|index| self.load(index, Ordering::Relaxed)))
    }

    /// Replaces the contents with a region read from `input`.
    /// Returns the number of elements read.
    pub fn load_from<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<usize> {
        self.reset();
        let region = &*self;
        input.read_region::<A::Value, _>(|index, value| {
            if !region.ensure_end_at_least(index + 1) {
                return Err(StoreError::OutOfMemory(format!(
                    "cannot grow region to {} elements",
                    index + 1
                )));
            }
            region.store(index, value, Ordering::Relaxed);
            Ok(())
        })
    }
}

impl<A: AtomicElement> Drop for AtomicRegion<A> {
    fn drop(&mut self) {
        let bytes = self.allocated_bytes();
        self.memory_manager.deallocate(bytes);
    }
}
