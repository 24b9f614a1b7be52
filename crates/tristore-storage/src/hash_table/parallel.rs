use super::{BucketDescriptor, BucketPolicy, BucketStatus, IN_INSERTION};
use crate::triple_list::TripleList;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::hint;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use tristore_common::{
    Result, StoreError, TupleIndex, PARALLEL_HASH_TABLE_WINDOW_FACTOR, RESIZE_CHUNK_SIZE,
};
use tristore_memory::{
    InputStream, MemoryManager, ObjectDescriptor, OutputStream, ThreadContext,
    ThreadContextRegistry,
};

const TAG: &str = "ParallelHashTable";

const BUCKET_SIZE: usize = std::mem::size_of::<AtomicU64>();

/// Bucket arrays; replaced only under the exclusive lock or `&mut self`.
struct TableState {
    buckets: Box<[AtomicU64]>,
    /// Source of an in-progress or finished migration; freed by the next resize.
    old_buckets: Option<Box<[AtomicU64]>>,
    mask: usize,
    resize_threshold: usize,
}

fn zeroed_buckets(count: usize) -> Box<[AtomicU64]> {
    (0..count).map(|_| AtomicU64::new(0)).collect()
}

#[inline(always)]
fn read_contents(bucket: &AtomicU64) -> TupleIndex {
    loop {
        let contents = bucket.load(Ordering::Acquire);
        if contents != IN_INSERTION.0 {
            return TupleIndex(contents);
        }
        hint::spin_loop();
    }
}

/// Hash table supporting concurrent inserts and lookups.
///
/// Every operation runs inside a shared section on the table's object
/// descriptor. A thread that finds the table too full promotes to exclusive,
/// swaps in a bucket array twice the size and downgrades; the old buckets are
/// then migrated in chunks of `RESIZE_CHUNK_SIZE` by every thread that
/// enters a search until the last chunk is done.
///
/// Used-bucket counts are kept per thread and folded into the global count
/// once a thread's window fills, so inserts do not contend on one counter.
pub struct ParallelHashTable<P: BucketPolicy> {
    policy: P,
    memory_manager: Arc<MemoryManager>,
    object: ObjectDescriptor,
    load_factor: f64,
    state: UnsafeCell<TableState>,
    number_of_buckets: AtomicUsize,
    used_buckets: AtomicUsize,
    resize_failed: AtomicBool,
    number_of_threads: usize,
    local_insertion_counts: Box<[CachePadded<AtomicUsize>]>,
    counter_window_per_thread: AtomicUsize,
    resize_threshold_minus_safety: AtomicUsize,
    resize_chunks: AtomicUsize,
    next_resize_chunk: AtomicUsize,
    resize_chunks_to_finish: AtomicUsize,
}

// `state` is only written while every other thread is locked out (exclusive
// lock or `&mut self`), and only read inside shared sections.
unsafe impl<P: BucketPolicy> Sync for ParallelHashTable<P> {}

impl<P: BucketPolicy> ParallelHashTable<P> {
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        registry: &ThreadContextRegistry,
        policy: P,
        load_factor: f64,
        number_of_threads: usize,
    ) -> Result<Self> {
        let number_of_threads = number_of_threads.max(1);
        Ok(Self {
            policy,
            memory_manager,
            object: ObjectDescriptor::new(registry)?,
            load_factor,
            state: UnsafeCell::new(TableState {
                buckets: Box::new([]),
                old_buckets: None,
                mask: 0,
                resize_threshold: 0,
            }),
            number_of_buckets: AtomicUsize::new(0),
            used_buckets: AtomicUsize::new(0),
            resize_failed: AtomicBool::new(false),
            number_of_threads,
            local_insertion_counts: (0..number_of_threads)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            counter_window_per_thread: AtomicUsize::new(0),
            resize_threshold_minus_safety: AtomicUsize::new(0),
            resize_chunks: AtomicUsize::new(0),
            next_resize_chunk: AtomicUsize::new(0),
            resize_chunks_to_finish: AtomicUsize::new(0),
        })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// # Safety
    /// Caller must hold a shared section on `self.object`, or `&mut self`.
    #[inline(always)]
    unsafe fn state(&self) -> &TableState {
        &*self.state.get()
    }

    /// Frees both bucket arrays and returns their bytes to the budget.
    fn release_buckets(state: &mut TableState, memory_manager: &MemoryManager) {
        let mut bytes = state.buckets.len() * BUCKET_SIZE;
        if let Some(old) = state.old_buckets.take() {
            bytes += old.len() * BUCKET_SIZE;
        }
        state.buckets = Box::new([]);
        memory_manager.deallocate(bytes);
    }

    /// Empties the table and sizes it to `number_of_buckets` (a power of two).
    pub fn initialize(&mut self, number_of_buckets: usize) -> bool {
        if !number_of_buckets.is_power_of_two() {
            return false;
        }
        let state = self.state.get_mut();
        Self::release_buckets(state, &self.memory_manager);
        if !self
            .memory_manager
            .allocate(number_of_buckets * BUCKET_SIZE)
        {
            return false;
        }
        state.buckets = zeroed_buckets(number_of_buckets);
        state.mask = number_of_buckets - 1;
        state.resize_threshold = (number_of_buckets as f64 * self.load_factor) as usize;
        *self.number_of_buckets.get_mut() = number_of_buckets;
        *self.used_buckets.get_mut() = 0;
        *self.resize_failed.get_mut() = false;
        for count in self.local_insertion_counts.iter() {
            count.store(0, Ordering::Relaxed);
        }
        *self.resize_chunks.get_mut() = 0;
        *self.next_resize_chunk.get_mut() = 0;
        *self.resize_chunks_to_finish.get_mut() = 0;
        self.initialize_counter_window();
        true
    }

    fn initialize_counter_window(&self) {
        let number_of_buckets = self.number_of_buckets.load(Ordering::Acquire);
        // SAFETY: called under `&mut self` or the exclusive lock.
        let resize_threshold = unsafe { self.state() }.resize_threshold;
        let window = (PARALLEL_HASH_TABLE_WINDOW_FACTOR * number_of_buckets as f64
            / self.number_of_threads as f64) as usize;
        self.counter_window_per_thread
            .store(window, Ordering::Release);
        self.resize_threshold_minus_safety.store(
            resize_threshold.saturating_sub(window * (self.number_of_threads - 1)),
            Ordering::Release,
        );
    }

    /// Changes the number of insertion counters, folding the current local
    /// counts into the global one.
    pub fn set_number_of_threads(&mut self, number_of_threads: usize) {
        let pending: usize = self
            .local_insertion_counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum();
        *self.used_buckets.get_mut() += pending;
        self.number_of_threads = number_of_threads.max(1);
        self.local_insertion_counts = (0..self.number_of_threads)
            .map(|_| CachePadded::new(AtomicUsize::new(0)))
            .collect();
        self.initialize_counter_window();
    }

    pub fn number_of_threads(&self) -> usize {
        self.number_of_threads
    }

    pub fn number_of_buckets(&self) -> usize {
        self.number_of_buckets.load(Ordering::Acquire)
    }

    /// Returns the global count plus every thread's unpublished count.
    pub fn number_of_used_buckets(&self) -> usize {
        self.used_buckets.load(Ordering::Acquire)
            + self
                .local_insertion_counts
                .iter()
                .map(|count| count.load(Ordering::Acquire))
                .sum::<usize>()
    }

    pub fn resize_failed(&self) -> bool {
        self.resize_failed.load(Ordering::Acquire)
    }

    /// Bytes held by the bucket array.
    pub fn size_in_bytes(&self) -> usize {
        self.number_of_buckets() * BUCKET_SIZE
    }

    #[inline(always)]
    fn local_insertion_count(&self, context: &ThreadContext) -> &AtomicUsize {
        &self.local_insertion_counts[context.id() as usize % self.number_of_threads]
    }

    #[inline(always)]
    fn resize_needed(&self, context: &ThreadContext) -> bool {
        self.used_buckets.load(Ordering::Acquire)
            + self.local_insertion_count(context).load(Ordering::Acquire)
            > self.resize_threshold_minus_safety.load(Ordering::Acquire)
    }

    /// Enters a shared section and starts a search for `key`.
    pub fn acquire_bucket<'a>(
        &'a self,
        context: &'a ThreadContext,
        key: &P::Key,
    ) -> BucketGuard<'a, P> {
        context.lock_object_shared(&self.object);
        BucketGuard {
            table: self,
            context,
            descriptor: BucketDescriptor::new(self.policy.hash_key(key)),
        }
    }

    fn continue_bucket_search<L: TripleList + ?Sized>(
        &self,
        context: &ThreadContext,
        list: &L,
        descriptor: &mut BucketDescriptor,
        key: &P::Key,
    ) -> BucketStatus {
        loop {
            if self.resize_chunks.load(Ordering::Acquire) != 0 {
                self.do_resize(list);
            }
            if self.resize_needed(context) && !self.resize_failed() {
                descriptor.bucket = None;
                self.start_resize(context);
                continue;
            }
            let status = self.probe(list, descriptor, key);
            if status != BucketStatus::NotContains || self.resize_failed() {
                return status;
            }
            descriptor.bucket = None;
        }
    }

    /// Linear probe over the current buckets; one full lap at most.
    fn probe<L: TripleList + ?Sized>(
        &self,
        list: &L,
        descriptor: &mut BucketDescriptor,
        key: &P::Key,
    ) -> BucketStatus {
        // SAFETY: the caller holds a shared section.
        let state = unsafe { self.state() };
        let start = descriptor
            .bucket
            .unwrap_or(descriptor.hash_code as usize & state.mask);
        let mut bucket = start;
        let mut status;
        loop {
            descriptor.contents = read_contents(&state.buckets[bucket]);
            status = self.policy.bucket_status(list, descriptor.contents, key);
            if status != BucketStatus::NotContains {
                break;
            }
            bucket = (bucket + 1) & state.mask;
            if bucket == start {
                break;
            }
        }
        descriptor.bucket = Some(bucket);
        status
    }

    /// Doubles the bucket array if this thread wins the exclusive lock.
    fn start_resize(&self, context: &ThreadContext) {
        debug_assert_eq!(self.resize_chunks.load(Ordering::Acquire), 0);
        if !context.try_promote_shared_lock_to_exclusive(&self.object) {
            return;
        }
        // SAFETY: every other thread is outside its shared section.
        let state = unsafe { &mut *self.state.get() };
        if let Some(old) = state.old_buckets.take() {
            self.memory_manager.deallocate(old.len() * BUCKET_SIZE);
        }
        let old_number_of_buckets = state.buckets.len();
        let new_number_of_buckets = 2 * old_number_of_buckets;
        if self
            .memory_manager
            .allocate(new_number_of_buckets * BUCKET_SIZE)
        {
            debug!(
                table = %self.policy.name(),
                from = old_number_of_buckets,
                to = new_number_of_buckets,
                "resizing parallel hash table"
            );
            let old = std::mem::replace(&mut state.buckets, zeroed_buckets(new_number_of_buckets));
            state.old_buckets = Some(old);
            state.mask = new_number_of_buckets - 1;
            state.resize_threshold = (new_number_of_buckets as f64 * self.load_factor) as usize;
            self.number_of_buckets
                .store(new_number_of_buckets, Ordering::Release);
            let chunks = old_number_of_buckets.div_ceil(RESIZE_CHUNK_SIZE);
            self.next_resize_chunk.store(0, Ordering::Release);
            self.resize_chunks_to_finish
                .store(chunks, Ordering::Release);
            self.resize_chunks.store(chunks, Ordering::Release);
            self.initialize_counter_window();
        } else {
            warn!(
                table = %self.policy.name(),
                buckets = old_number_of_buckets,
                "hash table resize failed"
            );
            self.resize_failed.store(true, Ordering::Release);
        }
        context.downgrade_exclusive_lock_to_shared(&self.object);
    }

    /// Migrates chunks of the old buckets until none are left, then waits for
    /// the threads still working on theirs.
    fn do_resize<L: TripleList + ?Sized>(&self, list: &L) {
        // SAFETY: the caller holds a shared section.
        let state = unsafe { self.state() };
        let chunks = self.resize_chunks.load(Ordering::Acquire);
        let mut remaining = None;
        if let Some(old) = state.old_buckets.as_deref() {
            loop {
                let chunk = self.next_resize_chunk.fetch_add(1, Ordering::AcqRel);
                if chunk >= chunks {
                    break;
                }
                let start = chunk * RESIZE_CHUNK_SIZE;
                let end = (start + RESIZE_CHUNK_SIZE).min(old.len());
                for old_bucket in &old[start..end] {
                    let contents = old_bucket.load(Ordering::Acquire);
                    if contents == 0 {
                        continue;
                    }
                    let mut bucket =
                        self.policy.hash_tuple(list, TupleIndex(contents)) as usize & state.mask;
                    while state.buckets[bucket]
                        .compare_exchange(0, contents, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        bucket = (bucket + 1) & state.mask;
                    }
                }
                remaining = Some(self.resize_chunks_to_finish.fetch_sub(1, Ordering::AcqRel) - 1);
            }
        }
        if remaining == Some(0) {
            self.resize_chunks.store(0, Ordering::Release);
        } else {
            while self.resize_chunks.load(Ordering::Acquire) != 0 {
                hint::spin_loop();
            }
        }
    }

    fn acknowledge_insert(&self, context: &ThreadContext) {
        let local = self.local_insertion_count(context);
        if local.fetch_add(1, Ordering::AcqRel) + 1
            >= self.counter_window_per_thread.load(Ordering::Acquire)
        {
            let flushed = local.swap(0, Ordering::AcqRel);
            self.used_buckets.fetch_add(flushed, Ordering::AcqRel);
        }
    }

    pub fn save<W: Write>(&mut self, output: &mut OutputStream<W>) -> Result<()> {
        let state = self.state.get_mut();
        output.write_string(TAG)?;
        output.write_u64(state.buckets.len() as u64)?;
        output.write_u64(state.resize_threshold as u64)?;
        output.write_bool(self.resize_failed.load(Ordering::Relaxed))?;
        output.write_u64(self.used_buckets.load(Ordering::Relaxed) as u64)?;
        output.write_u64(self.number_of_threads as u64)?;
        for count in self.local_insertion_counts.iter() {
            output.write_u64(count.load(Ordering::Relaxed) as u64)?;
        }
        output.write_region(
            state
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed)),
        )
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        let number_of_buckets = input.read_u64()? as usize;
        let resize_threshold = input.read_u64()? as usize;
        let resize_failed = input.read_bool()?;
        let mut used_buckets = input.read_u64()? as usize;
        let threads_in_stream = input.read_u64()? as usize;
        let mut local_counts = vec![0usize; self.number_of_threads];
        for thread_index in 0..threads_in_stream {
            let count = input.read_u64()? as usize;
            match local_counts.get_mut(thread_index) {
                Some(local) => *local = count,
                None => used_buckets += count,
            }
        }
        let buckets: Vec<u64> = input.read_region_vec()?;
        if !number_of_buckets.is_power_of_two() || buckets.len() != number_of_buckets {
            return Err(StoreError::invalid_format(
                TAG,
                format!(
                    "{} buckets declared, {} stored",
                    number_of_buckets,
                    buckets.len()
                ),
            ));
        }

        let state = self.state.get_mut();
        Self::release_buckets(state, &self.memory_manager);
        if !self
            .memory_manager
            .allocate(number_of_buckets * BUCKET_SIZE)
        {
            return Err(StoreError::OutOfMemory(format!(
                "cannot hold {} hash buckets",
                number_of_buckets
            )));
        }
        state.buckets = buckets.into_iter().map(AtomicU64::new).collect();
        state.mask = number_of_buckets - 1;
        state.resize_threshold = resize_threshold;
        *self.number_of_buckets.get_mut() = number_of_buckets;
        *self.used_buckets.get_mut() = used_buckets;
        *self.resize_failed.get_mut() = resize_failed;
        for (local, count) in self.local_insertion_counts.iter().zip(local_counts) {
            local.store(count, Ordering::Relaxed);
        }
        *self.resize_chunks.get_mut() = 0;
        *self.next_resize_chunk.get_mut() = 0;
        *self.resize_chunks_to_finish.get_mut() = 0;
        self.initialize_counter_window();
        Ok(())
    }
}

impl<P: BucketPolicy> Drop for ParallelHashTable<P> {
    fn drop(&mut self) {
        Self::release_buckets(self.state.get_mut(), &self.memory_manager);
    }
}

/// A search in progress; holds the table's shared section until dropped.
pub struct BucketGuard<'a, P: BucketPolicy> {
    table: &'a ParallelHashTable<P>,
    context: &'a ThreadContext,
    descriptor: BucketDescriptor,
}

impl<'a, P: BucketPolicy> BucketGuard<'a, P> {
    /// Continues probing from the current bucket, helping with or starting
    /// a resize when needed.
    ///
    /// `NotContains` is only returned when the table is full and could not
    /// grow.
    pub fn continue_search<L: TripleList + ?Sized>(
        &mut self,
        list: &L,
        key: &P::Key,
    ) -> BucketStatus {
        self.table
            .continue_bucket_search(self.context, list, &mut self.descriptor, key)
    }

    /// Contents of the bucket the search stopped at.
    pub fn contents(&self) -> TupleIndex {
        self.descriptor.contents
    }

    pub fn descriptor(&self) -> &BucketDescriptor {
        &self.descriptor
    }

    pub fn context(&self) -> &'a ThreadContext {
        self.context
    }

    #[inline(always)]
    fn bucket(&self) -> Option<&AtomicU64> {
        // SAFETY: the guard holds a shared section.
        let state = unsafe { self.table.state() };
        self.descriptor.bucket.map(|bucket| &state.buckets[bucket])
    }

    /// Claims the empty bucket the search stopped at by marking it
    /// `IN_INSERTION`. Returns false if another thread claimed it first;
    /// the caller should then continue the search.
    pub fn start_insertion_conditional(&mut self) -> bool {
        self.bucket().is_some_and(|bucket| {
            bucket
                .compare_exchange(0, IN_INSERTION.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Publishes `index` in the claimed bucket.
    pub fn set_contents(&mut self, index: TupleIndex) {
        if let Some(bucket) = self.bucket() {
            bucket.store(index.0, Ordering::Release);
        }
        self.descriptor.contents = index;
    }

    /// Counts the bucket as used.
    pub fn acknowledge_insert(&mut self) {
        self.table.acknowledge_insert(self.context);
    }
}

impl<P: BucketPolicy> Drop for BucketGuard<'_, P> {
    fn drop(&mut self) {
        self.context.unlock_object_shared(&self.table.object);
    }
}
