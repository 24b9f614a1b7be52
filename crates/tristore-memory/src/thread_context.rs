//! Per-thread object locks with rare exclusive promotion.
//!
//! Every registered thread owns one spin-lock per protected object. A shared
//! section locks only the caller's own slot, so readers and writers of the
//! same structure never touch each other's cache lines. An exclusive holder
//! takes every other thread's slot for that object, draining their shared
//! sections.
//!
//! The list of registered threads is itself guarded by an update counter:
//! promoters enumerate the list inside a concurrent-update section (counter
//! incremented), while registration and deregistration run as manager
//! updates (counter set to -1 once it drops to zero).

use parking_lot::Mutex;
use std::cell::{Cell, UnsafeCell};
use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;
use tristore_common::{Result, StoreError, MAX_THREAD_CONTEXT_ID};

/// One thread's lock slots, indexed by object id.
struct ContextLocks {
    id: u32,
    locks: Box<[AtomicBool]>,
}

impl ContextLocks {
    #[inline]
    fn lock(&self, object_id: usize) {
        let slot = &self.locks[object_id];
        while slot
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while slot.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self, object_id: usize) {
        self.locks[object_id].store(false, Ordering::Release);
    }
}

/// Free-id bookkeeping, only touched during manager updates.
struct IdPools {
    used_context_ids: Vec<bool>,
    used_object_ids: Vec<bool>,
}

impl IdPools {
    fn take_smallest(used: &mut [bool], start: usize) -> Option<usize> {
        let id = (start..used.len()).find(|&id| !used[id])?;
        used[id] = true;
        Some(id)
    }
}

struct RegistryShared {
    /// > 0: concurrent updates in progress; -1: manager update in progress.
    update_counter: AtomicI64,
    contexts: UnsafeCell<Vec<Arc<ContextLocks>>>,
    ids: Mutex<IdPools>,
    max_objects: usize,
}

// `contexts` is read only inside concurrent-update sections and written only
// inside manager-update sections; the update counter excludes the two.
unsafe impl Sync for RegistryShared {}
unsafe impl Send for RegistryShared {}

impl RegistryShared {
    fn start_concurrent_update(&self) {
        loop {
            let current = self.update_counter.load(Ordering::Acquire);
            if current >= 0
                && self
                    .update_counter
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            hint::spin_loop();
        }
    }

    fn finish_concurrent_update(&self) {
        self.update_counter.fetch_sub(1, Ordering::AcqRel);
    }

    fn start_manager_update(&self) {
        while self
            .update_counter
            .compare_exchange_weak(0, -1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    fn finish_manager_update(&self) {
        self.update_counter.store(0, Ordering::Release);
    }

    /// # Safety
    /// Caller must be inside a concurrent-update or manager-update section.
    unsafe fn contexts(&self) -> &[Arc<ContextLocks>] {
        &*self.contexts.get()
    }

    /// # Safety
    /// Caller must be inside a manager-update section.
    #[allow(clippy::mut_from_ref)]
    unsafe fn contexts_mut(&self) -> &mut Vec<Arc<ContextLocks>> {
        &mut *self.contexts.get()
    }
}

/// Registry of worker threads and protected objects.
///
/// Cloning is cheap; all clones refer to the same registry.
#[derive(Clone)]
pub struct ThreadContextRegistry {
    shared: Arc<RegistryShared>,
}

impl ThreadContextRegistry {
    /// Creates a registry that can protect up to `max_objects` objects.
    pub fn new(max_objects: usize) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                update_counter: AtomicI64::new(0),
                contexts: UnsafeCell::new(Vec::new()),
                ids: Mutex::new(IdPools {
                    used_context_ids: vec![false; MAX_THREAD_CONTEXT_ID as usize + 1],
                    used_object_ids: vec![false; max_objects],
                }),
                max_objects,
            }),
        }
    }

    /// Registers the calling thread and returns its context.
    ///
    /// The context receives the smallest free id in `1..=MAX_THREAD_CONTEXT_ID`.
    pub fn register(&self) -> Result<ThreadContext> {
        let id = IdPools::take_smallest(&mut self.shared.ids.lock().used_context_ids, 1).ok_or(
            StoreError::ThreadContextsExhausted {
                max: MAX_THREAD_CONTEXT_ID as usize,
            },
        )? as u32;

        let locks = Arc::new(ContextLocks {
            id,
            locks: (0..self.shared.max_objects)
                .map(|_| AtomicBool::new(false))
                .collect(),
        });

        self.shared.start_manager_update();
        // SAFETY: inside a manager update.
        unsafe { self.shared.contexts_mut().push(Arc::clone(&locks)) };
        self.shared.finish_manager_update();

        debug!(thread_context_id = id, "registered thread context");
        Ok(ThreadContext {
            shared: Arc::clone(&self.shared),
            locks,
            _not_sync: PhantomData,
        })
    }

    /// Returns the number of registered thread contexts.
    pub fn registered_contexts(&self) -> usize {
        self.shared.start_concurrent_update();
        // SAFETY: inside a concurrent update.
        let count = unsafe { self.shared.contexts().len() };
        self.shared.finish_concurrent_update();
        count
    }

    /// Returns the number of live object descriptors.
    pub fn objects_in_use(&self) -> usize {
        self.shared
            .ids
            .lock()
            .used_object_ids
            .iter()
            .filter(|used| **used)
            .count()
    }

    /// Returns the size of the object-id pool.
    pub fn max_objects(&self) -> usize {
        self.shared.max_objects
    }
}

impl std::fmt::Debug for ThreadContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContextRegistry")
            .field("max_objects", &self.shared.max_objects)
            .finish()
    }
}

/// Handle of one registered worker thread. Deregisters on drop.
pub struct ThreadContext {
    shared: Arc<RegistryShared>,
    locks: Arc<ContextLocks>,
    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadContext {
    /// Returns this context's id (never 0).
    #[inline]
    pub fn id(&self) -> u32 {
        self.locks.id
    }

    /// Enters a shared section on `object`.
    ///
    /// Spins while another thread holds the object exclusively, then takes
    /// this thread's own slot.
    pub fn lock_object_shared(&self, object: &ObjectDescriptor) {
        while object.exclusive_thread_context_id.load(Ordering::Acquire) != 0 {
            hint::spin_loop();
        }
        self.locks.lock(object.object_id);
    }

    /// Leaves a shared section on `object`.
    pub fn unlock_object_shared(&self, object: &ObjectDescriptor) {
        self.locks.unlock(object.object_id);
    }

    /// Enters a shared section released when the guard drops.
    pub fn lock_shared<'a>(&'a self, object: &'a ObjectDescriptor) -> SharedObjectGuard<'a> {
        self.lock_object_shared(object);
        SharedObjectGuard {
            context: self,
            object,
        }
    }

    /// Upgrades the caller's shared section on `object` to an exclusive one.
    ///
    /// Returns false if another thread won the promotion; in that case the
    /// caller's shared lock has been released and re-acquired after the
    /// winner finished, so any cached view of the object is stale.
    pub fn try_promote_shared_lock_to_exclusive(&self, object: &ObjectDescriptor) -> bool {
        if object
            .exclusive_thread_context_id
            .compare_exchange(0, self.id(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.start_concurrent_update();
            // SAFETY: inside a concurrent update until the matching downgrade.
            for context in unsafe { self.shared.contexts() } {
                if context.id != self.id() {
                    context.lock(object.object_id);
                }
            }
            true
        } else {
            self.unlock_object_shared(object);
            self.lock_object_shared(object);
            false
        }
    }

    /// Releases the exclusive section taken by a successful promotion; the
    /// caller keeps its shared lock.
    pub fn downgrade_exclusive_lock_to_shared(&self, object: &ObjectDescriptor) {
        debug_assert_eq!(
            object.exclusive_thread_context_id.load(Ordering::Relaxed),
            self.id()
        );
        // SAFETY: still inside the concurrent update started by the promotion.
        for context in unsafe { self.shared.contexts() } {
            if context.id != self.id() {
                context.unlock(object.object_id);
            }
        }
        self.shared.finish_concurrent_update();
        object
            .exclusive_thread_context_id
            .store(0, Ordering::Release);
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        let id = self.locks.id;
        self.shared.start_manager_update();
        // SAFETY: inside a manager update.
        unsafe { self.shared.contexts_mut().retain(|context| context.id != id) };
        self.shared.finish_manager_update();
        self.shared.ids.lock().used_context_ids[id as usize] = false;
        debug!(thread_context_id = id, "deregistered thread context");
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext").field("id", &self.id()).finish()
    }
}

/// Lock identity of one protected structure. Releases its id on drop.
pub struct ObjectDescriptor {
    shared: Arc<RegistryShared>,
    object_id: usize,
    /// Id of the context holding the object exclusively, 0 if none.
    exclusive_thread_context_id: AtomicU32,
}

impl ObjectDescriptor {
    /// Allocates the smallest free object id.
    pub fn new(registry: &ThreadContextRegistry) -> Result<Self> {
        let shared = &registry.shared;
        let object_id = IdPools::take_smallest(&mut shared.ids.lock().used_object_ids, 0)
            .ok_or(StoreError::ObjectIdsExhausted {
                max: shared.max_objects,
            })?;
        Ok(Self {
            shared: Arc::clone(shared),
            object_id,
            exclusive_thread_context_id: AtomicU32::new(0),
        })
    }

    /// Returns the object id.
    pub fn object_id(&self) -> usize {
        self.object_id
    }

    /// Returns the id of the exclusive holder, or 0.
    pub fn exclusive_holder(&self) -> u32 {
        self.exclusive_thread_context_id.load(Ordering::Acquire)
    }
}

impl Drop for ObjectDescriptor {
    fn drop(&mut self) {
        self.shared.ids.lock().used_object_ids[self.object_id] = false;
    }
}

impl std::fmt::Debug for ObjectDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDescriptor")
            .field("object_id", &self.object_id)
            .field("exclusive_holder", &self.exclusive_holder())
            .finish()
    }
}

/// Shared section on an object, released on drop.
pub struct SharedObjectGuard<'a> {
    context: &'a ThreadContext,
    object: &'a ObjectDescriptor,
}

impl<'a> SharedObjectGuard<'a> {
    /// See `ThreadContext::try_promote_shared_lock_to_exclusive`.
    pub fn try_promote(&self) -> bool {
        self.context.try_promote_shared_lock_to_exclusive(self.object)
    }

    /// See `ThreadContext::downgrade_exclusive_lock_to_shared`.
    pub fn downgrade(&self) {
        self.context.downgrade_exclusive_lock_to_shared(self.object)
    }

    /// Context that holds the shared section.
    pub fn context(&self) -> &'a ThreadContext {
        self.context
    }
}

impl Drop for SharedObjectGuard<'_> {
    fn drop(&mut self) {
        self.context.unlock_object_shared(self.object);
    }
}
