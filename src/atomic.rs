//! Atomic access to a shared-pointer *variable*, as opposed to the value it
//! points to. A [`Shared`] ownership group is already safe to use from many
//! threads through separate handle variables; what it does not allow is
//! several threads reassigning one and the same variable. [`AtomicShared`]
//! closes that gap with the call-site shape of the integer atomics.
//!
//! This layer is explicitly **not lock-free**: every operation takes a mutex
//! from a small static pool, keyed by the variable's address (striped, not
//! per-instance), for the duration of one field swap. Only the referenced
//! value's lifetime is lock-free; whole-variable replacement blocks.

use std::{cell::UnsafeCell, fmt, mem};

use spin::Mutex;

use crate::shared::Shared;

const SHARD_COUNT: usize = 32;

// Const item so the array repeat makes a fresh mutex per slot.
#[allow(clippy::declare_interior_mutable_const)]
const SHARD: Mutex<()> = Mutex::new(());
static SHARDS: [Mutex<()>; SHARD_COUNT] = [SHARD; SHARD_COUNT];

/// Pick the stripe for a variable. Low bits are dropped first since slots are
/// at least word-aligned.
fn shard_for(addr: usize) -> &'static Mutex<()> {
    &SHARDS[(addr >> 4) % SHARD_COUNT]
}

/// A shared-pointer variable that several threads may load, store, swap, and
/// compare-exchange concurrently.
///
/// ```
/// use std::thread;
/// use sharc::{AtomicShared, Shared};
///
/// let slot = AtomicShared::new(Shared::new(100));
/// thread::scope(|s| {
///     s.spawn(|| slot.store(Shared::new(200)));
///     s.spawn(|| {
///         let seen = slot.load();
///         assert!(*seen == 100 || *seen == 200);
///     });
/// });
/// ```
pub struct AtomicShared<T: ?Sized> {
    slot: UnsafeCell<Shared<T>>,
}

impl<T: ?Sized> AtomicShared<T> {
    /// Wrap an initial handle.
    pub fn new(value: Shared<T>) -> Self {
        AtomicShared {
            slot: UnsafeCell::new(value),
        }
    }

    /// Atomically clone the current handle out of the variable.
    /// ```
    /// use sharc::{AtomicShared, Shared};
    ///
    /// let slot = AtomicShared::new(Shared::new(100));
    /// assert_eq!(*slot.load(), 100);
    /// assert_eq!(Shared::use_count(&slot.load()), 2);
    /// ```
    pub fn load(&self) -> Shared<T> {
        let guard = shard_for(self.slot.get() as *const () as usize).lock();
        let current = unsafe { &*self.slot.get() }.clone();
        drop(guard);
        current
    }

    /// Atomically replace the current handle, dropping the old reference.
    pub fn store(&self, value: Shared<T>) {
        drop(self.swap(value));
    }

    /// Atomically replace the current handle, returning the previous one.
    /// ```
    /// use sharc::{AtomicShared, Shared};
    ///
    /// let slot = AtomicShared::new(Shared::new(1));
    /// let old = slot.swap(Shared::new(2));
    /// assert_eq!(*old, 1);
    /// assert_eq!(*slot.load(), 2);
    /// ```
    pub fn swap(&self, value: Shared<T>) -> Shared<T> {
        let guard = shard_for(self.slot.get() as *const () as usize).lock();
        let previous = mem::replace(unsafe { &mut *self.slot.get() }, value);
        drop(guard);
        // The displaced handle is released outside the stripe: its drop may
        // run an arbitrary destructor.
        previous
    }

    /// Atomically replace the current handle with `new` iff the variable still
    /// holds exactly `current` (same control block *and* same stored pointer,
    /// i.e. representation equality). On success the previous handle is
    /// returned; on failure `new` is handed back untouched and the caller can
    /// [`load`](AtomicShared::load) to observe what won.
    /// ```
    /// use sharc::{AtomicShared, Shared};
    ///
    /// let first = Shared::new(1);
    /// let slot = AtomicShared::new(first.clone());
    ///
    /// let stale = Shared::new(1);
    /// let second = Shared::new(2);
    /// let second_again = slot.compare_exchange(&stale, second).unwrap_err();
    ///
    /// let old = slot.compare_exchange(&first, second_again).unwrap();
    /// assert!(Shared::same_owner(&old, &first));
    /// assert_eq!(*slot.load(), 2);
    /// ```
    pub fn compare_exchange(
        &self,
        current: &Shared<T>,
        new: Shared<T>,
    ) -> Result<Shared<T>, Shared<T>> {
        let guard = shard_for(self.slot.get() as *const () as usize).lock();
        let slot = unsafe { &mut *self.slot.get() };
        let matches = Shared::same_owner(slot, current)
            && std::ptr::addr_eq(Shared::as_ptr(slot), Shared::as_ptr(current));
        if matches {
            let previous = mem::replace(slot, new);
            drop(guard);
            Ok(previous)
        } else {
            drop(guard);
            Err(new)
        }
    }

    /// Unwrap the variable, returning the handle inside. Takes `self` by
    /// value, so no locking is needed.
    pub fn into_inner(self) -> Shared<T> {
        self.slot.into_inner()
    }
}

impl<T> Default for AtomicShared<T> {
    /// A variable holding the empty handle.
    fn default() -> Self {
        AtomicShared::new(Shared::default())
    }
}

impl<T: ?Sized> fmt::Debug for AtomicShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicShared").finish_non_exhaustive()
    }
}

unsafe impl<T: ?Sized + Sync + Send> Send for AtomicShared<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for AtomicShared<T> {}
