//! The control block: the out-of-line (or co-located) metadata object holding
//! both reference counts and the destruction/allocation strategy of a
//! [`Shared`](crate::Shared) ownership group.
//!
//! Two concrete layouts exist. [`PtrBlock`] adopts a pointer that was
//! allocated elsewhere and carries a deleter plus the allocator that produced
//! the block itself. [`InlineBlock`] embeds the value's storage directly after
//! the counters, so the whole group costs a single allocation. Which layout a
//! group uses is decided once, at construction, and stored as data: the block
//! header carries plain function pointers for "destroy the value" and
//! "destroy the block storage" instead of a trait object.

use std::{
    alloc::{alloc, dealloc, Layout},
    any::TypeId,
    error::Error,
    fmt::{self, Display},
    mem::{ManuallyDrop, MaybeUninit},
    ptr::{self, addr_of_mut, NonNull},
    sync::atomic::{fence, AtomicUsize, Ordering},
};

#[cfg(not(target_has_atomic = "ptr"))]
compile_error!("Cannot use `sharc` on a system without atomics.");

pub(crate) const MAX_REFCOUNT: usize = (isize::MAX) as usize;

/// Allocation of a control block failed.
///
/// The would-be-owned value does not leak when this is returned: the adoption
/// paths run the destruction strategy on it exactly once before surfacing the
/// error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

impl Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("control block allocation failed")
    }
}

impl Error for AllocError {}

/// A checked promotion found the observed value already destroyed.
///
/// Returned by the `TryFrom<&Weak<T>>` promotion path; distinguishable from
/// [`AllocError`] by type, as the two failures have different recoveries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DanglingWeak;

impl Display for DanglingWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("promotion of a dangling weak reference")
    }
}

impl Error for DanglingWeak {}

/// Destruction strategy for an adopted pointer, invoked as `deleter(ptr)`.
///
/// The strategy is consumed by the call and runs at most once per ownership
/// group, when the last strong handle is dropped. Whether the value's memory
/// is released is the deleter's business; the block's own storage always goes
/// back through the [`BlockAlloc`] that produced it.
///
/// Any `FnOnce(*mut T)` is a deleter:
/// ```
/// use sharc::Shared;
///
/// let value = Box::into_raw(Box::new(100));
/// let deleter = |p: *mut i32| drop(unsafe { Box::from_raw(p) });
/// let shared = unsafe { Shared::adopt_with(value, deleter) };
/// assert_eq!(*shared, 100);
/// ```
pub trait Deleter<T: ?Sized> {
    /// Destroy the value behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must be the pointer this strategy was paired with at adoption,
    /// still valid, and never used again after the call.
    unsafe fn destroy(self, ptr: *mut T);
}

impl<T: ?Sized, F: FnOnce(*mut T)> Deleter<T> for F {
    unsafe fn destroy(self, ptr: *mut T) {
        self(ptr)
    }
}

/// The default destruction strategy: destroy and free via the matching
/// allocation, i.e. reconstitute and drop the [`Box`] the pointer came from.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDeleter;

impl<T: ?Sized> Deleter<T> for DefaultDeleter {
    unsafe fn destroy(self, ptr: *mut T) {
        drop(Box::from_raw(ptr));
    }
}

/// Allocation strategy for control-block storage.
///
/// The strategy must be copyable because whichever block it creates stores a
/// copy of it and frees itself through that copy later.
pub trait BlockAlloc: Clone {
    /// Allocate `layout.size()` bytes at `layout.align()`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Return memory obtained from [`allocate`](BlockAlloc::allocate) with the
    /// same layout.
    ///
    /// # Safety
    /// `ptr` must denote a live allocation made by this strategy with `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global-heap allocation strategy, built on [`std::alloc`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Global;

impl BlockAlloc for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        // Control blocks always contain at least the counters, so the layout
        // is never zero-sized.
        debug_assert!(layout.size() != 0);
        NonNull::new(unsafe { alloc(layout) }).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        dealloc(ptr.as_ptr(), layout);
    }
}

/// Common header of every control block. `#[repr(C)]` so a pointer to either
/// concrete block layout is a pointer to its header.
///
/// The weak count carries one unit per live strong reference in addition to
/// one per weak handle, so `strong > 0` implies `weak > 0` and the block
/// storage can never be freed before the value is destroyed.
#[repr(C)]
pub(crate) struct ControlBlock {
    strong: AtomicUsize,
    weak: AtomicUsize,
    destroy_value: unsafe fn(*mut ControlBlock),
    destroy_block: unsafe fn(*mut ControlBlock),
    deleter_lookup: unsafe fn(*mut ControlBlock, TypeId) -> Option<NonNull<()>>,
}

type DestroyFn = unsafe fn(*mut ControlBlock);
type LookupFn = unsafe fn(*mut ControlBlock, TypeId) -> Option<NonNull<()>>;

impl ControlBlock {
    /// Header for a block born with one strong reference.
    fn new(destroy_value: DestroyFn, destroy_block: DestroyFn, deleter_lookup: LookupFn) -> Self {
        ControlBlock {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            destroy_value,
            destroy_block,
            deleter_lookup,
        }
    }

    /// Header for a block whose value is not yet initialized; the strong count
    /// is published later, after the value has been written.
    fn new_unpublished(
        destroy_value: DestroyFn,
        destroy_block: DestroyFn,
        deleter_lookup: LookupFn,
    ) -> Self {
        ControlBlock {
            strong: AtomicUsize::new(0),
            weak: AtomicUsize::new(1),
            destroy_value,
            destroy_block,
            deleter_lookup,
        }
    }

    /// Take one more strong reference, and the weak unit that travels with it.
    ///
    /// # Safety
    /// `this` must point to a live control block with `strong > 0`.
    pub(crate) unsafe fn addref(this: NonNull<ControlBlock>) {
        let prev = this.as_ref().strong.fetch_add(1, Ordering::Relaxed);
        if prev > MAX_REFCOUNT {
            panic!("Overflow of maximum strong reference count.");
        }
        Self::weak_addref(this);
    }

    /// # Safety
    /// `this` must point to a live control block.
    pub(crate) unsafe fn weak_addref(this: NonNull<ControlBlock>) {
        let prev = this.as_ref().weak.fetch_add(1, Ordering::Relaxed);
        if prev > MAX_REFCOUNT {
            panic!("Overflow of maximum weak reference count.");
        }
    }

    /// Drop one strong reference. The release decrement paired with the
    /// acquire fence on the transition to zero makes every write by other
    /// strong holders visible before the value's destructor runs.
    ///
    /// # Safety
    /// `this` must point to a live control block holding a strong reference
    /// owned by the caller. Releasing a block with `strong == 0` is a
    /// programming defect, not a recoverable condition.
    pub(crate) unsafe fn release(this: NonNull<ControlBlock>) {
        let prev = this.as_ref().strong.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0, "released a control block with no strong references");
        if prev == 1 {
            fence(Ordering::Acquire);
            let destroy_value = this.as_ref().destroy_value;
            destroy_value(this.as_ptr());
        }
        Self::weak_release(this);
    }

    /// Drop one weak unit; frees the block storage when the last unit goes.
    ///
    /// # Safety
    /// `this` must point to a live control block holding a weak unit owned by
    /// the caller. The block must not be touched after this call.
    pub(crate) unsafe fn weak_release(this: NonNull<ControlBlock>) {
        if this.as_ref().weak.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        let destroy_block = this.as_ref().destroy_block;
        destroy_block(this.as_ptr());
    }

    /// Attempt to turn a weak observation into a strong reference.
    ///
    /// The existence check and the increment are one compare-and-swap: the
    /// loop re-reads on a lost race and refuses once it observes zero, so it
    /// can never promote after a concurrent final [`release`](Self::release)
    /// has won. The acquire success ordering pairs with the release publish of
    /// an initially unpublished block, so a promotion that wins against the
    /// publishing thread sees the value write. Returns whether the caller now
    /// owns a strong reference (and its weak unit).
    ///
    /// # Safety
    /// `this` must point to a live control block (a weak unit suffices).
    pub(crate) unsafe fn lock(this: NonNull<ControlBlock>) -> bool {
        let promoted = this
            .as_ref()
            .strong
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| {
                // Zero is permanent: the value is destroyed.
                if n == 0 {
                    return None;
                }
                assert!(n <= MAX_REFCOUNT, "Overflow of maximum strong reference count.");
                Some(n + 1)
            })
            .is_ok();
        if promoted {
            Self::weak_addref(this);
        }
        promoted
    }

    /// Advisory snapshot of the strong count. Not a synchronization point.
    ///
    /// # Safety
    /// `this` must point to a live control block.
    pub(crate) unsafe fn strong(this: NonNull<ControlBlock>) -> usize {
        this.as_ref().strong.load(Ordering::Relaxed)
    }

    /// Advisory snapshot of the weak count, implicit units included.
    ///
    /// # Safety
    /// `this` must point to a live control block.
    pub(crate) unsafe fn weak(this: NonNull<ControlBlock>) -> usize {
        this.as_ref().weak.load(Ordering::Relaxed)
    }

    /// Whether the caller's strong reference is the only handle of any kind:
    /// exactly one strong reference and no weak observers. The acquire loads
    /// order this observation after the releasing decrements of every handle
    /// that existed before, unlike the advisory snapshots.
    ///
    /// # Safety
    /// `this` must point to a live control block with `strong > 0`.
    pub(crate) unsafe fn is_unique(this: NonNull<ControlBlock>) -> bool {
        this.as_ref().weak.load(Ordering::Acquire) == 1
            && this.as_ref().strong.load(Ordering::Acquire) == 1
    }

    /// Ask the concrete block for the address of its deleter, if it stores one
    /// of exactly the given type.
    ///
    /// # Safety
    /// `this` must point to a live control block with `strong > 0`, so the
    /// deleter has not yet been consumed.
    pub(crate) unsafe fn lookup_deleter(
        this: NonNull<ControlBlock>,
        id: TypeId,
    ) -> Option<NonNull<()>> {
        let lookup = this.as_ref().deleter_lookup;
        lookup(this.as_ptr(), id)
    }
}

/// Control block owning a pointer allocated elsewhere.
#[repr(C)]
pub(crate) struct PtrBlock<T: ?Sized, D, A> {
    header: ControlBlock,
    value: *mut T,
    deleter: ManuallyDrop<D>,
    alloc: ManuallyDrop<A>,
}

impl<T: ?Sized, D, A> PtrBlock<T, D, A>
where
    D: Deleter<T> + Send + 'static,
    A: BlockAlloc + Send + 'static,
{
    /// Allocate a block adopting `value`. On allocation failure the deleter is
    /// invoked once on `value` so the adopted pointer does not leak, and the
    /// failure is surfaced to the caller.
    ///
    /// # Safety
    /// `value` must be valid for the deleter's contract and owned by no one
    /// else; on success ownership moves into the block.
    pub(crate) unsafe fn allocate(
        value: *mut T,
        deleter: D,
        alloc: A,
    ) -> Result<NonNull<ControlBlock>, AllocError> {
        let layout = Layout::new::<Self>();
        let raw = match alloc.allocate(layout) {
            Ok(p) => p.as_ptr() as *mut Self,
            Err(e) => {
                deleter.destroy(value);
                return Err(e);
            }
        };
        ptr::write(
            raw,
            PtrBlock {
                header: ControlBlock::new(
                    destroy_value_ptr::<T, D, A>,
                    destroy_block_ptr::<T, D, A>,
                    lookup_deleter_ptr::<T, D, A>,
                ),
                value,
                deleter: ManuallyDrop::new(deleter),
                alloc: ManuallyDrop::new(alloc),
            },
        );
        Ok(NonNull::new_unchecked(raw as *mut ControlBlock))
    }
}

unsafe fn destroy_value_ptr<T: ?Sized, D: Deleter<T>, A>(block: *mut ControlBlock) {
    let block = block as *mut PtrBlock<T, D, A>;
    let value = (*block).value;
    let deleter = ManuallyDrop::take(&mut (*block).deleter);
    // The block outlives the value while weak observers remain; leave no
    // dangling pointer behind it.
    (*block).value = value.with_addr(0);
    deleter.destroy(value);
}

unsafe fn destroy_block_ptr<T: ?Sized, D, A: BlockAlloc>(block: *mut ControlBlock) {
    let block = block as *mut PtrBlock<T, D, A>;
    // The strategy lives inside the storage it is about to free, so it has to
    // be copied out first.
    let alloc = ManuallyDrop::take(&mut (*block).alloc);
    alloc.deallocate(
        NonNull::new_unchecked(block as *mut u8),
        Layout::new::<PtrBlock<T, D, A>>(),
    );
}

unsafe fn lookup_deleter_ptr<T: ?Sized, D: 'static, A>(
    block: *mut ControlBlock,
    id: TypeId,
) -> Option<NonNull<()>> {
    if id != TypeId::of::<D>() {
        return None;
    }
    let block = block as *mut PtrBlock<T, D, A>;
    NonNull::new(addr_of_mut!((*block).deleter).cast::<()>())
}

/// Control block embedding the value's storage, saving the second allocation.
#[repr(C)]
pub(crate) struct InlineBlock<T, A> {
    header: ControlBlock,
    alloc: ManuallyDrop<A>,
    value: MaybeUninit<T>,
}

impl<T, A> InlineBlock<T, A>
where
    A: BlockAlloc + Send + 'static,
{
    /// Allocate a block with `value` constructed in place over the embedded
    /// storage, born with one strong reference.
    pub(crate) fn allocate(value: T, alloc: A) -> Result<NonNull<Self>, AllocError> {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout)?.as_ptr() as *mut Self;
        unsafe {
            ptr::write(
                raw,
                InlineBlock {
                    header: ControlBlock::new(
                        destroy_value_inline::<T, A>,
                        destroy_block_inline::<T, A>,
                        lookup_deleter_none,
                    ),
                    alloc: ManuallyDrop::new(alloc),
                    value: MaybeUninit::new(value),
                },
            );
            Ok(NonNull::new_unchecked(raw))
        }
    }

    /// Allocate a block whose value storage stays uninitialized and whose
    /// strong count is unpublished. The caller writes the value and then
    /// publishes the first strong reference; if it never does, dropping the
    /// last weak unit frees the storage without touching the value.
    pub(crate) fn allocate_uninit(alloc: A) -> Result<NonNull<Self>, AllocError> {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout)?.as_ptr() as *mut Self;
        unsafe {
            ptr::write(
                raw,
                InlineBlock {
                    header: ControlBlock::new_unpublished(
                        destroy_value_inline::<T, A>,
                        destroy_block_inline::<T, A>,
                        lookup_deleter_none,
                    ),
                    alloc: ManuallyDrop::new(alloc),
                    value: MaybeUninit::uninit(),
                },
            );
            Ok(NonNull::new_unchecked(raw))
        }
    }

    pub(crate) fn value_ptr(this: NonNull<Self>) -> *mut T {
        unsafe { addr_of_mut!((*this.as_ptr()).value) as *mut T }
    }

    pub(crate) fn header_ptr(this: NonNull<Self>) -> NonNull<ControlBlock> {
        this.cast()
    }

    /// Publish the first strong reference after the value has been written.
    ///
    /// # Safety
    /// The value storage must be initialized and no strong reference may have
    /// been published yet.
    pub(crate) unsafe fn publish(this: NonNull<Self>) {
        let header = Self::header_ptr(this);
        let prev = header.as_ref().strong.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev, 0, "strong count was already published");
    }
}

unsafe fn destroy_value_inline<T, A>(block: *mut ControlBlock) {
    let block = block as *mut InlineBlock<T, A>;
    ptr::drop_in_place((*block).value.as_mut_ptr());
}

unsafe fn destroy_block_inline<T, A: BlockAlloc>(block: *mut ControlBlock) {
    let block = block as *mut InlineBlock<T, A>;
    let alloc = ManuallyDrop::take(&mut (*block).alloc);
    alloc.deallocate(
        NonNull::new_unchecked(block as *mut u8),
        Layout::new::<InlineBlock<T, A>>(),
    );
}

unsafe fn lookup_deleter_none(_: *mut ControlBlock, _: TypeId) -> Option<NonNull<()>> {
    None
}
