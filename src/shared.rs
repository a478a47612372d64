//! `Shared<T>` is the strong-owning handle of this crate: a value pointer plus
//! a reference to the control block that manages the value's lifetime. Any
//! number of handles may share one value across threads; the value is
//! destroyed exactly once, when the last strong handle is dropped, and the
//! control block is freed once the last [`Weak`] observer goes too.
//!
//! ## Construction paths
//! [`Shared::new`] co-locates the value with the counters in one allocation
//! (the make-shared path). [`Shared::adopt`] and friends take over a pointer
//! that was allocated elsewhere, together with the [`Deleter`] that will
//! destroy it and the [`BlockAlloc`] that provides the control block's own
//! storage. Both strategies are fixed at construction and stored in the block
//! as data; no later operation dispatches on them.
//!
//! ## Clone and drop behavior
//! Cloning copies the two fields and bumps the counters; it never touches the
//! value. Dropping decrements, and the handle that takes the strong count to
//! zero runs the destruction strategy. Distinct handles over one value may be
//! used, cloned, and dropped from different threads without locking; mutating
//! one handle *variable* from several threads instead needs the
//! [`atomic`](crate::atomic) layer.
//!
//! ## Aliasing
//! A handle's stored pointer does not have to be the address its control block
//! manages. [`Shared::project`] returns a handle to a subobject that keeps the
//! whole ownership group alive:
//!
//! ```
//! use sharc::Shared;
//!
//! let pair = Shared::new((1u64, String::from("payload")));
//! let name: Shared<String> = Shared::project(pair, |p| &p.1);
//! assert_eq!(&*name, "payload");
//! ```

use std::{
    alloc::{handle_alloc_error, Layout},
    any::{Any, TypeId},
    cell::UnsafeCell,
    fmt::{self, Debug, Display, Pointer},
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem,
    ops::Deref,
    panic::UnwindSafe,
    pin::Pin,
    ptr::{self, NonNull},
};

use crate::block::{
    AllocError, BlockAlloc, ControlBlock, DefaultDeleter, Deleter, Global, InlineBlock, PtrBlock,
};
use crate::weak::Weak;

/// A strong-owning, reference-counted shared pointer.
///
/// `Shared<T>` holds a value pointer and a control-block reference. The
/// control block may be absent: such a handle is either empty or a deliberate
/// non-owning alias, and releases nothing when dropped.
///
/// Example in a single thread:
/// ```
/// use sharc::Shared;
///
/// let a = Shared::new(100);
/// let b = a.clone();
/// assert_eq!(*b, 100);
/// assert_eq!(Shared::use_count(&a), 2);
/// ```
///
/// Example with multiple threads:
/// ```
/// use std::thread;
/// use sharc::Shared;
///
/// let shared = Shared::new(100);
/// let moved = shared.clone();
/// let handle = thread::spawn(move || {
///     assert_eq!(*moved, 100);
/// });
/// handle.join().unwrap();
/// assert_eq!(Shared::use_count(&shared), 1);
/// ```
pub struct Shared<T: ?Sized> {
    ptr: *const T,
    ctrl: Option<NonNull<ControlBlock>>,
    _marker: PhantomData<T>,
}

impl<T> Shared<T> {
    /// Creates a new `Shared<T>` from the provided value, co-locating it with
    /// the control block in a single global-heap allocation. Aborts on
    /// allocation failure; see [`Shared::try_new`] for the checked form.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// assert_eq!(*shared, 100);
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(shared) => shared,
            Err(_) => handle_alloc_error(Layout::new::<InlineBlock<T, Global>>()),
        }
    }

    /// Fallible [`Shared::new`]: surfaces [`AllocError`] instead of aborting.
    /// The value is dropped in place when the block cannot be allocated.
    #[inline]
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_in(value, Global)
    }

    /// Single-allocation construction through a caller-chosen allocation
    /// strategy. The strategy is stored inside the block it allocates and
    /// frees that block later.
    /// ```
    /// use sharc::{Global, Shared};
    ///
    /// let shared = Shared::try_new_in(100, Global).unwrap();
    /// assert_eq!(*shared, 100);
    /// ```
    pub fn try_new_in<A>(value: T, alloc: A) -> Result<Self, AllocError>
    where
        A: BlockAlloc + Send + 'static,
    {
        let block = InlineBlock::allocate(value, alloc)?;
        Ok(Shared {
            ptr: InlineBlock::value_ptr(block),
            ctrl: Some(InlineBlock::header_ptr(block)),
            _marker: PhantomData,
        })
    }

    /// Creates a new cyclic `Shared<T>`: the closure receives a [`Weak`] to
    /// the allocation before the value exists, so the value can store an
    /// observer of itself without leaking the way a strong self-reference
    /// would.
    /// ```
    /// use sharc::{Shared, Weak};
    ///
    /// struct Node(Weak<Node>);
    ///
    /// let node = Shared::new_cyclic(|weak| Node(weak.clone()));
    /// assert_eq!(Shared::use_count(&node), 1);
    /// assert!(node.0.upgrade().is_some());
    /// ```
    pub fn new_cyclic<F>(data_fn: F) -> Self
    where
        F: FnOnce(&Weak<T>) -> T,
    {
        let block = match InlineBlock::<T, Global>::allocate_uninit(Global) {
            Ok(block) => block,
            Err(_) => handle_alloc_error(Layout::new::<InlineBlock<T, Global>>()),
        };
        let ptr = InlineBlock::value_ptr(block);
        let header = InlineBlock::header_ptr(block);

        // If `data_fn` panics, dropping this weak frees the block without
        // running a destructor over the still-uninitialized storage.
        let weak = Weak {
            ptr: ptr as *const T,
            ctrl: Some(header),
            _marker: PhantomData,
        };
        let value = data_fn(&weak);

        unsafe {
            ptr::write(ptr, value);
            InlineBlock::publish(block);
        }
        // The weak unit held above becomes the strong reference's own unit.
        mem::forget(weak);

        Shared {
            ptr,
            ctrl: Some(header),
            _marker: PhantomData,
        }
    }

    /// Construction path for value types exposing the self-observation
    /// capability: the embedded [`SelfWeak`] is populated exactly once, at the
    /// moment this handle first takes ownership, before the value can be
    /// reached by anyone else.
    /// ```
    /// use sharc::{ObserveSelf, SelfWeak, Shared};
    ///
    /// struct Session {
    ///     observer: SelfWeak<Session>,
    ///     id: u32,
    /// }
    ///
    /// impl ObserveSelf for Session {
    ///     fn self_observer(&self) -> &SelfWeak<Session> {
    ///         &self.observer
    ///     }
    /// }
    ///
    /// let session = Shared::new_observed(Session { observer: SelfWeak::new(), id: 7 });
    /// let again = session.shared_from_this().expect("value is alive");
    /// assert_eq!(again.id, 7);
    /// assert_eq!(Shared::use_count(&session), 2);
    /// ```
    pub fn new_observed(value: T) -> Self
    where
        T: ObserveSelf,
    {
        let this = Shared::new(value);
        if let (Some(ctrl), Some(value)) = (this.ctrl, Shared::get(&this)) {
            value.self_observer().assign(this.ptr, ctrl);
        }
        this
    }

    /// Creates a new `Pin<Shared<T>>`. If `T` does not implement [`Unpin`],
    /// the value is pinned in memory and unable to be moved.
    #[inline]
    pub fn pin(value: T) -> Pin<Shared<T>> {
        unsafe { Pin::new_unchecked(Shared::new(value)) }
    }

    /// Drop this handle's reference and leave the handle empty. The empty
    /// replacement is fully constructed before the old reference is released,
    /// so a destructor that panics cannot leave the handle half-updated.
    /// ```
    /// use sharc::Shared;
    ///
    /// let a = Shared::new(100);
    /// let mut b = a.clone();
    /// Shared::reset(&mut b);
    /// assert!(Shared::get(&b).is_none());
    /// assert_eq!(Shared::use_count(&a), 1);
    /// ```
    #[inline]
    pub fn reset(this: &mut Self) {
        *this = Shared::default();
    }
}

impl<T: ?Sized> Shared<T> {
    pub(crate) unsafe fn from_parts(ptr: *const T, ctrl: Option<NonNull<ControlBlock>>) -> Self {
        Shared {
            ptr,
            ctrl,
            _marker: PhantomData,
        }
    }

    /// Adopt a separately allocated pointer with the default destruction
    /// strategy (destroy and free as the matching [`Box`]). Aborts if the
    /// control block cannot be allocated, after destroying the value.
    ///
    /// # Safety
    /// `ptr` must come from [`Box::into_raw`] (or satisfy the same validity
    /// and unique-ownership contract) and must not be used afterwards.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = unsafe { Shared::adopt(Box::into_raw(Box::new(100))) };
    /// assert_eq!(*shared, 100);
    /// ```
    #[inline]
    pub unsafe fn adopt(ptr: *mut T) -> Self {
        Self::adopt_with(ptr, DefaultDeleter)
    }

    /// Adopt a pointer together with the strategy that will destroy it.
    ///
    /// # Safety
    /// `ptr` must be valid for `deleter`'s contract, owned by no one else, and
    /// not used after this call.
    pub unsafe fn adopt_with<D>(ptr: *mut T, deleter: D) -> Self
    where
        D: Deleter<T> + Send + 'static,
    {
        match Self::try_adopt_with_in(ptr, deleter, Global) {
            Ok(shared) => shared,
            Err(_) => handle_alloc_error(Layout::new::<PtrBlock<T, D, Global>>()),
        }
    }

    /// The fully general adoption path: pointer, destruction strategy, and the
    /// allocation strategy providing the control block's storage.
    ///
    /// If the block cannot be allocated, the deleter is invoked exactly once
    /// on `ptr` (so the value does not leak) and [`AllocError`] is returned;
    /// no handle is produced.
    ///
    /// # Safety
    /// Same contract as [`Shared::adopt_with`].
    /// ```
    /// use std::alloc::Layout;
    /// use std::ptr::NonNull;
    /// use sharc::{AllocError, BlockAlloc, DefaultDeleter, Shared};
    ///
    /// #[derive(Clone)]
    /// struct NoAlloc;
    ///
    /// impl BlockAlloc for NoAlloc {
    ///     fn allocate(&self, _: Layout) -> Result<NonNull<u8>, AllocError> {
    ///         Err(AllocError)
    ///     }
    ///     unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
    ///         unreachable!("NoAlloc never allocates")
    ///     }
    /// }
    ///
    /// let ptr = Box::into_raw(Box::new(100));
    /// let result = unsafe { Shared::try_adopt_with_in(ptr, DefaultDeleter, NoAlloc) };
    /// assert_eq!(result.unwrap_err(), AllocError);
    /// // `ptr` was handed to the deleter; it is gone, not leaked.
    /// ```
    pub unsafe fn try_adopt_with_in<D, A>(
        ptr: *mut T,
        deleter: D,
        alloc: A,
    ) -> Result<Self, AllocError>
    where
        D: Deleter<T> + Send + 'static,
        A: BlockAlloc + Send + 'static,
    {
        let ctrl = PtrBlock::allocate(ptr, deleter, alloc)?;
        Ok(Shared {
            ptr,
            ctrl: Some(ctrl),
            _marker: PhantomData,
        })
    }

    /// Create a [`Weak`] observer of this handle's ownership group. This
    /// increments the weak count; an empty handle yields an empty observer.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// assert!(!weak.expired());
    /// ```
    #[inline]
    pub fn downgrade(this: &Self) -> Weak<T> {
        if let Some(ctrl) = this.ctrl {
            unsafe { ControlBlock::weak_addref(ctrl) };
        }
        Weak {
            ptr: this.ptr,
            ctrl: this.ctrl,
            _marker: PhantomData,
        }
    }

    /// Checked access to the stored value. Returns [`None`] for an empty
    /// handle; the panicking counterpart is [`Deref`].
    #[inline]
    pub fn get(this: &Self) -> Option<&T> {
        if this.ptr.is_null() {
            None
        } else {
            Some(unsafe { &*this.ptr })
        }
    }

    /// The stored value address; null for an empty handle. O(1) field read.
    #[inline]
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr
    }

    /// Whether the handle stores no value pointer. The boolean-conversion
    /// query: a handle may be non-empty and still own nothing (an alias), and
    /// vice versa cannot happen through safe construction.
    #[inline]
    pub fn is_empty(this: &Self) -> bool {
        this.ptr.is_null()
    }

    /// Whether the handle participates in an ownership group. `false` for
    /// empty handles and for non-owning aliases of empty donors.
    #[inline]
    pub fn has_owner(this: &Self) -> bool {
        this.ctrl.is_some()
    }

    /// The group's current strong count, or 0 for a non-owning handle.
    ///
    /// Best-effort snapshot under concurrency, not a synchronization point:
    /// fine for diagnostics, wrong for control flow. Use [`Weak::upgrade`]
    /// when the answer has to stay true.
    /// ```
    /// use sharc::Shared;
    ///
    /// let a = Shared::new(100);
    /// let b = a.clone();
    /// assert_eq!(Shared::use_count(&a), 2);
    /// drop(b);
    /// assert_eq!(Shared::use_count(&a), 1);
    /// ```
    #[inline]
    pub fn use_count(this: &Self) -> usize {
        match this.ctrl {
            Some(ctrl) => unsafe { ControlBlock::strong(ctrl) },
            None => 0,
        }
    }

    /// The number of live [`Weak`] observers of the group, implicit
    /// per-strong units excluded. Advisory snapshot like
    /// [`use_count`](Shared::use_count).
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let w1 = Shared::downgrade(&shared);
    /// let w2 = w1.clone();
    /// assert_eq!(Shared::weak_count(&shared), 2);
    /// drop((w1, w2));
    /// assert_eq!(Shared::weak_count(&shared), 0);
    /// ```
    #[inline]
    pub fn weak_count(this: &Self) -> usize {
        match this.ctrl {
            Some(ctrl) => unsafe {
                ControlBlock::weak(ctrl).saturating_sub(ControlBlock::strong(ctrl))
            },
            None => 0,
        }
    }

    /// Whether two handles belong to the same ownership group, i.e. share one
    /// control block. The handles may store differently typed pointers, as
    /// projection produces; two groups that coincidentally manage the same
    /// address are *not* the same owner.
    /// ```
    /// use sharc::Shared;
    ///
    /// let a = Shared::new(100);
    /// let b = a.clone();
    /// let c = Shared::new(100);
    /// assert!(Shared::same_owner(&a, &b));
    /// assert!(!Shared::same_owner(&a, &c));
    /// ```
    #[inline]
    pub fn same_owner<U: ?Sized>(this: &Self, other: &Shared<U>) -> bool {
        this.ctrl == other.ctrl
    }

    /// Get a `&mut T` if this is the only handle of any kind to the group:
    /// exactly one strong reference and no weak observers.
    ///
    /// # Safety
    /// The stored pointer must address a value this group exclusively owns; a
    /// handle produced by [`Shared::alias`] may point into state that other
    /// parties can reach, and mutating through it would race them.
    /// ```
    /// use sharc::Shared;
    ///
    /// let mut shared = Shared::new(100);
    /// *unsafe { Shared::get_mut(&mut shared) }.unwrap() = 200;
    /// assert_eq!(*shared, 200);
    /// ```
    #[inline]
    pub unsafe fn get_mut(this: &mut Self) -> Option<&mut T> {
        let ctrl = this.ctrl?;
        if ControlBlock::is_unique(ctrl) && !this.ptr.is_null() {
            Some(&mut *(this.ptr as *mut T))
        } else {
            None
        }
    }

    /// Aliasing projection: a handle that shares this handle's ownership group
    /// but stores the address of a subobject. The group stays alive as long as
    /// any projected handle does, independent of what happens to the donor.
    ///
    /// This is also the static/const cast equivalent: the result reinterprets
    /// an address the group already covers as another type.
    ///
    /// Panics when `this` is empty.
    /// ```
    /// use sharc::Shared;
    ///
    /// let pair = Shared::new((1u8, 2u8));
    /// let second = Shared::project(pair.clone(), |p| &p.1);
    /// assert_eq!(*second, 2);
    /// assert_eq!(Shared::use_count(&pair), 2);
    /// assert!(Shared::same_owner(&pair, &second));
    /// ```
    pub fn project<U: ?Sized, F>(this: Self, f: F) -> Shared<U>
    where
        F: FnOnce(&T) -> &U,
    {
        let value = match Shared::get(&this) {
            Some(value) => value,
            None => panic!("projected through an empty Shared"),
        };
        let ptr = f(value) as *const U;
        let ctrl = this.ctrl;
        // The reference moved into the projection, not a second one.
        mem::forget(this);
        Shared {
            ptr,
            ctrl,
            _marker: PhantomData,
        }
    }

    /// Raw aliasing construction: share `donor`'s control block (taking a
    /// reference on it if present) while storing an unrelated pointer. If the
    /// donor is empty the result stores `ptr` but owns nothing, and will not
    /// destroy it.
    ///
    /// # Safety
    /// `ptr` must stay valid for as long as the resulting handle (or any copy
    /// of it) can be dereferenced. [`Shared::project`] is the safe form.
    pub unsafe fn alias<U: ?Sized>(donor: &Shared<U>, ptr: *const T) -> Shared<T> {
        if let Some(ctrl) = donor.ctrl {
            ControlBlock::addref(ctrl);
        }
        Shared {
            ptr,
            ctrl: donor.ctrl,
            _marker: PhantomData,
        }
    }

    /// Borrow the destruction strategy stored for this group, if it is a
    /// pointer-adoption block whose deleter has exactly type `D`. Inline
    /// blocks and mismatched types yield [`None`].
    /// ```
    /// use sharc::{DefaultDeleter, Shared};
    ///
    /// let adopted = unsafe { Shared::adopt(Box::into_raw(Box::new(100))) };
    /// assert!(Shared::deleter::<DefaultDeleter>(&adopted).is_some());
    /// assert!(Shared::deleter::<fn(*mut i32)>(&adopted).is_none());
    ///
    /// let inline = Shared::new(100);
    /// assert!(Shared::deleter::<DefaultDeleter>(&inline).is_none());
    /// ```
    pub fn deleter<D: 'static>(this: &Self) -> Option<&D> {
        let ctrl = this.ctrl?;
        // This handle holds a strong reference, so the deleter has not been
        // consumed yet.
        let addr = unsafe { ControlBlock::lookup_deleter(ctrl, TypeId::of::<D>()) }?;
        Some(unsafe { &*(addr.as_ptr() as *const D) })
    }
}

impl<T: Any + Send + Sync> Shared<T> {
    /// Erase the value type, keeping the ownership group. The inverse is
    /// [`Shared::downcast`].
    /// ```
    /// use std::any::Any;
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100i32);
    /// let any: Shared<dyn Any + Send + Sync> = Shared::into_any(shared);
    /// assert_eq!(Shared::use_count(&any), 1);
    /// ```
    pub fn into_any(this: Self) -> Shared<dyn Any + Send + Sync> {
        let ptr: *const (dyn Any + Send + Sync) = this.ptr;
        let ctrl = this.ctrl;
        mem::forget(this);
        Shared {
            ptr,
            ctrl,
            _marker: PhantomData,
        }
    }
}

impl Shared<dyn Any + Send + Sync> {
    /// The dynamic-cast equivalent: recover a concretely typed handle if the
    /// erased value is a `T`, sharing the ownership group via aliasing. On a
    /// type mismatch (or an empty handle) the original is handed back and no
    /// counts change.
    /// ```
    /// use std::any::Any;
    /// use sharc::Shared;
    ///
    /// let any = Shared::into_any(Shared::new(100i32));
    /// let wrong = any.downcast::<String>().unwrap_err();
    /// let right = wrong.downcast::<i32>().ok().unwrap();
    /// assert_eq!(*right, 100);
    /// ```
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Shared<T>, Self> {
        match Shared::get(&self) {
            Some(value) if value.is::<T>() => {
                let ptr = self.ptr.cast::<T>();
                let ctrl = self.ctrl;
                mem::forget(self);
                Ok(Shared {
                    ptr,
                    ctrl,
                    _marker: PhantomData,
                })
            }
            _ => Err(self),
        }
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    /// Clone a `Shared<T>` (increment the strong count). Panics if the count
    /// would overflow.
    /// ```
    /// use sharc::Shared;
    ///
    /// let a = Shared::new(100);
    /// let b = a.clone();
    /// assert_eq!(Shared::use_count(&a), Shared::use_count(&b));
    /// ```
    #[inline]
    fn clone(&self) -> Self {
        if let Some(ctrl) = self.ctrl {
            unsafe { ControlBlock::addref(ctrl) };
        }
        Shared {
            ptr: self.ptr,
            ctrl: self.ctrl,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for Shared<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(ctrl) = self.ctrl {
            unsafe { ControlBlock::release(ctrl) };
        }
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    /// Get an immutable reference to the stored value. O(1) field read.
    ///
    /// Panics on an empty handle; [`Shared::get`] is the checked form.
    #[inline]
    fn deref(&self) -> &Self::Target {
        match Shared::get(self) {
            Some(value) => value,
            None => panic!("dereferenced an empty Shared"),
        }
    }
}

impl<T: ?Sized> AsRef<T> for Shared<T> {
    /// Panics on an empty handle, like [`Deref`].
    fn as_ref(&self) -> &T {
        self.deref()
    }
}

impl<T> Default for Shared<T> {
    /// The empty handle: no value pointer, no ownership group.
    /// ```
    /// use sharc::Shared;
    ///
    /// let empty = Shared::<i32>::default();
    /// assert!(Shared::is_empty(&empty));
    /// assert_eq!(Shared::use_count(&empty), 0);
    /// ```
    fn default() -> Self {
        Shared {
            ptr: ptr::null(),
            ctrl: None,
            _marker: PhantomData,
        }
    }
}

impl<T> From<T> for Shared<T> {
    /// Equivalent to calling [`Shared::new`] on the value.
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized> From<Box<T>> for Shared<T> {
    /// Adoption from Rust's unique-owner pointer: the box's allocation and
    /// destruction strategy transfer to the group, and the box releases its
    /// ownership.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared: Shared<str> = Shared::from(Box::<str>::from("payload"));
    /// assert_eq!(&*shared, "payload");
    /// ```
    fn from(value: Box<T>) -> Self {
        unsafe { Shared::adopt(Box::into_raw(value)) }
    }
}

impl<T: ?Sized> PartialEq for Shared<T> {
    /// Equality over ownership-group identity, not value or address: two
    /// handles are equal iff they share a control block. Two groups that
    /// happen to manage the same address are never conflated.
    /// ```
    /// use sharc::Shared;
    ///
    /// let a = Shared::new(100);
    /// let b = a.clone();
    /// let c = Shared::new(100);
    /// assert!(a == b);
    /// assert!(a != c);
    /// ```
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ctrl == other.ctrl
    }
}

impl<T: ?Sized> Eq for Shared<T> {}

impl<T: ?Sized> PartialOrd for Shared<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for Shared<T> {
    /// Total order over control-block addresses, usable as an ownership-based
    /// map key (the `owner_before` relation).
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = self.ctrl.map_or(0usize, |c| c.as_ptr() as usize);
        let rhs = other.ctrl.map_or(0usize, |c| c.as_ptr() as usize);
        lhs.cmp(&rhs)
    }
}

impl<T: ?Sized> Hash for Shared<T> {
    /// Hashes the stored value address, so `Shared` keys interoperate with
    /// raw-pointer-keyed tables. Note the deliberate asymmetry with
    /// [`PartialEq`]: two aliases of one group compare equal but may hash
    /// differently; hash-keyed containers should key on [`Shared::as_ptr`]
    /// when aliased handles are in play. `Borrow<T>` is not implemented for
    /// the same reason: a by-value `T` key could never hash-agree with this.
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ptr.cast::<()>() as usize).hash(state);
    }
}

impl<T: ?Sized + Display> Display for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Shared::get(self) {
            Some(value) => Display::fmt(value, f),
            None => f.write_str("(empty)"),
        }
    }
}

impl<T: ?Sized + Debug> Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Shared::get(self) {
            Some(value) => Debug::fmt(value, f),
            None => f.write_str("(empty)"),
        }
    }
}

impl<T: ?Sized> Pointer for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Pointer::fmt(&self.ptr, f)
    }
}

impl<T: ?Sized> Unpin for Shared<T> {}

impl<T: ?Sized> UnwindSafe for Shared<T> {}

unsafe impl<T: ?Sized + Sync + Send> Send for Shared<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for Shared<T> {}

/// A weak-pointer-shaped slot a value type embeds to observe itself.
///
/// The slot starts empty and is populated exactly once, by
/// [`Shared::new_observed`], at the moment a `Shared` first takes ownership of
/// the surrounding value. From then on the value can hand out handles to
/// itself via [`SelfWeak::observe`] without ever holding a strong (and thus
/// leaking) self-reference.
pub struct SelfWeak<T: ?Sized> {
    slot: UnsafeCell<Weak<T>>,
}

impl<T> SelfWeak<T> {
    /// An unpopulated slot; [`observe`](SelfWeak::observe) fails until the
    /// surrounding value is first wrapped by [`Shared::new_observed`].
    pub fn new() -> Self {
        SelfWeak {
            slot: UnsafeCell::new(Weak::new()),
        }
    }
}

impl<T> Default for SelfWeak<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> SelfWeak<T> {
    /// Promote the observation into a strong handle of the owning group.
    /// [`None`] if the slot was never wired or the value is already being
    /// destroyed.
    #[inline]
    pub fn observe(&self) -> Option<Shared<T>> {
        unsafe { &*self.slot.get() }.upgrade()
    }

    /// Clone the underlying weak handle out of the slot.
    #[inline]
    pub fn weak(&self) -> Weak<T> {
        unsafe { &*self.slot.get() }.clone()
    }

    /// Populate the slot. First assignment wins; the wiring happens before
    /// the owning handle can be shared, so no reader can race it.
    pub(crate) fn assign(&self, ptr: *const T, ctrl: NonNull<ControlBlock>) {
        let slot = unsafe { &mut *self.slot.get() };
        if slot.ctrl.is_none() {
            unsafe { ControlBlock::weak_addref(ctrl) };
            slot.ptr = ptr;
            slot.ctrl = Some(ctrl);
        }
    }
}

impl<T: ?Sized> Debug for SelfWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(SelfWeak)")
    }
}

unsafe impl<T: ?Sized + Sync + Send> Send for SelfWeak<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for SelfWeak<T> {}

/// Opt-in capability: a value type that embeds a [`SelfWeak`] and wants it
/// wired when the value first becomes managed.
///
/// The check is resolved entirely at compile time: types implementing this
/// trait construct through [`Shared::new_observed`], everything else takes the
/// unbounded constructors and the hook is a true no-op. There is no run-time
/// branch and no run-time type inspection.
pub trait ObserveSelf {
    /// The embedded observation slot.
    fn self_observer(&self) -> &SelfWeak<Self>;

    /// A strong handle to `self`, if `self` is currently managed and alive.
    /// ```
    /// use sharc::{ObserveSelf, SelfWeak, Shared};
    ///
    /// struct Task {
    ///     observer: SelfWeak<Task>,
    /// }
    ///
    /// impl ObserveSelf for Task {
    ///     fn self_observer(&self) -> &SelfWeak<Task> {
    ///         &self.observer
    ///     }
    /// }
    ///
    /// let unmanaged = Task { observer: SelfWeak::new() };
    /// assert!(unmanaged.shared_from_this().is_none());
    ///
    /// let managed = Shared::new_observed(Task { observer: SelfWeak::new() });
    /// assert!(managed.shared_from_this().is_some());
    /// ```
    fn shared_from_this(&self) -> Option<Shared<Self>> {
        self.self_observer().observe()
    }
}
