//! `Weak<T>` is a non-owning observer of a [`Shared`] ownership group. It does
//! not keep the value alive, only the backing control block, and must be
//! promoted back into a [`Shared`] to reach the value. Its classic job is
//! breaking reference cycles: parents hold `Shared` handles to children,
//! children hold `Weak` handles back.

use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    ptr::NonNull,
};

use crate::block::{ControlBlock, DanglingWeak};
use crate::shared::Shared;

/// A non-owning handle observing whether a shared value is still alive.
///
/// Holding a `Weak<T>` contributes one unit to the group's weak count, which
/// keeps the control block allocated but never the value. Promotion via
/// [`upgrade`](Weak::upgrade) succeeds only while at least one strong handle
/// exists at the instant of the call.
///
/// ```
/// use sharc::{Shared, Weak};
///
/// let shared = Shared::new(100);
/// let weak = Shared::downgrade(&shared);
/// let promoted = weak.upgrade().expect("value was dropped");
/// assert_eq!(*promoted, 100);
/// drop((shared, promoted));
/// assert!(weak.expired());
/// ```
pub struct Weak<T: ?Sized> {
    pub(crate) ptr: *const T,
    pub(crate) ctrl: Option<NonNull<ControlBlock>>,
    pub(crate) _marker: PhantomData<T>,
}

impl<T> Weak<T> {
    /// An empty observer, attached to nothing. [`upgrade`](Weak::upgrade)
    /// always fails on it.
    /// ```
    /// use sharc::Weak;
    ///
    /// let weak = Weak::<i32>::new();
    /// assert!(weak.expired());
    /// assert!(weak.upgrade().is_none());
    /// ```
    pub fn new() -> Self {
        Weak {
            ptr: std::ptr::null(),
            ctrl: None,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Weak<T> {
    /// Attempt to promote this observation into a strong handle.
    ///
    /// The promotion is a compare-and-swap loop on the strong count, so it can
    /// never succeed after a concurrent drop of the last strong handle has
    /// destroyed the value. Returns [`None`] once the value is gone.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// assert_eq!(Shared::use_count(&weak.upgrade().unwrap()), 2);
    /// ```
    #[inline]
    pub fn upgrade(&self) -> Option<Shared<T>> {
        let ctrl = self.ctrl?;
        if unsafe { ControlBlock::lock(ctrl) } {
            Some(unsafe { Shared::from_parts(self.ptr, Some(ctrl)) })
        } else {
            None
        }
    }

    /// Whether the observed value has been destroyed (or there never was one).
    /// Advisory under concurrency: a `false` may be stale by the time it is
    /// read, so callers deciding control flow should use
    /// [`upgrade`](Weak::upgrade) instead.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// assert!(!weak.expired());
    /// drop(shared);
    /// assert!(weak.expired());
    /// ```
    #[inline]
    pub fn expired(&self) -> bool {
        match self.ctrl {
            Some(ctrl) => (unsafe { ControlBlock::strong(ctrl) }) == 0,
            None => true,
        }
    }

    /// Advisory snapshot of the group's strong count; 0 when empty or expired.
    #[inline]
    pub fn use_count(&self) -> usize {
        match self.ctrl {
            Some(ctrl) => unsafe { ControlBlock::strong(ctrl) },
            None => 0,
        }
    }

    /// Detach from the observed group, releasing this handle's weak unit.
    /// ```
    /// use sharc::Shared;
    ///
    /// let shared = Shared::new(100);
    /// let mut weak = Shared::downgrade(&shared);
    /// weak.reset();
    /// assert!(weak.upgrade().is_none());
    /// ```
    pub fn reset(&mut self) {
        if let Some(ctrl) = self.ctrl.take() {
            unsafe { ControlBlock::weak_release(ctrl) };
        }
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    /// Clone a `Weak<T>` (increment the weak count).
    #[inline]
    fn clone(&self) -> Self {
        if let Some(ctrl) = self.ctrl {
            unsafe { ControlBlock::weak_addref(ctrl) };
        }
        Weak {
            ptr: self.ptr,
            ctrl: self.ctrl,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for Weak<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(ctrl) = self.ctrl {
            unsafe { ControlBlock::weak_release(ctrl) };
        }
    }
}

impl<T> Default for Weak<T> {
    /// Equivalent to [`Weak::new`].
    fn default() -> Self {
        Weak::new()
    }
}

impl<T: ?Sized> Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

impl<T: ?Sized> TryFrom<&Weak<T>> for Shared<T> {
    type Error = DanglingWeak;

    /// The checked promotion path: like [`Weak::upgrade`], but surfacing the
    /// expired case as a named failure instead of an [`Option`].
    /// ```
    /// use sharc::{DanglingWeak, Shared};
    ///
    /// let shared = Shared::new(100);
    /// let weak = Shared::downgrade(&shared);
    /// assert!(Shared::<i32>::try_from(&weak).is_ok());
    /// drop(shared);
    /// assert_eq!(Shared::<i32>::try_from(&weak), Err(DanglingWeak));
    /// ```
    fn try_from(weak: &Weak<T>) -> Result<Self, Self::Error> {
        weak.upgrade().ok_or(DanglingWeak)
    }
}

unsafe impl<T: ?Sized + Sync + Send> Send for Weak<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for Weak<T> {}
