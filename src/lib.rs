//! `Shared<T>` is a heap-allocated smart pointer providing shared ownership of a value across
//! threads, similar to `Arc<T>`, with the memory-management strategy chosen at construction time.
//! A value can be co-located with its reference counts in one allocation ([`Shared::new`]), or an
//! already-allocated pointer can be adopted together with a destruction strategy and the allocator
//! that provides the bookkeeping block ([`Shared::adopt_with`]). Either way the value is destroyed
//! exactly once, when the last strong handle is released.
//!
//! A cycle between `Shared` pointers cannot be deallocated as the reference counts will never reach
//! zero. The solution is a `Weak<T>`: a non-owning observer that keeps only the bookkeeping block
//! alive and must be promoted back into a `Shared<T>` (which fails once the value is gone) to
//! access the data. Values can observe themselves through the opt-in [`ObserveSelf`] capability.
//!
//! Beyond plain sharing, a handle can alias: [`Shared::project`] produces a handle to a subobject
//! that keeps the whole ownership group alive, and the same mechanism backs the type-erasing and
//! downcasting views. For the one thing reference counting does not cover - several threads
//! reassigning a single pointer *variable* - [`AtomicShared`] provides load/store/swap/CAS with
//! the call-site shape of the integer atomics, backed by a striped lock.

pub mod atomic;
pub mod block;
pub mod shared;
pub mod weak;

pub use crate::atomic::AtomicShared;
pub use crate::block::{AllocError, BlockAlloc, DanglingWeak, DefaultDeleter, Deleter, Global};
pub use crate::shared::{ObserveSelf, SelfWeak, Shared};
pub use crate::weak::Weak;

#[cfg(test)]
mod tests;
