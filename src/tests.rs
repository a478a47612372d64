use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::{
    AllocError, AtomicShared, BlockAlloc, DanglingWeak, DefaultDeleter, Global, ObserveSelf,
    SelfWeak, Shared, Weak,
};

struct Canary {
    value: u32,
    drops: Arc<AtomicUsize>,
}

impl Canary {
    fn new(value: u32, drops: &Arc<AtomicUsize>) -> Canary {
        Canary {
            value,
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// An allocation strategy that always fails.
#[derive(Clone)]
struct NoAlloc;

impl BlockAlloc for NoAlloc {
    fn allocate(&self, _: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError)
    }

    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
        unreachable!("NoAlloc never allocates");
    }
}

/// Global-heap strategy that tallies its calls.
#[derive(Clone)]
struct CountingAlloc {
    allocs: Arc<AtomicUsize>,
    deallocs: Arc<AtomicUsize>,
}

impl CountingAlloc {
    fn new() -> CountingAlloc {
        CountingAlloc {
            allocs: Arc::new(AtomicUsize::new(0)),
            deallocs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl BlockAlloc for CountingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.deallocs.fetch_add(1, Ordering::SeqCst);
        Global.deallocate(ptr, layout);
    }
}

#[test]
fn test_value_drops_exactly_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = Shared::new(Canary::new(7, &drops));
    let b = a.clone();
    let c = b.clone();
    drop(a);
    drop(c);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(b.value, 7);
    drop(b);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_ladder_scenario() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = Shared::new(Canary::new(1, &drops));
    assert_eq!(Shared::use_count(&a), 1);

    let b = a.clone();
    assert_eq!(Shared::use_count(&a), 2);

    drop(a);
    assert_eq!(Shared::use_count(&b), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    let w = Shared::downgrade(&b);
    drop(b);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(w.expired());
    assert!(w.upgrade().is_none());
}

#[test]
fn test_block_freed_once_after_both_counts() {
    let alloc = CountingAlloc::new();
    let drops = Arc::new(AtomicUsize::new(0));

    let shared = Shared::try_new_in(Canary::new(3, &drops), alloc.clone()).unwrap();
    let weak = Shared::downgrade(&shared);
    assert_eq!(alloc.allocs.load(Ordering::SeqCst), 1);

    drop(shared);
    // Value gone, block still pinned by the observer.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(alloc.deallocs.load(Ordering::SeqCst), 0);

    drop(weak);
    assert_eq!(alloc.deallocs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_allocator_runs_deleter_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let ptr = Box::into_raw(Box::new(Canary::new(9, &drops)));
    let tally = Arc::clone(&calls);
    let deleter = move |p: *mut Canary| {
        tally.fetch_add(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(p) });
    };

    let result = unsafe { Shared::try_adopt_with_in(ptr, deleter, NoAlloc) };
    assert_eq!(result.err(), Some(AllocError));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_adopt_with_custom_deleter() {
    let drops = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let ptr = Box::into_raw(Box::new(Canary::new(5, &drops)));
    let tally = Arc::clone(&calls);
    let shared = unsafe {
        Shared::adopt_with(ptr, move |p: *mut Canary| {
            tally.fetch_add(1, Ordering::SeqCst);
            drop(unsafe { Box::from_raw(p) });
        })
    };

    let other = shared.clone();
    drop(shared);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(other.value, 5);
    drop(other);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_adopt_from_box() {
    let drops = Arc::new(AtomicUsize::new(0));
    let shared: Shared<Canary> = Shared::from(Box::new(Canary::new(2, &drops)));
    assert_eq!(shared.value, 2);
    assert_eq!(Shared::use_count(&shared), 1);
    drop(shared);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deleter_retrieval_by_type() {
    let adopted = unsafe { Shared::adopt(Box::into_raw(Box::new(100))) };
    assert!(Shared::deleter::<DefaultDeleter>(&adopted).is_some());
    assert!(Shared::deleter::<fn(*mut i32)>(&adopted).is_none());

    let inline = Shared::new(100);
    assert!(Shared::deleter::<DefaultDeleter>(&inline).is_none());
}

#[test]
fn test_aliasing_projection() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut donor = Shared::new((Canary::new(4, &drops), 11u32));
    let aliased = Shared::project(donor.clone(), |pair| &pair.1);

    assert_eq!(Shared::use_count(&aliased), Shared::use_count(&donor));
    assert!(Shared::same_owner(&donor, &aliased));

    // Resetting the donor's own handle must not kill the subobject.
    Shared::reset(&mut donor);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(*aliased, 11);

    drop(aliased);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_alias_of_empty_donor_owns_nothing() {
    let value = 42u32;
    let donor = Shared::<u8>::default();
    let alias = unsafe { Shared::alias(&donor, &value as *const u32) };

    assert!(!Shared::is_empty(&alias));
    assert!(!Shared::has_owner(&alias));
    assert_eq!(Shared::use_count(&alias), 0);
    assert_eq!(*alias, 42);
    drop(alias);
    assert_eq!(value, 42);
}

#[test]
fn test_promote_round_trip() {
    let shared = Shared::new(100);
    let weak = Shared::downgrade(&shared);

    let promoted = weak.upgrade().unwrap();
    assert_eq!(Shared::use_count(&shared), 2);
    assert!(Shared::same_owner(&shared, &promoted));

    drop(promoted);
    assert_eq!(Shared::use_count(&shared), 1);
}

#[test]
fn test_checked_promotion_failure_is_named() {
    let shared = Shared::new(100);
    let weak = Shared::downgrade(&shared);
    assert!(Shared::<i32>::try_from(&weak).is_ok());
    drop(shared);
    assert_eq!(Shared::<i32>::try_from(&weak), Err(DanglingWeak));
}

#[test]
fn test_weak_counts() {
    let shared = Shared::new(100);
    assert_eq!(Shared::weak_count(&shared), 0);

    let w1 = Shared::downgrade(&shared);
    let w2 = w1.clone();
    assert_eq!(Shared::weak_count(&shared), 2);
    assert_eq!(w1.use_count(), 1);

    drop(w2);
    assert_eq!(Shared::weak_count(&shared), 1);
    drop(w1);
    assert_eq!(Shared::weak_count(&shared), 0);
}

#[test]
fn test_weak_reset() {
    let shared = Shared::new(100);
    let mut weak = Shared::downgrade(&shared);
    weak.reset();
    assert!(weak.expired());
    assert_eq!(Shared::weak_count(&shared), 0);
}

#[test]
fn test_empty_weak() {
    let weak = Weak::<u32>::new();
    assert!(weak.expired());
    assert_eq!(weak.use_count(), 0);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_self_observation() {
    struct Node {
        observer: SelfWeak<Node>,
        tag: u32,
    }

    impl ObserveSelf for Node {
        fn self_observer(&self) -> &SelfWeak<Node> {
            &self.observer
        }
    }

    let node = Shared::new_observed(Node {
        observer: SelfWeak::new(),
        tag: 13,
    });

    let again = node.shared_from_this().expect("value is alive");
    assert_eq!(again.tag, 13);
    assert_eq!(Shared::use_count(&again), Shared::use_count(&node));
    assert!(Shared::same_owner(&again, &node));
}

#[test]
fn test_unmanaged_value_has_no_self_handle() {
    struct Node {
        observer: SelfWeak<Node>,
    }

    impl ObserveSelf for Node {
        fn self_observer(&self) -> &SelfWeak<Node> {
            &self.observer
        }
    }

    let loose = Node {
        observer: SelfWeak::new(),
    };
    assert!(loose.shared_from_this().is_none());
}

#[test]
fn test_new_cyclic() {
    struct Node {
        parent: Weak<Node>,
    }

    let node = Shared::new_cyclic(|weak| Node {
        parent: weak.clone(),
    });
    assert_eq!(Shared::use_count(&node), 1);
    let via_cycle = node.parent.upgrade().unwrap();
    assert!(Shared::same_owner(&node, &via_cycle));
}

#[test]
fn test_cyclic_weak_promotes_from_another_thread() {
    // A weak handed out during cyclic construction is promoted on a second
    // thread as soon as the first strong reference is published; the promoted
    // handle must see the fully written value.
    let mut observer = None;
    let node = Shared::new_cyclic(|weak: &Weak<(u32,)>| {
        let moved = weak.clone();
        observer = Some(thread::spawn(move || loop {
            if let Some(promoted) = moved.upgrade() {
                break promoted.0;
            }
            thread::yield_now();
        }));
        (21u32,)
    });
    assert_eq!(observer.unwrap().join().unwrap(), 21);
    assert_eq!(Shared::use_count(&node), 1);
}

#[test]
fn test_owner_identity_semantics() {
    let a = Shared::new(100);
    let b = a.clone();
    let c = Shared::new(100);

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(Shared::same_owner(&a, &b));

    // Hashing follows the stored address, so clones collide in a map while an
    // equal-valued handle from another group is never found.
    let mut map = HashMap::new();
    map.insert(a.clone(), "first");
    map.insert(b, "second");
    assert_eq!(map.len(), 1);
    assert_eq!(map[&a], "second");
    assert!(map.get(&c).is_none());
}

#[test]
fn test_downcast() {
    let drops = Arc::new(AtomicUsize::new(0));
    let any = Shared::into_any(Shared::new(Canary::new(8, &drops)));
    assert_eq!(Shared::use_count(&any), 1);

    let wrong = any.downcast::<String>().unwrap_err();
    assert_eq!(Shared::use_count(&wrong), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    let right = wrong.downcast::<Canary>().ok().unwrap();
    assert_eq!(right.value, 8);
    drop(right);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_get_mut_requires_exclusivity() {
    let mut shared = Shared::new(100);
    *unsafe { Shared::get_mut(&mut shared) }.unwrap() = 200;
    assert_eq!(*shared, 200);

    let other = shared.clone();
    assert!(unsafe { Shared::get_mut(&mut shared) }.is_none());
    drop(other);

    let weak = Shared::downgrade(&shared);
    assert!(unsafe { Shared::get_mut(&mut shared) }.is_none());
    drop(weak);

    assert!(unsafe { Shared::get_mut(&mut shared) }.is_some());
}

#[test]
fn test_multithreaded_clone_drop() {
    let drops = Arc::new(AtomicUsize::new(0));
    let shared = Shared::new(Canary::new(6, &drops));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let local = shared.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                let copy = local.clone();
                assert_eq!(copy.value, 6);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(Shared::use_count(&shared), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(shared);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_upgrade_races_final_release() {
    let drops = Arc::new(AtomicUsize::new(0));
    let shared = Shared::new(Canary::new(7, &drops));
    let weak = Shared::downgrade(&shared);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let observer = weak.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1_000_000 {
                match observer.upgrade() {
                    // A successful promotion must always see the live value.
                    Some(promoted) => assert_eq!(promoted.value, 7),
                    None => break,
                }
            }
        }));
    }

    drop(shared);
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(weak.expired());
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_atomic_shared_basic() {
    let first = Shared::new(1);
    let slot = AtomicShared::new(first.clone());
    assert_eq!(*slot.load(), 1);

    let old = slot.swap(Shared::new(2));
    assert!(Shared::same_owner(&old, &first));

    slot.store(Shared::new(3));
    assert_eq!(*slot.load(), 3);

    let inner = slot.into_inner();
    assert_eq!(*inner, 3);
}

#[test]
fn test_atomic_shared_compare_exchange() {
    let first = Shared::new(1);
    let slot = AtomicShared::new(first.clone());

    // Same value, different ownership group: representation mismatch.
    let stale = Shared::new(1);
    let replacement = Shared::new(2);
    let replacement = slot.compare_exchange(&stale, replacement).unwrap_err();

    let old = slot.compare_exchange(&first, replacement).unwrap();
    assert!(Shared::same_owner(&old, &first));
    assert_eq!(*slot.load(), 2);
}

#[test]
fn test_atomic_shared_across_threads() {
    let drops = Arc::new(AtomicUsize::new(0));
    let slot = AtomicShared::new(Shared::new(Canary::new(0, &drops)));

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    let fresh = Shared::new(Canary::new(1, &drops));
                    drop(slot.swap(fresh));
                    let seen = slot.load();
                    assert!(seen.value <= 1);
                }
            });
        }
    });

    drop(slot);
    // 1 initial + 4 threads * 100 replacements, all destroyed exactly once.
    assert_eq!(drops.load(Ordering::SeqCst), 401);
}

#[test]
fn test_empty_handle_queries() {
    let empty = Shared::<u32>::default();
    assert!(Shared::is_empty(&empty));
    assert!(!Shared::has_owner(&empty));
    assert_eq!(Shared::use_count(&empty), 0);
    assert!(Shared::get(&empty).is_none());
    assert!(Shared::as_ptr(&empty).is_null());

    let weak = Shared::downgrade(&empty);
    assert!(weak.expired());
}

#[test]
#[should_panic(expected = "dereferenced an empty Shared")]
fn test_empty_handle_deref_panics() {
    let empty = Shared::<u32>::default();
    let _ = *empty;
}

#[test]
#[should_panic(expected = "projected through an empty Shared")]
fn test_project_empty_panics() {
    let empty = Shared::<u32>::default();
    let _ = Shared::project(empty, |v| v);
}
