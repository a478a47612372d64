use std::{ops::Deref, rc::Rc, sync::Arc, time::Instant};

use sharc::Shared;

fn test_clone_shared(n: f64) -> f64 {
    let shared = Shared::new(100);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(shared.clone());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_clone_arc(n: f64) -> f64 {
    let arc = Arc::new(100);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(arc.clone());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_clone_rc(n: f64) -> f64 {
    let rc = Rc::new(100);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(rc.clone());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_deref_shared(n: f64) -> f64 {
    let shared = Shared::new(100);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(shared.deref());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_deref_arc(n: f64) -> f64 {
    let arc = Arc::new(100);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(arc.deref());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_deref_rc(n: f64) -> f64 {
    let rc = Rc::new(100);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(rc.deref());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_upgrade_shared(n: f64) -> f64 {
    let shared = Shared::new(100);
    let weak = Shared::downgrade(&shared);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(weak.upgrade());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn test_upgrade_arc(n: f64) -> f64 {
    let arc = Arc::new(100);
    let weak = Arc::downgrade(&arc);

    let start = Instant::now();
    for _ in 0..(n as u64) {
        std::hint::black_box(weak.upgrade());
    }
    let end = Instant::now();
    (end - start).as_nanos() as f64 / n
}

fn main() {
    let n = 10e6;

    println!("Clone test Shared ({}x): {}ns avg", n, test_clone_shared(n));
    println!("Clone test Arc ({}x): {}ns avg", n, test_clone_arc(n));
    println!("Clone test Rc ({}x): {}ns avg", n, test_clone_rc(n));

    println!("Deref test Shared ({}x): {}ns avg", n, test_deref_shared(n));
    println!("Deref test Arc ({}x): {}ns avg", n, test_deref_arc(n));
    println!("Deref test Rc ({}x): {}ns avg", n, test_deref_rc(n));

    println!(
        "Upgrade test Shared ({}x): {}ns avg",
        n,
        test_upgrade_shared(n)
    );
    println!("Upgrade test Arc ({}x): {}ns avg", n, test_upgrade_arc(n));
}
