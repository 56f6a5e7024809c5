//! Trampoline Integration Tests
//!
//! These tests call through real trampolines:
//! 1. Create a handle for a closure
//! 2. Call the handle as a plain function pointer
//! 3. Verify the closure's invoke entry saw the rewritten arguments
//!
//! They run on every host with trampoline templates (x86-64 and AArch64).

use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;

use thunkgate_runtime::page::TrampolinePage;
use thunkgate_runtime::platform;
use thunkgate_runtime::{
    CallableHandle, CallingConvention, Closure, ClosureFlags, ClosureHeader, HandleRegistry,
};

// ============================================================================
// Invoke entries
// ============================================================================

type AddHandle = unsafe extern "C" fn(*mut c_void, *const c_void, i64) -> i64;

/// `state + *receiver + x`
unsafe extern "C" fn add_invoke(closure: *const ClosureHeader, receiver: *mut c_void, x: i64) -> i64 {
    let base = unsafe { *Closure::<i64>::state_from_raw(closure) };
    let offset = if receiver.is_null() {
        0
    } else {
        unsafe { *(receiver as *const i64) }
    };
    base + offset + x
}

type ScaleHandle = unsafe extern "C" fn(*mut c_void, *const c_void, f64, f64) -> f64;

/// `state * (a + b)`
unsafe extern "C" fn scale_invoke(closure: *const ClosureHeader, _receiver: *mut c_void, a: f64, b: f64) -> f64 {
    let factor = unsafe { *Closure::<f64>::state_from_raw(closure) };
    factor * (a + b)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quad {
    a: i64,
    b: i64,
    c: i64,
    d: i64,
}

type QuadHandle = unsafe extern "C" fn(*mut c_void, *const c_void, i64) -> Quad;

/// Four consecutive values starting at `state + x`, tagged with the receiver.
unsafe extern "C" fn quad_invoke(closure: *const ClosureHeader, receiver: *mut c_void, x: i64) -> Quad {
    let start = unsafe { *Closure::<i64>::state_from_raw(closure) } + x;
    Quad {
        a: start,
        b: start + 1,
        c: start + 2,
        d: receiver as i64,
    }
}

fn add_closure(base: i64) -> Closure<i64> {
    Closure::new(add_invoke as *const c_void, base)
}

unsafe fn call_add(handle: CallableHandle, receiver: Option<&mut i64>, x: i64) -> i64 {
    let f: AddHandle = unsafe { handle.as_fn() };
    let receiver = receiver.map_or(ptr::null_mut(), |r| r as *mut i64 as *mut c_void);
    unsafe { f(receiver, 0xDEAD as *const c_void, x) }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_invoke_integer_closure() {
    let registry = HandleRegistry::new().unwrap();
    let closure = add_closure(40);
    let handle = registry.create(closure.as_closure_ref()).unwrap();

    let mut receiver = 100i64;
    unsafe {
        assert_eq!(call_add(handle, None, 2), 42);
        assert_eq!(call_add(handle, Some(&mut receiver), 2), 142);
        assert!(registry.remove(handle));
    }
}

#[test]
fn test_invoke_float_closure() {
    let registry = HandleRegistry::new().unwrap();
    let closure = Closure::new(scale_invoke as *const c_void, 2.5f64);
    let handle = registry.create(closure.as_closure_ref()).unwrap();

    let f: ScaleHandle = unsafe { handle.as_fn() };
    let result = unsafe { f(ptr::null_mut(), ptr::null(), 1.5, 2.5) };
    assert_eq!(result, 10.0);

    unsafe { registry.remove(handle) };
}

#[test]
fn test_invoke_struct_return_closure() {
    let registry = HandleRegistry::new().unwrap();
    let closure = Closure::with_flags(quad_invoke as *const c_void, ClosureFlags::STRUCT_RETURN, 10i64);
    let handle = registry.create(closure.as_closure_ref()).unwrap();

    let expected_convention = if registry.abi().has_struct_return_variant() {
        CallingConvention::StructReturn
    } else {
        CallingConvention::Standard
    };
    assert_eq!(registry.convention_for(closure.as_closure_ref()), expected_convention);

    let f: QuadHandle = unsafe { handle.as_fn() };
    let quad = unsafe { f(0x77 as *mut c_void, 0xDEAD as *const c_void, 5) };
    assert_eq!(
        quad,
        Quad {
            a: 15,
            b: 16,
            c: 17,
            d: 0x77
        }
    );

    unsafe { registry.remove(handle) };
}

#[test]
fn test_struct_return_and_standard_handles_coexist() {
    let registry = HandleRegistry::new().unwrap();
    let plain = add_closure(1);
    let sret = Closure::with_flags(quad_invoke as *const c_void, ClosureFlags::STRUCT_RETURN, 100i64);

    let hp = registry.create(plain.as_closure_ref()).unwrap();
    let hs = registry.create(sret.as_closure_ref()).unwrap();
    assert_ne!(hp, hs);

    let f: QuadHandle = unsafe { hs.as_fn() };
    unsafe {
        assert_eq!(call_add(hp, None, 1), 2);
        assert_eq!(f(ptr::null_mut(), ptr::null(), 0).a, 100);
        assert_eq!(call_add(hp, None, 2), 3);
        registry.remove(hp);
        registry.remove(hs);
    }
}

#[test]
fn test_reused_slot_dispatches_to_new_closure() {
    let registry = HandleRegistry::new().unwrap();
    let a = add_closure(1000);
    let b = add_closure(2000);

    let ha = registry.create(a.as_closure_ref()).unwrap();
    assert_eq!(unsafe { call_add(ha, None, 1) }, 1001);
    unsafe { registry.remove(ha) };
    assert_eq!(a.ref_count(), 1);

    let hb = registry.create(b.as_closure_ref()).unwrap();
    assert_eq!(hb, ha);
    assert_eq!(unsafe { registry.lookup(hb) }, b.as_closure_ref());
    assert_eq!(unsafe { call_add(hb, None, 1) }, 2001);
    unsafe { registry.remove(hb) };
}

#[test]
fn test_many_handles_across_pages() {
    let registry = HandleRegistry::new().unwrap();
    let count = TrampolinePage::slots_per_page(platform::page_size()) * 2 + 5;

    let closures: Vec<_> = (0..count as i64).map(add_closure).collect();
    let handles: Vec<_> = closures
        .iter()
        .map(|c| registry.create(c.as_closure_ref()).unwrap())
        .collect();

    assert_eq!(registry.stats().standard.pages, 3);
    let unique: HashSet<_> = handles.iter().collect();
    assert_eq!(unique.len(), count);

    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(unsafe { call_add(*handle, None, 0) }, i as i64);
    }
    for handle in handles {
        assert!(unsafe { registry.remove(handle) });
    }
    assert!(closures.iter().all(|c| c.ref_count() == 1));
    assert_eq!(registry.stats().live_handles(), 0);
}

#[test]
fn test_closure_outlives_caller_reference() {
    let registry = HandleRegistry::new().unwrap();
    let closure = add_closure(7);
    let handle = registry.create(closure.as_closure_ref()).unwrap();
    drop(closure);

    // The registry's reference keeps the state alive.
    assert_eq!(unsafe { call_add(handle, None, 0) }, 7);
    unsafe { registry.remove(handle) };
}

#[test]
fn test_concurrent_create_yields_distinct_live_handles() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 300;

    let registry = HandleRegistry::new().unwrap();
    let closure = add_closure(0);

    let per_thread: Vec<Vec<CallableHandle>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = &registry;
                let closure = closure.as_closure_ref();
                s.spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            let handle = registry.create(closure).unwrap();
                            let x = (t * PER_THREAD + i) as i64;
                            assert_eq!(unsafe { call_add(handle, None, x) }, x);
                            handle
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let all: HashSet<_> = per_thread.iter().flatten().collect();
    assert_eq!(all.len(), THREADS * PER_THREAD);
    assert_eq!(registry.stats().live_handles(), THREADS * PER_THREAD);
    assert_eq!(closure.ref_count(), THREADS * PER_THREAD + 1);

    std::thread::scope(|s| {
        for handles in &per_thread {
            let registry = &registry;
            s.spawn(move || {
                for handle in handles {
                    assert!(unsafe { registry.remove(*handle) });
                }
            });
        }
    });
    assert_eq!(registry.stats().live_handles(), 0);
    assert_eq!(closure.ref_count(), 1);
}

#[test]
fn test_concurrent_churn_keeps_handles_bound() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 500;

    let registry = HandleRegistry::new().unwrap();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let registry = &registry;
            s.spawn(move || {
                let closure = add_closure(t as i64 * 1_000_000);
                for round in 0..ROUNDS {
                    let handle = registry.create(closure.as_closure_ref()).unwrap();
                    let x = round as i64;
                    assert_eq!(unsafe { call_add(handle, None, x) }, t as i64 * 1_000_000 + x);
                    assert_eq!(unsafe { registry.lookup(handle) }, closure.as_closure_ref());
                    assert!(unsafe { registry.remove(handle) });
                }
                assert_eq!(closure.ref_count(), 1);
            });
        }
    });

    let stats = registry.stats();
    assert_eq!(stats.live_handles(), 0);
    assert!(stats.standard.pages <= THREADS);
}
