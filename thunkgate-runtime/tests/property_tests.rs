//! Property-based tests for the handle registry.
//!
//! Uses proptest to drive random create/remove sequences against a simple
//! model and verify every live handle stays bound to its own closure.

use std::collections::HashMap;
use std::ffi::c_void;

use proptest::prelude::*;
use thunkgate_runtime::stub::{Abi, SLOT_STRIDE};
use thunkgate_runtime::{CallableHandle, Closure, ClosureHeader, HandleRegistry};

type IdHandle = unsafe extern "C" fn(*mut c_void, *const c_void) -> u64;

unsafe extern "C" fn id_invoke(closure: *const ClosureHeader, _receiver: *mut c_void) -> u64 {
    unsafe { *Closure::<u64>::state_from_raw(closure) }
}

#[derive(Debug, Clone)]
enum Op {
    /// Create a handle for closure `n % pool`.
    Create(usize),
    /// Remove the live handle at index `n % live`.
    Remove(usize),
}

/// Strategy for generating operation sequences biased towards growth.
fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => any::<usize>().prop_map(Op::Create),
            2 => any::<usize>().prop_map(Op::Remove),
        ],
        1..400,
    )
}

fn call(handle: CallableHandle) -> u64 {
    let f: IdHandle = unsafe { handle.as_fn() };
    unsafe { f(std::ptr::null_mut(), std::ptr::null()) }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Live handles are distinct, look up and dispatch to their own closure,
    /// and every acquired reference is released exactly once.
    #[test]
    fn registry_matches_model(ops in ops()) {
        let registry = HandleRegistry::new().unwrap();
        let pool: Vec<_> = (0..8u64)
            .map(|id| Closure::new(id_invoke as *const c_void, id))
            .collect();
        let mut live: Vec<(CallableHandle, usize)> = Vec::new();
        let mut owners: HashMap<CallableHandle, usize> = HashMap::new();

        for op in ops {
            match op {
                Op::Create(n) => {
                    let index = n % pool.len();
                    let handle = registry.create(pool[index].as_closure_ref()).unwrap();
                    prop_assert!(owners.insert(handle, index).is_none(), "handle handed out twice");
                    live.push((handle, index));
                }
                Op::Remove(n) if !live.is_empty() => {
                    let (handle, _) = live.swap_remove(n % live.len());
                    owners.remove(&handle);
                    let removed = unsafe { registry.remove(handle) };
                    prop_assert!(removed);
                }
                Op::Remove(_) => {}
            }

            for (handle, index) in &live {
                prop_assert_eq!(unsafe { registry.lookup(*handle) }, pool[*index].as_closure_ref());
            }
        }

        for (handle, index) in &live {
            prop_assert_eq!(call(*handle), *index as u64);
        }
        prop_assert_eq!(registry.stats().live_handles(), live.len());

        for (i, closure) in pool.iter().enumerate() {
            let held = live.iter().filter(|(_, index)| *index == i).count();
            prop_assert_eq!(closure.ref_count(), held + 1);
        }

        for (handle, _) in live.drain(..) {
            unsafe { registry.remove(handle) };
        }
        prop_assert!(pool.iter().all(|c| c.ref_count() == 1));
    }

    /// Every stub jumps back to the dispatcher at the start of its code page.
    #[test]
    fn stub_branches_to_page_start(index in 1usize..256, abi_index in 0usize..3) {
        let abi = [Abi::SysV64, Abi::Win64, Abi::Aarch64][abi_index];
        let page_size = 4096;
        let stub = abi.trampoline(index, page_size);
        let slot_off = (index * SLOT_STRIDE) as i64;

        match abi {
            Abi::SysV64 | Abi::Win64 => {
                let lea = i32::from_le_bytes([stub[3], stub[4], stub[5], stub[6]]) as i64;
                prop_assert_eq!(slot_off + 7 + lea, slot_off - page_size as i64);
                let jmp = i32::from_le_bytes([stub[8], stub[9], stub[10], stub[11]]) as i64;
                prop_assert_eq!(slot_off + 12 + jmp, 0);
            }
            Abi::Aarch64 => {
                let b = u32::from_le_bytes([stub[4], stub[5], stub[6], stub[7]]);
                prop_assert_eq!(b >> 26, 0b000101);
                let imm26 = ((b & 0x03FF_FFFF) << 6) as i32 >> 6;
                prop_assert_eq!(slot_off + 4 + (imm26 as i64) * 4, 0);
            }
        }
    }
}
