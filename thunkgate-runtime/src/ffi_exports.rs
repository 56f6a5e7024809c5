//! # FFI Exports
//!
//! C-compatible exports of the handle operations for embedders that can only
//! call C.
//!
//! ## Design
//!
//! The exports operate on one process-wide [`DelegatingRegistry`], built on
//! first use from [`RegistryConfig::from_env`]. Its delegate resolves the
//! same-named symbols from the next object in symbol lookup order where the
//! platform offers that, so a copy of this library loaded after another one
//! forwards to the first.
//!
//! ## Usage
//!
//! Build as a cdylib or staticlib and link with `-lthunkgate_runtime`:
//!
//! ```c
//! void *handle = thunkgate_handle_create(closure);
//! /* install handle as a callback */
//! thunkgate_handle_remove(handle);
//! ```

use std::ffi::c_int;
use std::sync::OnceLock;

use crate::closure::{ClosureHeader, ClosureRef};
use crate::config::RegistryConfig;
use crate::delegate::{Delegate, DelegatingRegistry, NoDelegate, SymbolDelegate};
use crate::registry::CallableHandle;

type GlobalRegistry = DelegatingRegistry<Box<dyn Delegate>>;

static GLOBAL: OnceLock<Option<GlobalRegistry>> = OnceLock::new();

fn global() -> Option<&'static GlobalRegistry> {
    GLOBAL
        .get_or_init(|| {
            let config = RegistryConfig::from_env();
            let delegate: Box<dyn Delegate> = match unsafe { SymbolDelegate::next() } {
                Ok(delegate) => Box::new(delegate),
                Err(err) => {
                    log::debug!("delegation unavailable: {}", err);
                    Box::new(NoDelegate)
                }
            };
            match DelegatingRegistry::with_config(delegate, &config) {
                Ok(registry) => Some(registry),
                Err(err) => {
                    log::warn!("failed to initialize handle registry: {}", err);
                    None
                }
            }
        })
        .as_ref()
}

// ============================================================================
// Handle operations
// ============================================================================

/// Create a callable handle for `closure`.
///
/// Returns null if `closure` is null or no trampoline could be allocated.
///
/// # Safety
///
/// `closure` must point to a live closure with a valid header.
#[no_mangle]
pub unsafe extern "C" fn thunkgate_handle_create(closure: *mut ClosureHeader) -> *const u8 {
    let (Some(registry), Some(closure)) = (global(), unsafe { ClosureRef::from_raw(closure) }) else {
        return std::ptr::null();
    };
    match registry.create(closure) {
        Ok(handle) => handle.as_ptr(),
        Err(err) => {
            log::warn!("{}", err);
            std::ptr::null()
        }
    }
}

/// Return the closure bound to `handle`, or null for a null handle.
///
/// # Safety
///
/// `handle` must be live: returned by [`thunkgate_handle_create`] and not
/// yet removed.
#[no_mangle]
pub unsafe extern "C" fn thunkgate_handle_lookup(handle: *const u8) -> *mut ClosureHeader {
    let (Some(registry), Some(handle)) = (global(), CallableHandle::from_raw(handle)) else {
        return std::ptr::null_mut();
    };
    unsafe { registry.lookup(handle) }
        .map(ClosureRef::as_ptr)
        .unwrap_or(std::ptr::null_mut())
}

/// Remove `handle`, releasing the closure reference it owned.
///
/// Returns `false` only for a null handle.
///
/// # Safety
///
/// `handle` must be live; it must not be called or looked up afterwards.
#[no_mangle]
pub unsafe extern "C" fn thunkgate_handle_remove(handle: *const u8) -> bool {
    let (Some(registry), Some(handle)) = (global(), CallableHandle::from_raw(handle)) else {
        return false;
    };
    unsafe { registry.remove(handle) }
}

/// Enable or disable delegation to a previously-loaded implementation.
///
/// Intended for startup, before any handle is created.
#[no_mangle]
pub extern "C" fn thunkgate_set_delegation_enabled(enabled: bool) {
    if let Some(registry) = global() {
        registry.set_delegation_enabled(enabled);
    }
}

// ============================================================================
// Runtime Initialization
// ============================================================================

/// Install the runtime logger configured from the environment.
///
/// Returns 0 on success, -1 if a logger was already installed.
#[no_mangle]
pub extern "C" fn thunkgate_log_init() -> c_int {
    match crate::log::init(&RegistryConfig::from_env().log) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
