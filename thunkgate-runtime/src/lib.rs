//! # Thunkgate Runtime Library
//!
//! Hands out closures as plain, ABI-conforming function pointers.
//!
//! - **Trampoline Pages**: executable stubs stamped into page pairs, one
//!   read-write config page below one sealed code page
//! - **Trampoline Tables**: one lock-protected free list per calling-convention variant
//! - **Handle Registry**: Create / Lookup / Remove on callable handles
//! - **Delegation**: optional forwarding to a previously-loaded implementation
//! - **C Exports**: the same operations over a process-wide registry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      THUNKGATE RUNTIME                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌────────────────┐  ┌────────────────┐                         │
//! │  │  C Exports     │─▶│  Delegation    │──▶ previously-loaded    │
//! │  │(ffi_exports.rs)│  │ (delegate.rs)  │    implementation       │
//! │  └────────────────┘  └────────────────┘                         │
//! │                              │                                  │
//! │                      ┌────────────────┐  ┌────────────────┐     │
//! │                      │   Registry     │─▶│   Closures     │     │
//! │                      │ (registry.rs)  │  │  (closure.rs)  │     │
//! │                      └────────────────┘  └────────────────┘     │
//! │                              │                                  │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐     │
//! │  │    Tables      │─▶│    Pages       │─▶│  Stubs (bytes) │     │
//! │  │  (table.rs)    │  │   (page.rs)    │  │   (stub.rs)    │     │
//! │  └────────────────┘  └────────────────┘  └────────────────┘     │
//! │                              │                                  │
//! │                      ┌────────────────┐                         │
//! │                      │   Platform     │  mmap / VirtualAlloc    │
//! │                      │ (platform.rs)  │                         │
//! │                      └────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::ffi::c_void;
//! use thunkgate_runtime::{Closure, ClosureHeader, HandleRegistry};
//!
//! unsafe extern "C" fn add(closure: *const ClosureHeader, _recv: *mut c_void, x: i64) -> i64 {
//!     unsafe { *Closure::<i64>::state_from_raw(closure) + x }
//! }
//!
//! let registry = HandleRegistry::new()?;
//! let closure = Closure::new(add as *const c_void, 40i64);
//! let handle = registry.create(closure.as_closure_ref())?;
//!
//! let f: unsafe extern "C" fn(*mut c_void, *const c_void, i64) -> i64 = unsafe { handle.as_fn() };
//! assert_eq!(unsafe { f(std::ptr::null_mut(), std::ptr::null(), 2) }, 42);
//!
//! unsafe { registry.remove(handle) };
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod closure;
pub mod config;
pub mod delegate;
pub mod ffi_exports;
pub mod log;
pub mod page;
pub mod platform;
pub mod registry;
pub mod stub;
pub mod table;

// Re-exports
pub use closure::{Closure, ClosureFlags, ClosureHeader, ClosureOps, ClosureRef, ClosureRuntime, HeaderRuntime};
pub use config::{ConfigError, LogConfig, RegistryConfig, RegistryConfigBuilder};
pub use delegate::{Delegate, DelegateError, DelegateErrorKind, DelegatingRegistry, NoDelegate, SymbolDelegate};
pub use page::{TrampolineError, TrampolineErrorKind, TrampolineResult};
pub use registry::{CallableHandle, HandleRegistry, RegistryStats};
pub use stub::{Abi, CallingConvention};
pub use table::TableStats;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a registry with default configuration.
pub fn init() -> TrampolineResult<HandleRegistry> {
    HandleRegistry::new()
}

/// Build a registry from `THUNKGATE_*` environment variables and install the
/// runtime logger if no logger is installed yet.
///
/// See [`RegistryConfig::from_env`] for the supported variables.
pub fn init_from_env() -> TrampolineResult<HandleRegistry> {
    let config = RegistryConfig::from_env();
    if crate::log::init(&config.log).is_err() {
        ::log::debug!("a logger is already installed");
    }
    HandleRegistry::with_config(&config)
}
