//! # Callable Handle Registry
//!
//! Create / Lookup / Remove on top of the trampoline tables.
//!
//! ## Dispatch contract
//!
//! Invoking a handle created for a closure behaves as follows:
//!
//! | Variant        | Handle called as                        | Forwarded to                              |
//! |----------------|-----------------------------------------|-------------------------------------------|
//! | `Standard`     | `(receiver, selector, args...)`         | `invoke(closure, receiver, args...)`      |
//! | `StructReturn` | `(result, receiver, selector, args...)` | `invoke(result, closure, receiver, args...)` |
//!
//! The selector argument is consumed by the dispatcher. On AArch64 every
//! closure uses `Standard`; the hidden result pointer travels in `x8` and is
//! untouched.
//!
//! ## Ownership
//!
//! `create` acquires its own reference to the closure through the
//! [`ClosureRuntime`]; `remove` releases it. The caller's reference is never
//! consumed.

use std::fmt;
use std::ptr::NonNull;

use crate::closure::{ClosureRef, ClosureRuntime, HeaderRuntime};
use crate::config::RegistryConfig;
use crate::page::{ConfigRecord, TrampolineResult, TrampolineSlot};
use crate::stub::{Abi, CallingConvention};
use crate::table::{TableStats, TrampolineTables};

// ============================================================================
// Callable handles
// ============================================================================

/// An ABI-conforming function pointer bound to one closure.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CallableHandle(NonNull<u8>);

impl CallableHandle {
    /// Wrap a raw entry address.
    ///
    /// Returns `None` for null.
    pub fn from_raw(ptr: *const u8) -> Option<Self> {
        NonNull::new(ptr as *mut u8).map(Self)
    }

    /// The entry address.
    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Reinterpret as a concrete function pointer type.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "C"` (or `extern "system"`) function pointer
    /// type whose signature matches the dispatch contract for the closure
    /// the handle was created for. The handle must be live whenever the
    /// returned pointer is called.
    pub unsafe fn as_fn<F: Copy>(self) -> F {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const u8>());
        unsafe { std::mem::transmute_copy(&self.0) }
    }

    fn slot(self) -> TrampolineSlot {
        TrampolineSlot::from_entry(self.0)
    }
}

impl From<TrampolineSlot> for CallableHandle {
    fn from(slot: TrampolineSlot) -> Self {
        Self(slot.entry())
    }
}

impl fmt::Debug for CallableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallableHandle({:#x})", self.0.as_ptr() as usize)
    }
}

// Handles are plain code addresses.
unsafe impl Send for CallableHandle {}
unsafe impl Sync for CallableHandle {}

// ============================================================================
// Registry
// ============================================================================

/// Occupancy across both variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Standard-variant table.
    pub standard: TableStats,
    /// Struct-return table, if the ABI has one.
    pub struct_return: Option<TableStats>,
}

impl RegistryStats {
    /// Total live handles.
    pub fn live_handles(&self) -> usize {
        self.standard.in_use + self.struct_return.map_or(0, |s| s.in_use)
    }

    /// Total mapped pages.
    pub fn pages(&self) -> usize {
        self.standard.pages + self.struct_return.map_or(0, |s| s.pages)
    }
}

/// Hands out callable handles for closures.
///
/// Internally synchronized; share it by reference.
pub struct HandleRegistry<R: ClosureRuntime = HeaderRuntime> {
    tables: TrampolineTables,
    runtime: R,
}

impl HandleRegistry<HeaderRuntime> {
    /// Registry for the host ABI using header-dispatched ownership.
    pub fn new() -> TrampolineResult<Self> {
        Self::with_runtime(HeaderRuntime)
    }

    /// Registry for the host ABI, pre-mapping pages per `config`.
    ///
    /// Fails with [`crate::page::TrampolineErrorKind::InvalidConfig`] if
    /// `config` does not validate.
    pub fn with_config(config: &RegistryConfig) -> TrampolineResult<Self> {
        config.validate()?;
        let registry = Self::new()?;
        if config.preallocate_pages > 0 {
            registry.tables.reserve_pages(config.preallocate_pages)?;
            log::debug!(
                "reserved {} trampoline page(s) per variant",
                config.preallocate_pages
            );
        }
        Ok(registry)
    }
}

impl<R: ClosureRuntime> HandleRegistry<R> {
    /// Registry for the host ABI with a custom closure runtime.
    pub fn with_runtime(runtime: R) -> TrampolineResult<Self> {
        Ok(Self::from_tables(TrampolineTables::for_host()?, runtime))
    }

    pub(crate) fn from_tables(tables: TrampolineTables, runtime: R) -> Self {
        log::debug!(
            "handle registry for {} (struct-return table: {})",
            tables.abi(),
            tables.table(CallingConvention::StructReturn).is_some()
        );
        Self { tables, runtime }
    }

    /// Bind a new handle to `closure`.
    ///
    /// Acquires a reference to `closure` that lives until [`Self::remove`].
    /// Concurrent calls never return the same handle.
    pub fn create(&self, closure: ClosureRef<'_>) -> TrampolineResult<CallableHandle> {
        let table = self.tables.select(self.runtime.uses_struct_return(closure));
        let slot = table.allocate()?;
        let owned = self.runtime.acquire(closure);

        let record = ConfigRecord {
            closure: owned.as_ptr(),
            slot: slot.identity(),
        };
        // The slot is exclusively ours until freed.
        unsafe { slot.write_config(self.tables.page_size(), record) };

        let handle = CallableHandle::from(slot);
        log::trace!("created {:?} for {:?} ({})", handle, owned, table.convention());
        Ok(handle)
    }

    /// The closure bound to `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by [`Self::create`] on this registry
    /// and not yet removed.
    pub unsafe fn lookup(&self, handle: CallableHandle) -> ClosureRef<'_> {
        let record = unsafe { handle.slot().read_config(self.tables.page_size()) };
        // Live records always carry the closure written by `create`.
        unsafe { ClosureRef::from_raw_unchecked(record.closure) }
    }

    /// Unbind `handle`, free its slot and release the owned reference.
    ///
    /// Returns `true`.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by [`Self::create`] on this registry
    /// and not yet removed. Calling or looking up the handle afterwards is
    /// undefined behavior.
    pub unsafe fn remove(&self, handle: CallableHandle) -> bool {
        let page_size = self.tables.page_size();
        let record = unsafe { handle.slot().read_config(page_size) };
        let closure = unsafe { ClosureRef::from_raw_unchecked(record.closure) };

        unsafe { handle.slot().write_config(page_size, ConfigRecord::EMPTY) };
        if let Some(slot) = unsafe { TrampolineSlot::from_identity(record.slot) } {
            self.tables
                .select(self.runtime.uses_struct_return(closure))
                .free(slot);
        }
        unsafe { self.runtime.release(closure) };

        log::trace!("removed {:?}", handle);
        true
    }

    /// Variant a closure would be registered under.
    pub fn convention_for(&self, closure: ClosureRef<'_>) -> CallingConvention {
        self.tables.resolve(self.runtime.uses_struct_return(closure))
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            standard: self.tables.select(false).stats(),
            struct_return: self
                .tables
                .table(CallingConvention::StructReturn)
                .map(|table| table.stats()),
        }
    }

    /// ABI the trampolines were generated for.
    pub fn abi(&self) -> Abi {
        self.tables.abi()
    }

    /// The closure runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: ClosureRuntime> fmt::Debug for HandleRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("abi", &self.abi())
            .field("stats", &self.stats())
            .finish()
    }
}
