//! # Delegation Facade
//!
//! Forwards Create / Lookup / Remove to a previously-loaded implementation
//! of the same operations when one is available, and falls back to a local
//! [`HandleRegistry`] otherwise.
//!
//! ## Design
//!
//! - The source of foreign implementations is an injected [`Delegate`].
//! - [`SymbolDelegate`] resolves the exported C symbols, either from a
//!   library loaded by path (via libloading) or, on Unix, from the next
//!   object in symbol lookup order (`RTLD_NEXT`).
//! - Each symbol is resolved once and cached for the delegate's lifetime.
//! - A single toggle decides whether delegation is attempted at all. It is
//!   meant to be set during startup: a handle must be removed by whichever
//!   side created it, so flipping the toggle while handles are live is a
//!   caller error.

use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use libloading::Library;

use crate::closure::{ClosureHeader, ClosureRef, ClosureRuntime, HeaderRuntime};
use crate::config::RegistryConfig;
use crate::page::{TrampolineError, TrampolineErrorKind, TrampolineResult};
use crate::registry::{CallableHandle, HandleRegistry};

/// Exported name of the create operation.
pub const CREATE_SYMBOL: &str = "thunkgate_handle_create";
/// Exported name of the lookup operation.
pub const LOOKUP_SYMBOL: &str = "thunkgate_handle_lookup";
/// Exported name of the remove operation.
pub const REMOVE_SYMBOL: &str = "thunkgate_handle_remove";

/// C signature of the create operation. Returns null on failure.
pub type CreateFn = unsafe extern "C" fn(closure: *mut ClosureHeader) -> *const u8;
/// C signature of the lookup operation.
pub type LookupFn = unsafe extern "C" fn(handle: *const u8) -> *mut ClosureHeader;
/// C signature of the remove operation.
pub type RemoveFn = unsafe extern "C" fn(handle: *const u8) -> bool;

// ============================================================================
// Errors
// ============================================================================

/// Delegate setup error.
#[derive(Debug, Clone)]
pub struct DelegateError {
    /// Error kind.
    pub kind: DelegateErrorKind,
    /// Error message.
    pub message: String,
}

impl DelegateError {
    /// Create a new delegate error.
    pub fn new(kind: DelegateErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for DelegateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DelegateError {}

/// Delegate error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateErrorKind {
    /// Library not found or failed to load.
    LibraryNotFound,
    /// The platform offers no such symbol source.
    Unsupported,
}

// ============================================================================
// Delegate strategy
// ============================================================================

/// Source of previously-loaded implementations.
///
/// Each accessor returns `None` when no implementation is available; the
/// facade then runs the operation locally.
pub trait Delegate: Send + Sync {
    /// Foreign create operation.
    fn create_fn(&self) -> Option<CreateFn>;
    /// Foreign lookup operation.
    fn lookup_fn(&self) -> Option<LookupFn>;
    /// Foreign remove operation.
    fn remove_fn(&self) -> Option<RemoveFn>;
}

/// A delegate that never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelegate;

impl Delegate for NoDelegate {
    fn create_fn(&self) -> Option<CreateFn> {
        None
    }

    fn lookup_fn(&self) -> Option<LookupFn> {
        None
    }

    fn remove_fn(&self) -> Option<RemoveFn> {
        None
    }
}

impl<D: Delegate + ?Sized> Delegate for Box<D> {
    fn create_fn(&self) -> Option<CreateFn> {
        (**self).create_fn()
    }

    fn lookup_fn(&self) -> Option<LookupFn> {
        (**self).lookup_fn()
    }

    fn remove_fn(&self) -> Option<RemoveFn> {
        (**self).remove_fn()
    }
}

enum SymbolSource {
    Library { name: String, library: Library },
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
    Next,
}

impl SymbolSource {
    fn resolve(&self, name: &str) -> Option<*mut c_void> {
        let mut cname = Vec::with_capacity(name.len() + 1);
        cname.extend_from_slice(name.as_bytes());
        cname.push(0);

        let addr = match self {
            SymbolSource::Library { library, .. } => unsafe {
                library
                    .get::<*mut c_void>(&cname)
                    .ok()
                    .map(|symbol| *symbol)?
            },
            #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
            SymbolSource::Next => unsafe {
                nix::libc::dlsym(nix::libc::RTLD_NEXT, cname.as_ptr() as *const nix::libc::c_char)
            },
        };
        (!addr.is_null()).then_some(addr)
    }

    fn describe(&self) -> &str {
        match self {
            SymbolSource::Library { name, .. } => name,
            #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
            SymbolSource::Next => "RTLD_NEXT",
        }
    }
}

/// Resolves the operations as exported C symbols.
pub struct SymbolDelegate {
    source: SymbolSource,
    create: OnceLock<Option<CreateFn>>,
    lookup: OnceLock<Option<LookupFn>>,
    remove: OnceLock<Option<RemoveFn>>,
}

impl SymbolDelegate {
    /// Load a library and resolve the operations from it.
    ///
    /// # Safety
    ///
    /// Loading a library can execute initialization code. The caller must
    /// ensure the library is trusted and that any symbols it exports under
    /// these names have the documented signatures.
    pub unsafe fn open(path: impl AsRef<Path>) -> Result<Self, DelegateError> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }.map_err(|e| {
            DelegateError::new(
                DelegateErrorKind::LibraryNotFound,
                format!("failed to load library '{}': {}", path.display(), e),
            )
        })?;
        Ok(Self::with_source(SymbolSource::Library {
            name: path.display().to_string(),
            library,
        }))
    }

    /// Resolve the operations from an already-loaded library.
    ///
    /// # Safety
    ///
    /// Symbols exported under these names must have the documented signatures.
    pub unsafe fn from_library(name: impl Into<String>, library: Library) -> Self {
        Self::with_source(SymbolSource::Library {
            name: name.into(),
            library,
        })
    }

    /// Resolve the operations from the next object in symbol lookup order.
    ///
    /// # Safety
    ///
    /// Symbols exported under these names must have the documented signatures.
    pub unsafe fn next() -> Result<Self, DelegateError> {
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
        {
            Ok(Self::with_source(SymbolSource::Next))
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
        {
            Err(DelegateError::new(
                DelegateErrorKind::Unsupported,
                "next-object symbol lookup is not available on this platform",
            ))
        }
    }

    fn with_source(source: SymbolSource) -> Self {
        Self {
            source,
            create: OnceLock::new(),
            lookup: OnceLock::new(),
            remove: OnceLock::new(),
        }
    }

    fn resolve(&self, name: &str) -> Option<*mut c_void> {
        let addr = self.source.resolve(name);
        match addr {
            Some(addr) => log::debug!("resolved {} at {:p} from {}", name, addr, self.source.describe()),
            None => log::debug!("{} not found in {}", name, self.source.describe()),
        }
        addr
    }
}

impl Delegate for SymbolDelegate {
    fn create_fn(&self) -> Option<CreateFn> {
        *self.create.get_or_init(|| {
            self.resolve(CREATE_SYMBOL)
                .map(|addr| unsafe { std::mem::transmute::<*mut c_void, CreateFn>(addr) })
        })
    }

    fn lookup_fn(&self) -> Option<LookupFn> {
        *self.lookup.get_or_init(|| {
            self.resolve(LOOKUP_SYMBOL)
                .map(|addr| unsafe { std::mem::transmute::<*mut c_void, LookupFn>(addr) })
        })
    }

    fn remove_fn(&self) -> Option<RemoveFn> {
        *self.remove.get_or_init(|| {
            self.resolve(REMOVE_SYMBOL)
                .map(|addr| unsafe { std::mem::transmute::<*mut c_void, RemoveFn>(addr) })
        })
    }
}

impl fmt::Debug for SymbolDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolDelegate")
            .field("source", &self.source.describe())
            .finish()
    }
}

// ============================================================================
// Facade
// ============================================================================

/// Create / Lookup / Remove with optional forwarding to a [`Delegate`].
pub struct DelegatingRegistry<D: Delegate = SymbolDelegate, R: ClosureRuntime = HeaderRuntime> {
    local: HandleRegistry<R>,
    delegate: D,
    enabled: AtomicBool,
}

impl<D: Delegate> DelegatingRegistry<D, HeaderRuntime> {
    /// Build a facade over a fresh host registry.
    pub fn with_config(delegate: D, config: &RegistryConfig) -> TrampolineResult<Self> {
        Ok(Self::new(HandleRegistry::with_config(config)?, delegate, config.delegation_enabled))
    }
}

impl<D: Delegate, R: ClosureRuntime> DelegatingRegistry<D, R> {
    /// Wrap an existing registry.
    pub fn new(local: HandleRegistry<R>, delegate: D, enabled: bool) -> Self {
        Self {
            local,
            delegate,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Enable or disable delegation.
    pub fn set_delegation_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether delegation is attempted.
    pub fn delegation_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    #[inline]
    fn active<F>(&self, f: impl FnOnce(&D) -> Option<F>) -> Option<F> {
        if self.delegation_enabled() {
            f(&self.delegate)
        } else {
            None
        }
    }

    /// Bind a new handle to `closure`.
    pub fn create(&self, closure: ClosureRef<'_>) -> TrampolineResult<CallableHandle> {
        match self.active(D::create_fn) {
            Some(create) => {
                let raw = unsafe { create(closure.as_ptr()) };
                CallableHandle::from_raw(raw).ok_or_else(|| {
                    log::warn!("delegated {} returned null", CREATE_SYMBOL);
                    TrampolineError::new(
                        TrampolineErrorKind::AllocationFailed,
                        "delegated create returned no handle",
                    )
                })
            }
            None => self.local.create(closure),
        }
    }

    /// The closure bound to `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must be live and must have been created through this facade
    /// under the current toggle setting.
    pub unsafe fn lookup(&self, handle: CallableHandle) -> Option<ClosureRef<'_>> {
        match self.active(D::lookup_fn) {
            Some(lookup) => unsafe { ClosureRef::from_raw(lookup(handle.as_ptr())) },
            None => Some(unsafe { self.local.lookup(handle) }),
        }
    }

    /// Unbind `handle`.
    ///
    /// # Safety
    ///
    /// As [`Self::lookup`]; the handle is dead afterwards.
    pub unsafe fn remove(&self, handle: CallableHandle) -> bool {
        match self.active(D::remove_fn) {
            Some(remove) => unsafe { remove(handle.as_ptr()) },
            None => unsafe { self.local.remove(handle) },
        }
    }

    /// The local registry.
    pub fn local(&self) -> &HandleRegistry<R> {
        &self.local
    }

    /// The delegate.
    pub fn delegate(&self) -> &D {
        &self.delegate
    }
}

impl<D: Delegate, R: ClosureRuntime> fmt::Debug for DelegatingRegistry<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatingRegistry")
            .field("local", &self.local)
            .field("delegation_enabled", &self.delegation_enabled())
            .finish()
    }
}
