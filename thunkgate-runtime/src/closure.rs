//! # Closure Values
//!
//! The closure representation trampolines dispatch into, and the runtime
//! contract the handle registry relies on to own references.
//!
//! ## Header layout
//!
//! Every closure starts with a [`ClosureHeader`]:
//!
//! ```text
//! ┌────────────────────┬────────────────┬─────────────────────┬─────────┐
//! │ invoke (word 0)    │ flags (u32)    │ ops (&ClosureOps)   │ payload │
//! └────────────────────┴────────────────┴─────────────────────┴─────────┘
//! ```
//!
//! The trampoline dispatcher jumps through word 0, so `invoke` must stay
//! first. The invoke entry receives the closure pointer in place of the
//! handle's selector argument (see [`crate::stub`]).
//!
//! [`Closure<T>`] is a reference-counted heap closure built on this header.
//! Foreign closures only need a compatible header and [`ClosureOps`].

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// Per-closure flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ClosureFlags(u32);

impl ClosureFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The invoke entry returns its result through a hidden pointer argument.
    pub const STRUCT_RETURN: Self = Self(1 << 0);

    /// Create from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if all flags in `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl fmt::Debug for ClosureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClosureFlags({:#x})", self.0)
    }
}

/// Reference-counting operations of a closure.
#[repr(C)]
pub struct ClosureOps {
    /// Add one owned reference.
    pub retain: unsafe extern "C" fn(*mut ClosureHeader),
    /// Drop one owned reference, destroying the closure on the last one.
    pub release: unsafe extern "C" fn(*mut ClosureHeader),
}

impl fmt::Debug for ClosureOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureOps").finish_non_exhaustive()
    }
}

/// Common prefix of every closure value.
#[repr(C)]
#[derive(Debug)]
pub struct ClosureHeader {
    /// Invoke entry point. Must be the first word.
    pub invoke: *const c_void,
    /// Closure flags.
    pub flags: ClosureFlags,
    /// Reference-counting operations.
    pub ops: &'static ClosureOps,
}

/// A borrowed pointer to a live closure.
///
/// `ClosureRef` does not own a reference by itself. The lifetime ties it to
/// whatever keeps the closure alive: a [`Closure`] borrowed through
/// [`Closure::as_closure_ref`], or the caller's contract for
/// [`ClosureRef::from_raw`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureRef<'a> {
    ptr: NonNull<ClosureHeader>,
    _marker: PhantomData<&'a ClosureHeader>,
}

impl<'a> ClosureRef<'a> {
    /// Wrap a raw closure pointer. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to a valid [`ClosureHeader`] that stays
    /// alive for `'a`.
    pub unsafe fn from_raw(ptr: *mut ClosureHeader) -> Option<Self> {
        NonNull::new(ptr).map(Self::from_non_null)
    }

    /// Wrap a pointer known to be non-null.
    ///
    /// # Safety
    ///
    /// As [`ClosureRef::from_raw`], and `ptr` must not be null.
    #[inline]
    pub(crate) unsafe fn from_raw_unchecked(ptr: *mut ClosureHeader) -> Self {
        Self::from_non_null(unsafe { NonNull::new_unchecked(ptr) })
    }

    #[inline]
    fn from_non_null(ptr: NonNull<ClosureHeader>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// The raw closure pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut ClosureHeader {
        self.ptr.as_ptr()
    }

    #[inline]
    fn header(self) -> &'a ClosureHeader {
        unsafe { &*self.ptr.as_ptr() }
    }

    /// The closure's flags.
    #[inline]
    pub fn flags(self) -> ClosureFlags {
        self.header().flags
    }

    /// Whether the closure returns its result through a hidden pointer.
    #[inline]
    pub fn uses_struct_return(self) -> bool {
        self.flags().contains(ClosureFlags::STRUCT_RETURN)
    }

    /// The invoke entry point the dispatcher jumps to.
    #[inline]
    pub fn invoke_entry(self) -> *const c_void {
        self.header().invoke
    }
}

impl fmt::Debug for ClosureRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClosureRef({:p})", self.ptr)
    }
}

// A ClosureRef is a plain address; thread-safety of the closure itself is
// the closure runtime's responsibility.
unsafe impl Send for ClosureRef<'_> {}
unsafe impl Sync for ClosureRef<'_> {}

// ============================================================================
// Closure Runtime
// ============================================================================

/// Ownership operations the handle registry performs on closures.
pub trait ClosureRuntime: Send + Sync {
    /// Acquire a new owned reference, independent of the caller's.
    ///
    /// May return a different pointer (for example a heap copy); the
    /// returned value is what gets stored and later looked up.
    fn acquire<'a>(&self, closure: ClosureRef<'a>) -> ClosureRef<'a>;

    /// Release an owned reference previously returned by `acquire`.
    ///
    /// # Safety
    ///
    /// `closure` must carry a reference owned by the caller, which is
    /// consumed by this call.
    unsafe fn release(&self, closure: ClosureRef<'_>);

    /// Whether the closure needs the struct-return trampoline shape.
    fn uses_struct_return(&self, closure: ClosureRef<'_>) -> bool {
        closure.uses_struct_return()
    }
}

/// Runtime that dispatches through each closure's own [`ClosureOps`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderRuntime;

impl ClosureRuntime for HeaderRuntime {
    fn acquire<'a>(&self, closure: ClosureRef<'a>) -> ClosureRef<'a> {
        unsafe { (closure.header().ops.retain)(closure.as_ptr()) };
        closure
    }

    unsafe fn release(&self, closure: ClosureRef<'_>) {
        let release = closure.header().ops.release;
        unsafe { release(closure.as_ptr()) }
    }
}

// ============================================================================
// Reference-counted closures
// ============================================================================

#[repr(C)]
struct ClosureBox<T> {
    header: ClosureHeader,
    refs: AtomicUsize,
    state: T,
}

/// An owned reference to a reference-counted heap closure carrying `T`.
///
/// Cloning retains, dropping releases. The invoke function reaches the
/// captured state through [`Closure::state_from_raw`].
///
/// # Example
///
/// ```rust,ignore
/// unsafe extern "C" fn add(closure: *const ClosureHeader, _recv: *mut c_void, x: i64) -> i64 {
///     let base = unsafe { Closure::<i64>::state_from_raw(closure) };
///     base + x
/// }
///
/// let closure = Closure::new(add as *const c_void, 40i64);
/// ```
pub struct Closure<T: Send + Sync + 'static> {
    ptr: NonNull<ClosureBox<T>>,
    _marker: PhantomData<ClosureBox<T>>,
}

impl<T: Send + Sync + 'static> Closure<T> {
    /// Create a closure with no flags.
    pub fn new(invoke: *const c_void, state: T) -> Self {
        Self::with_flags(invoke, ClosureFlags::NONE, state)
    }

    /// Create a closure with explicit flags.
    pub fn with_flags(invoke: *const c_void, flags: ClosureFlags, state: T) -> Self {
        let boxed = Box::new(ClosureBox {
            header: ClosureHeader {
                invoke,
                flags,
                ops: &ClosureOps {
                    retain: retain_box::<T>,
                    release: release_box::<T>,
                },
            },
            refs: AtomicUsize::new(1),
            state,
        });
        Self {
            ptr: unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) },
            _marker: PhantomData,
        }
    }

    /// Take a new owned reference to a closure created by `Closure<T>`.
    ///
    /// # Safety
    ///
    /// `closure` must have been created by `Closure::<T>` with the same `T`.
    pub unsafe fn retain_from(closure: ClosureRef<'_>) -> Self {
        unsafe { retain_box::<T>(closure.as_ptr()) };
        Self {
            ptr: closure.ptr.cast(),
            _marker: PhantomData,
        }
    }

    /// Borrow as a [`ClosureRef`].
    ///
    /// The returned value cannot outlive this `Closure`:
    ///
    /// ```compile_fail
    /// use std::ffi::c_void;
    /// use thunkgate_runtime::{Closure, ClosureRef};
    ///
    /// unsafe extern "C" fn noop() {}
    ///
    /// fn dangling() -> ClosureRef<'static> {
    ///     Closure::new(noop as *const c_void, [0u64; 8]).as_closure_ref()
    /// }
    /// ```
    #[inline]
    pub fn as_closure_ref(&self) -> ClosureRef<'_> {
        ClosureRef::from_non_null(self.ptr.cast())
    }

    /// The raw closure pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ClosureHeader {
        self.ptr.as_ptr() as *mut ClosureHeader
    }

    /// The captured state.
    #[inline]
    pub fn state(&self) -> &T {
        unsafe { &self.ptr.as_ref().state }
    }

    /// The closure's flags.
    #[inline]
    pub fn flags(&self) -> ClosureFlags {
        unsafe { self.ptr.as_ref().header.flags }
    }

    /// Current number of owned references.
    pub fn ref_count(&self) -> usize {
        unsafe { self.ptr.as_ref().refs.load(Ordering::Acquire) }
    }

    /// Reach the captured state from inside an invoke function.
    ///
    /// # Safety
    ///
    /// `closure` must point to a live closure created by `Closure::<T>`,
    /// and the returned borrow must not outlive it.
    #[inline]
    pub unsafe fn state_from_raw<'a>(closure: *const ClosureHeader) -> &'a T {
        unsafe { &(*(closure as *const ClosureBox<T>)).state }
    }
}

impl<T: Send + Sync + 'static> Clone for Closure<T> {
    fn clone(&self) -> Self {
        unsafe { retain_box::<T>(self.as_ptr()) };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Closure<T> {
    fn drop(&mut self) {
        unsafe { release_box::<T>(self.as_ptr()) }
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Closure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("ptr", &self.ptr)
            .field("flags", &self.flags())
            .field("refs", &self.ref_count())
            .field("state", self.state())
            .finish()
    }
}

unsafe impl<T: Send + Sync + 'static> Send for Closure<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Closure<T> {}

unsafe extern "C" fn retain_box<T>(header: *mut ClosureHeader) {
    let boxed = header as *const ClosureBox<T>;
    unsafe { (*boxed).refs.fetch_add(1, Ordering::Relaxed) };
}

unsafe extern "C" fn release_box<T>(header: *mut ClosureHeader) {
    let boxed = header as *mut ClosureBox<T>;
    if unsafe { (*boxed).refs.fetch_sub(1, Ordering::Release) } != 1 {
        return;
    }
    atomic::fence(Ordering::Acquire);
    drop(unsafe { Box::from_raw(boxed) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    unsafe extern "C" fn noop_invoke() {}

    fn invoke_ptr() -> *const c_void {
        noop_invoke as *const c_void
    }

    #[test]
    fn test_flags() {
        let flags = ClosureFlags::NONE.union(ClosureFlags::STRUCT_RETURN);
        assert!(flags.contains(ClosureFlags::STRUCT_RETURN));
        assert!(!ClosureFlags::NONE.contains(ClosureFlags::STRUCT_RETURN));
        assert_eq!(ClosureFlags::from_bits(1), ClosureFlags::STRUCT_RETURN);
        assert_eq!(ClosureFlags::STRUCT_RETURN.bits(), 1);
    }

    #[test]
    fn test_invoke_is_first_word() {
        let closure = Closure::new(invoke_ptr(), 7u32);
        let first_word = unsafe { *(closure.as_ptr() as *const *const c_void) };
        assert_eq!(first_word, invoke_ptr());
        assert_eq!(closure.as_closure_ref().invoke_entry(), invoke_ptr());
    }

    #[test]
    fn test_clone_and_drop_track_refs() {
        let closure = Closure::new(invoke_ptr(), String::from("captured"));
        assert_eq!(closure.ref_count(), 1);
        let second = closure.clone();
        assert_eq!(closure.ref_count(), 2);
        drop(second);
        assert_eq!(closure.ref_count(), 1);
        assert_eq!(closure.state(), "captured");
    }

    #[test]
    fn test_last_release_drops_state() {
        let marker = Arc::new(());
        let closure = Closure::new(invoke_ptr(), marker.clone());
        assert_eq!(Arc::strong_count(&marker), 2);
        drop(closure);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_header_runtime_acquire_release() {
        let closure = Closure::new(invoke_ptr(), 1u8);
        let runtime = HeaderRuntime;

        let owned = runtime.acquire(closure.as_closure_ref());
        assert_eq!(owned, closure.as_closure_ref());
        assert_eq!(closure.ref_count(), 2);

        unsafe { runtime.release(owned) };
        assert_eq!(closure.ref_count(), 1);
    }

    #[test]
    fn test_struct_return_flag_visible_through_ref() {
        let plain = Closure::new(invoke_ptr(), ());
        let sret = Closure::with_flags(invoke_ptr(), ClosureFlags::STRUCT_RETURN, ());
        assert!(!HeaderRuntime.uses_struct_return(plain.as_closure_ref()));
        assert!(HeaderRuntime.uses_struct_return(sret.as_closure_ref()));
        assert_eq!(sret.flags(), ClosureFlags::STRUCT_RETURN);
    }

    #[test]
    fn test_state_from_raw_and_retain_from() {
        let closure = Closure::new(invoke_ptr(), 99u64);
        let state = unsafe { Closure::<u64>::state_from_raw(closure.as_ptr()) };
        assert_eq!(*state, 99);

        let again = unsafe { Closure::<u64>::retain_from(closure.as_closure_ref()) };
        assert_eq!(closure.ref_count(), 2);
        assert_eq!(*again.state(), 99);
    }

    #[test]
    fn test_from_raw_null() {
        assert!(unsafe { ClosureRef::from_raw(std::ptr::null_mut()) }.is_none());
    }
}
