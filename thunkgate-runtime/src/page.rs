//! # Trampoline Pages
//!
//! Maps trampoline pages and carves them into slots.
//!
//! A page is a two-page mapping: a read-write data page holding one
//! [`ConfigRecord`] per slot, followed by a code page holding the shared
//! dispatcher and one stub per slot (see [`crate::stub`] for the layout).
//! The code page is stamped once and then sealed read+execute; only the
//! data page is written afterwards.
//!
//! Pages are never unmapped. A handle may be stored anywhere by the
//! embedding program, so the memory behind it is retained for the life of
//! the process and only slots are recycled.

use std::fmt;
use std::ptr::{self, NonNull};

use crate::closure::ClosureHeader;
use crate::config::ConfigError;
use crate::platform::MappedRegion;
use crate::stub::{Abi, CallingConvention, DISPATCHER_STRIDES, SLOT_STRIDE};

// ============================================================================
// Errors
// ============================================================================

/// Trampoline allocation error.
#[derive(Debug, Clone)]
pub struct TrampolineError {
    /// Error kind.
    pub kind: TrampolineErrorKind,
    /// Error message.
    pub message: String,
}

impl TrampolineError {
    /// Create a new trampoline error.
    pub fn new(kind: TrampolineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the error means no executable memory could be obtained.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self.kind,
            TrampolineErrorKind::AllocationFailed | TrampolineErrorKind::ProtectionFailed
        )
    }
}

impl fmt::Display for TrampolineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TrampolineError {}

/// Trampoline error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineErrorKind {
    /// The platform refused to map memory for a new page.
    AllocationFailed,
    /// A freshly stamped code page could not be made executable.
    ProtectionFailed,
    /// No stub templates exist for the host ABI.
    UnsupportedAbi,
    /// The registry configuration was rejected before any page was mapped.
    InvalidConfig,
}

impl From<ConfigError> for TrampolineError {
    fn from(err: ConfigError) -> Self {
        Self::new(TrampolineErrorKind::InvalidConfig, err.to_string())
    }
}

/// Type alias for trampoline results.
pub type TrampolineResult<T> = Result<T, TrampolineError>;

// ============================================================================
// Config records and slots
// ============================================================================

/// Per-slot data read by the dispatcher.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Owned closure reference; the dispatcher loads this word.
    pub closure: *mut ClosureHeader,
    /// Identity of the slot, for O(1) release.
    pub slot: usize,
}

impl ConfigRecord {
    /// A cleared record.
    pub const EMPTY: Self = Self {
        closure: ptr::null_mut(),
        slot: 0,
    };
}

const _: () = assert!(std::mem::size_of::<ConfigRecord>() <= SLOT_STRIDE);

/// One trampoline slot, identified by its stub's entry address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrampolineSlot {
    entry: NonNull<u8>,
}

impl TrampolineSlot {
    /// Rebuild a slot from its identity value.
    ///
    /// # Safety
    ///
    /// `identity` must come from [`TrampolineSlot::identity`] of a slot whose
    /// page is still mapped (pages are never unmapped).
    pub unsafe fn from_identity(identity: usize) -> Option<Self> {
        NonNull::new(identity as *mut u8).map(|entry| Self { entry })
    }

    pub(crate) fn from_entry(entry: NonNull<u8>) -> Self {
        Self { entry }
    }

    /// Entry address of the stub; this is the callable handle.
    #[inline]
    pub fn entry(self) -> NonNull<u8> {
        self.entry
    }

    /// Pointer-sized identity stored in the config record.
    #[inline]
    pub fn identity(self) -> usize {
        self.entry.as_ptr() as usize
    }

    /// Config record of this slot, one page below the entry.
    #[inline]
    fn config(self, page_size: usize) -> *mut ConfigRecord {
        // The data page precedes the code page inside the same mapping.
        self.entry.as_ptr().wrapping_sub(page_size) as *mut ConfigRecord
    }

    /// Read this slot's config record.
    ///
    /// # Safety
    ///
    /// The slot must belong to a page mapped with `page_size`.
    #[inline]
    pub unsafe fn read_config(self, page_size: usize) -> ConfigRecord {
        unsafe { self.config(page_size).read() }
    }

    /// Overwrite this slot's config record.
    ///
    /// # Safety
    ///
    /// As [`TrampolineSlot::read_config`]. The caller must also hold the
    /// slot exclusively, between allocation and free.
    #[inline]
    pub unsafe fn write_config(self, page_size: usize, record: ConfigRecord) {
        unsafe { self.config(page_size).write(record) }
    }
}

impl fmt::Debug for TrampolineSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrampolineSlot({:p})", self.entry)
    }
}

// Slots are addresses into retained mappings; ownership of a slot is
// arbitrated by the table's lock.
unsafe impl Send for TrampolineSlot {}
unsafe impl Sync for TrampolineSlot {}

// ============================================================================
// Pages
// ============================================================================

/// A mapped, stamped and sealed trampoline page.
pub struct TrampolinePage {
    region: MappedRegion,
    page_size: usize,
    convention: CallingConvention,
}

impl TrampolinePage {
    /// Number of usable slots in a page of `page_size` bytes.
    pub const fn slots_per_page(page_size: usize) -> usize {
        page_size / SLOT_STRIDE - DISPATCHER_STRIDES
    }

    /// Map a new page and stamp it for `abi` and `convention`.
    pub fn map(abi: Abi, convention: CallingConvention, page_size: usize) -> TrampolineResult<Self> {
        let region = MappedRegion::map_rw(2 * page_size).ok_or_else(|| {
            TrampolineError::new(
                TrampolineErrorKind::AllocationFailed,
                format!("failed to map {} bytes for a trampoline page", 2 * page_size),
            )
        })?;
        debug_assert_eq!(region.len(), 2 * page_size);

        let page = Self {
            region,
            page_size,
            convention,
        };
        unsafe { page.stamp(abi) };

        if !unsafe { page.region.seal_executable(page_size, page_size) } {
            // The region is leaked like every other page.
            return Err(TrampolineError::new(
                TrampolineErrorKind::ProtectionFailed,
                "failed to make trampoline code executable",
            ));
        }

        log::debug!(
            "mapped {} trampoline page at {:p} ({} slots)",
            convention,
            page.code_base(),
            Self::slots_per_page(page_size)
        );
        Ok(page)
    }

    /// Write the dispatcher and every stub into the (still writable) code page.
    unsafe fn stamp(&self, abi: Abi) {
        let code = self.code_base();
        let dispatcher = abi.dispatcher(self.convention);
        unsafe { ptr::copy_nonoverlapping(dispatcher.as_ptr(), code, SLOT_STRIDE) };

        for index in DISPATCHER_STRIDES..self.page_size / SLOT_STRIDE {
            let stub = abi.trampoline(index, self.page_size);
            unsafe {
                ptr::copy_nonoverlapping(stub.as_ptr(), code.add(index * SLOT_STRIDE), SLOT_STRIDE)
            };
        }
    }

    #[inline]
    fn code_base(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.page_size) }
    }

    /// Address of the shared dispatcher.
    #[inline]
    pub fn dispatcher_entry(&self) -> *const u8 {
        self.code_base()
    }

    /// All slots of the page in ascending address order.
    pub fn slots(&self) -> impl DoubleEndedIterator<Item = TrampolineSlot> + '_ {
        let code = self.code_base();
        (DISPATCHER_STRIDES..self.page_size / SLOT_STRIDE).map(move |index| TrampolineSlot {
            entry: unsafe { NonNull::new_unchecked(code.add(index * SLOT_STRIDE)) },
        })
    }

    /// Whether `slot` is one of this page's slots.
    pub fn contains(&self, slot: TrampolineSlot) -> bool {
        let addr = slot.identity();
        let first = self.code_base() as usize + DISPATCHER_STRIDES * SLOT_STRIDE;
        self.region.contains(addr) && addr >= first && (addr - first) % SLOT_STRIDE == 0
    }
}

impl fmt::Debug for TrampolinePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolinePage")
            .field("code", &self.code_base())
            .field("page_size", &self.page_size)
            .field("convention", &self.convention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;

    fn host_page(convention: CallingConvention) -> TrampolinePage {
        let abi = Abi::host().expect("unsupported host");
        TrampolinePage::map(abi, convention, platform::page_size()).expect("map failed")
    }

    #[test]
    fn test_slots_per_page() {
        assert_eq!(TrampolinePage::slots_per_page(4096), 255);
        assert_eq!(TrampolinePage::slots_per_page(16384), 1023);
    }

    #[test]
    fn test_page_slot_count_and_order() {
        let page = host_page(CallingConvention::Standard);
        let slots: Vec<_> = page.slots().collect();
        assert_eq!(slots.len(), TrampolinePage::slots_per_page(platform::page_size()));
        assert!(slots.windows(2).all(|w| w[1].identity() - w[0].identity() == SLOT_STRIDE));
        assert!(slots.iter().all(|s| page.contains(*s)));
        assert_eq!(
            slots[0].identity(),
            page.dispatcher_entry() as usize + DISPATCHER_STRIDES * SLOT_STRIDE
        );
    }

    #[test]
    fn test_page_stamped_with_templates() {
        let abi = Abi::host().expect("unsupported host");
        let page_size = platform::page_size();
        let page = host_page(CallingConvention::Standard);

        let dispatcher =
            unsafe { std::slice::from_raw_parts(page.dispatcher_entry(), SLOT_STRIDE) };
        assert_eq!(dispatcher, &abi.dispatcher(CallingConvention::Standard));

        let slot = page.slots().nth(4).unwrap();
        let stub = unsafe { std::slice::from_raw_parts(slot.entry().as_ptr(), SLOT_STRIDE) };
        assert_eq!(stub, &abi.trampoline(DISPATCHER_STRIDES + 4, page_size));
    }

    #[test]
    fn test_config_record_is_writable() {
        let page = host_page(CallingConvention::Standard);
        let page_size = platform::page_size();
        for slot in page.slots().take(3) {
            let record = ConfigRecord {
                closure: ptr::null_mut(),
                slot: slot.identity(),
            };
            unsafe {
                slot.write_config(page_size, record);
                assert_eq!(slot.read_config(page_size), record);
                slot.write_config(page_size, ConfigRecord::EMPTY);
                assert_eq!(slot.read_config(page_size), ConfigRecord::EMPTY);
            }
            assert_eq!(slot.entry().as_ptr() as usize - page_size, slot.config(page_size) as usize);
        }
    }

    #[test]
    fn test_contains_rejects_foreign_slots() {
        let a = host_page(CallingConvention::Standard);
        let b = host_page(CallingConvention::Standard);
        let slot = b.slots().next().unwrap();
        assert!(!a.contains(slot));
        let dispatcher = unsafe { TrampolineSlot::from_identity(a.dispatcher_entry() as usize) };
        assert!(!a.contains(dispatcher.unwrap()));

        // Inside the mapping, but on the data page.
        let data = a.dispatcher_entry() as usize - platform::page_size() + SLOT_STRIDE;
        let data_slot = unsafe { TrampolineSlot::from_identity(data) };
        assert!(!a.contains(data_slot.unwrap()));
    }

    #[test]
    fn test_slot_identity_roundtrip() {
        let page = host_page(CallingConvention::Standard);
        let slot = page.slots().last().unwrap();
        let back = unsafe { TrampolineSlot::from_identity(slot.identity()) };
        assert_eq!(back, Some(slot));
        assert!(unsafe { TrampolineSlot::from_identity(0) }.is_none());
    }

    #[test]
    fn test_error_display() {
        let err = TrampolineError::new(TrampolineErrorKind::AllocationFailed, "no memory");
        assert!(err.is_allocation_failure());
        assert!(err.to_string().contains("no memory"));
        let err = TrampolineError::new(TrampolineErrorKind::UnsupportedAbi, "riscv");
        assert!(!err.is_allocation_failure());

        let err = TrampolineError::from(ConfigError::InvalidValue {
            field: "preallocate_pages".into(),
            message: "too many".into(),
        });
        assert_eq!(err.kind, TrampolineErrorKind::InvalidConfig);
        assert!(err.message.contains("preallocate_pages"));
    }
}
