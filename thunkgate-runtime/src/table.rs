//! # Trampoline Tables
//!
//! One table per calling-convention variant. A table owns its pages and a
//! free list of slots, both behind a single `parking_lot::Mutex`. The lock is
//! held only across a free-list pop or push, or while a new page is mapped.
//!
//! [`TrampolineTables`] bundles the variants the host ABI needs. The
//! struct-return table exists only when [`Abi::has_struct_return_variant`]
//! says so; it is resolved once at construction.

use parking_lot::Mutex;

use crate::page::{TrampolineError, TrampolineErrorKind, TrampolinePage, TrampolineResult, TrampolineSlot};
use crate::platform;
use crate::stub::{Abi, CallingConvention};

/// Snapshot of a table's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Pages mapped so far.
    pub pages: usize,
    /// Total slots across all pages.
    pub capacity: usize,
    /// Slots on the free list.
    pub free: usize,
    /// Slots handed out and not yet freed.
    pub in_use: usize,
}

struct TableState {
    pages: Vec<TrampolinePage>,
    free: Vec<TrampolineSlot>,
    in_use: usize,
}

/// Allocator state for one calling-convention variant.
pub struct TrampolineTable {
    abi: Abi,
    convention: CallingConvention,
    page_size: usize,
    state: Mutex<TableState>,
}

impl TrampolineTable {
    /// Create an empty table. No memory is mapped until the first allocation.
    pub fn new(abi: Abi, convention: CallingConvention, page_size: usize) -> Self {
        Self {
            abi,
            convention,
            page_size,
            state: Mutex::new(TableState {
                pages: Vec::new(),
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }

    /// The variant this table serves.
    #[inline]
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    /// Take a slot, mapping a new page if the free list is empty.
    pub fn allocate(&self) -> TrampolineResult<TrampolineSlot> {
        let mut state = self.state.lock();
        if let Some(slot) = state.free.pop() {
            state.in_use += 1;
            return Ok(slot);
        }

        let page = self.map_page()?;
        let mut slots = page.slots();
        let Some(first) = slots.next() else {
            return Err(TrampolineError::new(
                TrampolineErrorKind::AllocationFailed,
                "trampoline page has no slots",
            ));
        };
        // Reversed so that pops hand out ascending addresses.
        state.free.extend(slots.rev());
        state.pages.push(page);
        state.in_use += 1;
        Ok(first)
    }

    /// Return a slot to the free list.
    ///
    /// The slot must have come from [`TrampolineTable::allocate`] on this
    /// table and must not be freed twice.
    pub fn free(&self, slot: TrampolineSlot) {
        let mut state = self.state.lock();
        debug_assert!(
            state.pages.iter().any(|page| page.contains(slot)),
            "slot {:?} does not belong to the {} table",
            slot,
            self.convention
        );
        state.in_use = state.in_use.saturating_sub(1);
        state.free.push(slot);
    }

    /// Map `count` pages up front and put all their slots on the free list.
    pub fn reserve_pages(&self, count: usize) -> TrampolineResult<()> {
        let mut state = self.state.lock();
        for _ in 0..count {
            let page = self.map_page()?;
            state.free.extend(page.slots().rev());
            state.pages.push(page);
        }
        Ok(())
    }

    /// Whether `slot` lies in one of this table's pages.
    pub fn owns(&self, slot: TrampolineSlot) -> bool {
        self.state.lock().pages.iter().any(|page| page.contains(slot))
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> TableStats {
        let state = self.state.lock();
        TableStats {
            pages: state.pages.len(),
            capacity: state.pages.len() * TrampolinePage::slots_per_page(self.page_size),
            free: state.free.len(),
            in_use: state.in_use,
        }
    }

    fn map_page(&self) -> TrampolineResult<TrampolinePage> {
        TrampolinePage::map(self.abi, self.convention, self.page_size).map_err(|err| {
            log::warn!("{} trampoline page allocation failed: {}", self.convention, err);
            err
        })
    }
}

impl std::fmt::Debug for TrampolineTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrampolineTable")
            .field("abi", &self.abi)
            .field("convention", &self.convention)
            .field("stats", &self.stats())
            .finish()
    }
}

/// The set of tables required by an ABI.
#[derive(Debug)]
pub struct TrampolineTables {
    abi: Abi,
    page_size: usize,
    standard: TrampolineTable,
    struct_return: Option<TrampolineTable>,
}

impl TrampolineTables {
    /// Build the tables for `abi` using the platform page size.
    pub fn new(abi: Abi) -> Self {
        Self::with_page_size(abi, platform::page_size())
    }

    pub(crate) fn with_page_size(abi: Abi, page_size: usize) -> Self {
        let struct_return = abi
            .has_struct_return_variant()
            .then(|| TrampolineTable::new(abi, CallingConvention::StructReturn, page_size));
        Self {
            abi,
            page_size,
            standard: TrampolineTable::new(abi, CallingConvention::Standard, page_size),
            struct_return,
        }
    }

    /// Build the tables for the host ABI.
    pub fn for_host() -> TrampolineResult<Self> {
        let abi = Abi::host().ok_or_else(|| {
            TrampolineError::new(
                TrampolineErrorKind::UnsupportedAbi,
                format!(
                    "no trampoline templates for {}-{}",
                    std::env::consts::ARCH,
                    std::env::consts::OS
                ),
            )
        })?;
        Ok(Self::new(abi))
    }

    /// ABI the tables were stamped for.
    #[inline]
    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// Page size used by every table.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Variant used for a closure with the given struct-return flag.
    #[inline]
    pub fn resolve(&self, wants_struct_return: bool) -> CallingConvention {
        if wants_struct_return && self.struct_return.is_some() {
            CallingConvention::StructReturn
        } else {
            CallingConvention::Standard
        }
    }

    /// Table used for a closure with the given struct-return flag.
    #[inline]
    pub fn select(&self, wants_struct_return: bool) -> &TrampolineTable {
        match (&self.struct_return, wants_struct_return) {
            (Some(table), true) => table,
            _ => &self.standard,
        }
    }

    /// Table for a variant, if the ABI has one.
    pub fn table(&self, convention: CallingConvention) -> Option<&TrampolineTable> {
        match convention {
            CallingConvention::Standard => Some(&self.standard),
            CallingConvention::StructReturn => self.struct_return.as_ref(),
        }
    }

    /// Pre-map `count` pages in every table.
    pub fn reserve_pages(&self, count: usize) -> TrampolineResult<()> {
        self.standard.reserve_pages(count)?;
        if let Some(table) = &self.struct_return {
            table.reserve_pages(count)?;
        }
        Ok(())
    }
}
