//! MIPS r3000-style MMU constants and bindings to the kernel's low-level
//! primitives.
//!
//! The cache-control and interrupt functions live in the kernel's assembly
//! and trap code; this module only encodes entries and owns the bit layout.
// cSpell:ignore entryhi entrylo vpage kseg

use crate::{FrameNumber, PageNumber};

/// Number of bits in a page offset.
pub const PAGE_BITS: usize = 12;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Top of the user address space. Also the base of the kseg direct-map
/// window and the initial user stack pointer.
pub const USER_TOP: usize = 0x8000_0000;

/// Size of the kseg direct-map window, which bounds usable physical memory.
pub const DIRECT_MAP_SIZE: usize = 0x2000_0000;

/// Number of slots in the translation cache.
pub const TLB_SLOTS: usize = 64;

/// Validates a physical address.
///
/// Addresses one past the end of the physical window are allowed so that
/// exclusive range ends can be represented.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= DIRECT_MAP_SIZE
}

/// Validates a virtual address: either inside the user window or inside the
/// kseg direct-map window directly above it.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= USER_TOP + DIRECT_MAP_SIZE
}

/// Valid bit in the low word of a cache entry.
const ENTRY_VALID: u32 = 1 << 9;

/// Write-permission ("dirty") bit in the low word of a cache entry.
const ENTRY_WRITABLE: u32 = 1 << 10;

unsafe extern "C" {
    /// Writes one mapping into a hardware-chosen slot. Interrupts must be
    /// disabled.
    fn mmu_write_random(entryhi: u32, entrylo: u32);

    /// Writes one mapping into an explicit slot. Interrupts must be disabled.
    fn mmu_write_indexed(slot: u32, entryhi: u32, entrylo: u32);

    /// Raises the processor interrupt level, returning the previous level.
    fn interrupts_raise() -> u32;

    /// Restores a previously saved interrupt level.
    fn interrupts_restore(level: u32);
}

/// Runs `f` with interrupts disabled, restoring the previous level afterward.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    // SAFETY: raise and restore are called as a bracketed pair with no early
    // exit between them.
    let level = unsafe { interrupts_raise() };
    let result = f();
    unsafe { interrupts_restore(level) };
    result
}

/// One translation-cache mapping: a virtual page, the frame backing it, and
/// the write-permission bit.
///
/// Entries carry no address-space tag, so the cache must be flushed whenever
/// the active address space changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpage: PageNumber,
    pub frame: FrameNumber,
    pub writable: bool,
}

/// The hardware translation cache.
///
/// Zero-sized handle over the real MMU registers; all state lives in the
/// hardware.
pub struct TranslationCache(());

impl TranslationCache {
    pub const fn new() -> Self {
        Self(())
    }

    /// Writes a mapping into the slot the hardware picks.
    pub fn write_random(&self, entry: TlbEntry) {
        let entryhi = (entry.vpage.as_usize() << PAGE_BITS) as u32;
        let mut entrylo = ((entry.frame.as_usize() << PAGE_BITS) as u32) | ENTRY_VALID;
        if entry.writable {
            entrylo |= ENTRY_WRITABLE;
        }
        // SAFETY: callers hold an interrupts-disabled window around every
        // cache write.
        unsafe { mmu_write_random(entryhi, entrylo) };
    }

    /// Invalidates every slot.
    pub fn invalidate_all(&self) {
        for slot in 0..TLB_SLOTS {
            // Park each slot on a distinct kseg page with the valid bit
            // clear, so no two slots ever hold the same virtual page.
            let entryhi = ((USER_TOP + slot * PAGE_SIZE) as u32) & !((PAGE_SIZE - 1) as u32);
            // SAFETY: same window requirement as write_random.
            unsafe { mmu_write_indexed(slot as u32, entryhi, 0) };
        }
    }
}
