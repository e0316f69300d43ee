//! Interrupt-safe wrapper around the hardware translation cache.
//!
//! The hardware offers exactly two operations, both of which must run with
//! interrupts disabled so a nested trap cannot interleave with a half-written
//! slot. This adapter owns that discipline; nothing else in the crate touches
//! the raw cache.

use crate::{FrameNumber, PageNumber, arch};

/// Handle to the processor's translation cache.
///
/// The cache is pure re-creatable state: everything in it can be rebuilt from
/// the page table by faulting, so flushing it wholesale is always correct.
pub struct Tlb {
    cache: arch::TranslationCache,
}

impl Tlb {
    pub(crate) const fn new() -> Self {
        Self {
            cache: arch::TranslationCache::new(),
        }
    }

    /// Publishes one mapping to the hardware.
    pub fn install(&self, vpage: PageNumber, frame: FrameNumber, writable: bool) {
        let entry = arch::TlbEntry {
            vpage,
            frame,
            writable,
        };
        arch::without_interrupts(|| self.cache.write_random(entry));
    }

    /// Invalidates every cached mapping.
    ///
    /// Entries carry no address-space tag, so this must happen on every
    /// address-space switch; a stale entry would hand one process another's
    /// memory.
    pub fn flush_all(&self) {
        arch::without_interrupts(|| self.cache.invalidate_all());
    }

    /// Cross-processor invalidation request. This kernel runs on a single
    /// core; receiving one means the configuration is broken.
    pub fn shootdown(&self) -> ! {
        panic!("translation-cache shootdown on a single-core kernel");
    }

    /// Returns the cached entry for a page, if present.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn probe(&self, vpage: PageNumber) -> Option<arch::TlbEntry> {
        self.cache.probe(vpage)
    }

    /// Number of live cache entries.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn occupied(&self) -> usize {
        self.cache.occupied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_inside_an_interrupt_window() {
        let tlb = Tlb::new();
        tlb.install(PageNumber::new(4), FrameNumber::new(9), true);

        // The write happened and the window closed behind it.
        let entry = tlb.probe(PageNumber::new(4)).unwrap();
        assert_eq!(entry.frame, FrameNumber::new(9));
        assert!(entry.writable);
        assert!(arch::interrupts_enabled());
    }

    #[test]
    fn flush_empties_the_cache() {
        let tlb = Tlb::new();
        tlb.install(PageNumber::new(1), FrameNumber::new(1), false);
        tlb.install(PageNumber::new(2), FrameNumber::new(2), true);

        tlb.flush_all();
        assert_eq!(tlb.occupied(), 0);
        assert!(arch::interrupts_enabled());
    }

    #[test]
    fn old_entries_rotate_out_under_pressure() {
        let tlb = Tlb::new();
        for page in 0..arch::TLB_SLOTS + 2 {
            tlb.install(PageNumber::new(page), FrameNumber::new(page), true);
        }

        assert_eq!(tlb.occupied(), arch::TLB_SLOTS);
        assert!(tlb.probe(PageNumber::new(0)).is_none());
        assert!(tlb.probe(PageNumber::new(arch::TLB_SLOTS + 1)).is_some());
    }

    #[test]
    #[should_panic(expected = "single-core")]
    fn shootdown_is_a_configuration_bug() {
        let tlb = Tlb::new();
        tlb.shootdown();
    }
}
