//! Software scale model of the MMU for testing and development.
//!
//! This backend runs on any host and models the hardware the kernel really
//! targets at a fraction of the size:
//! - 256-byte pages (vs 4 KiB on the real MMU)
//! - a 512 KiB user window (vs 2 GiB)
//! - 16 translation-cache slots (vs 64)
//!
//! The shrunken constants keep emulated physical memory small enough that
//! every test can own a full RAM image, while the behavior (untagged cache
//! entries, random-slot replacement, interrupt discipline) matches the real
//! part.
// cSpell:ignore vpage

use crate::{FrameNumber, PageNumber};

/// Number of bits in a page offset.
pub const PAGE_BITS: usize = 8;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Top of the user address space. Also the base of the kernel's direct-map
/// window and the initial user stack pointer.
pub const USER_TOP: usize = 0x0008_0000;

/// Size of the kernel direct-map window, which is also the largest physical
/// memory this model supports.
pub const DIRECT_MAP_SIZE: usize = 0x0008_0000;

/// Number of slots in the translation cache.
pub const TLB_SLOTS: usize = 16;

/// Validates a physical address.
///
/// Addresses one past the end of the physical window are allowed so that
/// exclusive range ends can be represented.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= DIRECT_MAP_SIZE
}

/// Validates a virtual address: either inside the user window or inside the
/// kernel direct-map window directly above it.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= USER_TOP + DIRECT_MAP_SIZE
}

/// Emulated processor interrupt flag.
///
/// In test builds the flag is thread-local so parallel tests cannot observe
/// each other's interrupt windows.
#[cfg(not(any(test, feature = "software-emulation")))]
static INTERRUPTS_ENABLED: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(true);

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static INTERRUPTS_ENABLED: core::cell::Cell<bool> = core::cell::Cell::new(true);
}

/// Returns whether (emulated) interrupts are currently enabled.
pub fn interrupts_enabled() -> bool {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        INTERRUPTS_ENABLED.load(core::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        INTERRUPTS_ENABLED.with(|flag| flag.get())
    }
}

fn set_interrupts_enabled(enabled: bool) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        INTERRUPTS_ENABLED.store(enabled, core::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        INTERRUPTS_ENABLED.with(|flag| flag.set(enabled));
    }
}

/// Runs `f` with interrupts disabled, restoring the previous state afterward.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = interrupts_enabled();
    set_interrupts_enabled(false);
    let result = f();
    set_interrupts_enabled(was_enabled);
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

/// Emulated hardware translation cache.
///
/// Models the primitive pair the real MMU offers: write one mapping into a
/// slot the hardware picks, and invalidate every slot. The replacement
/// "random" register is modeled as a rotating index, which keeps tests
/// deterministic.
pub struct TranslationCache {
    slots: spin::Mutex<Slots>,
}

struct Slots {
    entries: [Option<TlbEntry>; TLB_SLOTS],
    hand: usize,
}

impl TranslationCache {
    pub const fn new() -> Self {
        Self {
            slots: spin::Mutex::new(Slots {
                entries: [None; TLB_SLOTS],
                hand: 0,
            }),
        }
    }

    /// Writes a mapping into the slot the hardware picks.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if interrupts are enabled (the write window
    /// must be non-interruptible) or if the page already has a live entry
    /// (duplicate entries are a machine check on the real MMU).
    pub fn write_random(&self, entry: TlbEntry) {
        debug_assert!(
            !interrupts_enabled(),
            "translation cache written with interrupts enabled"
        );
        let mut slots = self.slots.lock();
        debug_assert!(
            !slots.entries.iter().flatten().any(|e| e.vpage == entry.vpage),
            "duplicate translation cache entry for page {}",
            entry.vpage
        );
        let hand = slots.hand;
        slots.entries[hand] = Some(entry);
        slots.hand = (hand + 1) % TLB_SLOTS;
    }

    /// Invalidates every slot.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if interrupts are enabled.
    pub fn invalidate_all(&self) {
        debug_assert!(
            !interrupts_enabled(),
            "translation cache flushed with interrupts enabled"
        );
        let mut slots = self.slots.lock();
        slots.entries = [None; TLB_SLOTS];
        slots.hand = 0;
    }

    /// Returns the live entry for a page, if cached.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn probe(&self, vpage: PageNumber) -> Option<TlbEntry> {
        self.slots
            .lock()
            .entries
            .iter()
            .flatten()
            .find(|e| e.vpage == vpage)
            .copied()
    }

    /// Number of live entries.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn occupied(&self) -> usize {
        self.slots.lock().entries.iter().flatten().count()
    }
}

/// Emulated physical memory.
///
/// Backs the whole physical address space with a host buffer so frame
/// contents (zero fill, page copies) are observable from tests without any
/// hardware access.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedMemory {
    memory: Vec<u8>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        assert!(
            size <= DIRECT_MAP_SIZE,
            "emulated memory exceeds the physical window"
        );
        Self {
            memory: vec![0u8; size],
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.memory.len(), "physical address out of bounds");
        unsafe { self.memory.as_ptr().add(phys) as *mut u8 }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr()) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.memory.len(),
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod interrupts {
        use super::*;

        #[test]
        fn enabled_by_default() {
            assert!(interrupts_enabled());
        }

        #[test]
        fn disabled_inside_window() {
            without_interrupts(|| {
                assert!(!interrupts_enabled());
            });
            assert!(interrupts_enabled());
        }

        #[test]
        fn nested_windows_restore_outer_state() {
            without_interrupts(|| {
                without_interrupts(|| {
                    assert!(!interrupts_enabled());
                });
                // Still inside the outer window.
                assert!(!interrupts_enabled());
            });
            assert!(interrupts_enabled());
        }
    }

    mod translation_cache {
        use super::*;

        fn entry(page: usize, frame: usize) -> TlbEntry {
            TlbEntry {
                vpage: PageNumber::new(page),
                frame: FrameNumber::new(frame),
                writable: true,
            }
        }

        #[test]
        fn caches_written_entries() {
            let cache = TranslationCache::new();
            without_interrupts(|| cache.write_random(entry(3, 7)));

            let hit = cache.probe(PageNumber::new(3)).unwrap();
            assert_eq!(hit.frame, FrameNumber::new(7));
            assert!(hit.writable);
            assert_eq!(cache.occupied(), 1);
        }

        #[test]
        fn misses_unwritten_pages() {
            let cache = TranslationCache::new();
            assert!(cache.probe(PageNumber::new(3)).is_none());
        }

        #[test]
        fn rotation_evicts_the_oldest_entry() {
            let cache = TranslationCache::new();
            without_interrupts(|| {
                for page in 0..TLB_SLOTS + 1 {
                    cache.write_random(entry(page, page));
                }
            });

            assert!(cache.probe(PageNumber::new(0)).is_none());
            assert!(cache.probe(PageNumber::new(TLB_SLOTS)).is_some());
            assert_eq!(cache.occupied(), TLB_SLOTS);
        }

        #[test]
        fn invalidate_clears_every_slot() {
            let cache = TranslationCache::new();
            without_interrupts(|| {
                cache.write_random(entry(1, 1));
                cache.write_random(entry(2, 2));
                cache.invalidate_all();
            });
            assert_eq!(cache.occupied(), 0);
        }

        #[test]
        #[should_panic(expected = "interrupts enabled")]
        fn write_requires_interrupts_disabled() {
            let cache = TranslationCache::new();
            cache.write_random(entry(1, 1));
        }

        #[test]
        #[should_panic(expected = "duplicate translation cache entry")]
        fn duplicate_page_is_a_machine_check() {
            let cache = TranslationCache::new();
            without_interrupts(|| {
                cache.write_random(entry(1, 1));
                cache.write_random(entry(1, 2));
            });
        }
    }

    mod emulated_memory {
        use super::*;

        #[test]
        fn translates_and_inverts() {
            let mem = EmulatedMemory::new(4 * PAGE_SIZE);
            let ptr = mem.translate(PAGE_SIZE + 4);
            assert_eq!(mem.ptr_to_phys(ptr), PAGE_SIZE + 4);
        }

        #[test]
        fn starts_zeroed() {
            let mem = EmulatedMemory::new(PAGE_SIZE);
            for offset in 0..PAGE_SIZE {
                assert_eq!(unsafe { *mem.translate(offset) }, 0);
            }
        }

        #[test]
        #[should_panic(expected = "out of bounds")]
        fn rejects_addresses_beyond_the_buffer() {
            let mem = EmulatedMemory::new(PAGE_SIZE);
            mem.translate(PAGE_SIZE);
        }
    }
}
