//! Global hashed page table.
//!
//! Every live user mapping in the system lives in one fixed-size arena of
//! entries keyed by (address space, virtual page). A key hashes to its
//! canonical slot; colliding keys chain through `next` links that are slot
//! indices into the same arena, so the structure contains no pointers at all.
//!
//! Two structural rules hold at every quiescent point:
//! - a chain's head sits at the slot its members hash to, and
//! - every member of a chain hashes to that same slot.
//!
//! Inserts and removals restructure slots to preserve both rules, which keeps
//! every lookup a single short walk from the canonical slot.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr;

use crate::{AddressTranslator, FrameNumber, FrameTable, PageNumber, SpaceId, VmError, arch};

/// A mapping snapshot returned by lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: FrameNumber,
    pub writable: bool,
}

/// One slot of the arena.
///
/// `next` chains colliding entries; `valid` distinguishes live entries from
/// vacant slots, whose other fields are meaningless.
#[derive(Debug, Clone, Copy)]
struct PageTableEntry {
    owner: SpaceId,
    vpage: PageNumber,
    frame: FrameNumber,
    writable: bool,
    valid: bool,
    next: Option<usize>,
}

impl PageTableEntry {
    const VACANT: Self = Self {
        owner: SpaceId::new(0),
        vpage: PageNumber::new(0),
        frame: FrameNumber::new(0),
        writable: false,
        valid: false,
        next: None,
    };
}

struct Table {
    entries: Box<[PageTableEntry]>,
    mapped: usize,
}

impl Table {
    /// Canonical slot for a key.
    fn slot_of(&self, owner: SpaceId, vpage: PageNumber) -> usize {
        (owner.as_usize() ^ vpage.as_usize()) % self.entries.len()
    }

    /// Walks the chain rooted at the key's canonical slot, returning the slot
    /// holding the key.
    fn find(&self, owner: SpaceId, vpage: PageNumber) -> Option<usize> {
        let canonical = self.slot_of(owner, vpage);
        let head = self.entries[canonical];
        if !head.valid || self.slot_of(head.owner, head.vpage) != canonical {
            // No chain is rooted here. A valid resident whose key hashes
            // elsewhere is a probed-in member of another chain and must not
            // be followed.
            return None;
        }

        let mut idx = canonical;
        let mut steps = 0;
        loop {
            let entry = self.entries[idx];
            debug_assert!(entry.valid, "page table chain links through a vacant slot");
            if entry.owner == owner && entry.vpage == vpage {
                return Some(idx);
            }
            idx = entry.next?;
            steps += 1;
            assert!(
                steps <= self.entries.len(),
                "page table chain does not terminate"
            );
        }
    }

    /// Finds a vacant slot by probing forward from `from`, wrapping at the
    /// end of the arena.
    fn probe_free(&self, from: usize) -> Result<usize, VmError> {
        let len = self.entries.len();
        for offset in 1..len {
            let idx = (from + offset) % len;
            if !self.entries[idx].valid {
                return Ok(idx);
            }
        }
        Err(VmError::OutOfMemory)
    }

    /// Last slot of the chain rooted at `head`.
    fn chain_tail(&self, head: usize) -> usize {
        let mut idx = head;
        let mut steps = 0;
        while let Some(next) = self.entries[idx].next {
            idx = next;
            steps += 1;
            assert!(
                steps <= self.entries.len(),
                "page table chain does not terminate"
            );
        }
        idx
    }

    /// Tail of a chain and the slot linking to it, starting from a head known
    /// to have a successor.
    fn tail_from(&self, head: usize, successor: usize) -> (usize, usize) {
        let mut pred = head;
        let mut idx = successor;
        let mut steps = 0;
        while let Some(next) = self.entries[idx].next {
            pred = idx;
            idx = next;
            steps += 1;
            assert!(
                steps <= self.entries.len(),
                "page table chain does not terminate"
            );
        }
        (pred, idx)
    }

    /// Slot whose `next` link points at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is unreachable from its key's canonical slot, which
    /// means the chain structure is corrupt.
    fn predecessor_of(&self, idx: usize) -> usize {
        let resident = self.entries[idx];
        let mut cur = self.slot_of(resident.owner, resident.vpage);
        let mut steps = 0;
        while self.entries[cur].next != Some(idx) {
            match self.entries[cur].next {
                Some(next) => cur = next,
                None => panic!("page table entry is unreachable from its canonical slot"),
            }
            steps += 1;
            assert!(
                steps <= self.entries.len(),
                "page table chain does not terminate"
            );
        }
        cur
    }
}

/// The system-wide page table.
///
/// Sized once at bootstrap (conventionally at twice the physical frame count,
/// so the arena can never fill before RAM does) and shared by every address
/// space.
pub struct HashedPageTable {
    inner: spin::Mutex<Table>,
}

impl HashedPageTable {
    /// Creates a table with `slots` entries.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero.
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "page table must have at least one slot");
        Self {
            inner: spin::Mutex::new(Table {
                entries: vec![PageTableEntry::VACANT; slots].into_boxed_slice(),
                mapped: 0,
            }),
        }
    }

    /// Number of slots in the arena.
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of live mappings.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().mapped
    }

    /// Materializes a page: claims a zero-filled frame and records the
    /// mapping.
    ///
    /// The vacant slot is probed for before the frame is claimed, so a full
    /// table fails without touching the frame allocator. Inserting a key that
    /// is already mapped is a caller bug.
    pub fn insert(
        &self,
        frames: &FrameTable,
        owner: SpaceId,
        vpage: PageNumber,
        writable: bool,
    ) -> Result<FrameNumber, VmError> {
        let mut table = self.inner.lock();
        debug_assert!(
            table.find(owner, vpage).is_none(),
            "mapping already present for space {owner} page {vpage}"
        );

        let canonical = table.slot_of(owner, vpage);
        if !table.entries[canonical].valid {
            let frame = allocate_zeroed(frames)?;
            table.entries[canonical] = PageTableEntry {
                owner,
                vpage,
                frame,
                writable,
                valid: true,
                next: None,
            };
            table.mapped += 1;
            return Ok(frame);
        }

        let spare = table.probe_free(canonical)?;
        let frame = allocate_zeroed(frames)?;
        let resident = table.entries[canonical];
        if table.slot_of(resident.owner, resident.vpage) == canonical {
            // The resident heads this slot's chain: append at the spare slot.
            table.entries[spare] = PageTableEntry {
                owner,
                vpage,
                frame,
                writable,
                valid: true,
                next: None,
            };
            let tail = table.chain_tail(canonical);
            table.entries[tail].next = Some(spare);
        } else {
            // A probed-in member of another chain squats on this key's
            // canonical slot. Move it to the spare slot, repair the link that
            // led to it, and root the new chain here.
            let pred = table.predecessor_of(canonical);
            table.entries[spare] = resident;
            table.entries[pred].next = Some(spare);
            table.entries[canonical] = PageTableEntry {
                owner,
                vpage,
                frame,
                writable,
                valid: true,
                next: None,
            };
        }
        table.mapped += 1;
        Ok(frame)
    }

    /// Looks up a mapping.
    pub fn lookup(&self, owner: SpaceId, vpage: PageNumber) -> Option<Mapping> {
        let table = self.inner.lock();
        table.find(owner, vpage).map(|idx| {
            let entry = table.entries[idx];
            Mapping {
                frame: entry.frame,
                writable: entry.writable,
            }
        })
    }

    /// Removes a mapping and returns its frame to the allocator.
    ///
    /// Removing a key that was never mapped is not an error; pages that were
    /// never touched have nothing to tear down. Returns whether a mapping was
    /// removed.
    pub fn remove(&self, frames: &FrameTable, owner: SpaceId, vpage: PageNumber) -> bool {
        let mut table = self.inner.lock();
        let Some(target) = table.find(owner, vpage) else {
            return false;
        };
        frames.deallocate(table.entries[target].frame);

        let canonical = table.slot_of(owner, vpage);
        if target != canonical {
            // Interior or tail member: splice its predecessor past it.
            let pred = table.predecessor_of(target);
            table.entries[pred].next = table.entries[target].next;
            table.entries[target] = PageTableEntry::VACANT;
        } else if let Some(successor) = table.entries[canonical].next {
            // The head is going away but the chain is not. Promote the tail
            // into the canonical slot so the chain stays rooted there.
            let (tail_pred, tail) = table.tail_from(canonical, successor);
            let promoted = table.entries[tail];
            table.entries[tail_pred].next = None;
            table.entries[tail] = PageTableEntry::VACANT;
            let head = &mut table.entries[canonical];
            head.owner = promoted.owner;
            head.vpage = promoted.vpage;
            head.frame = promoted.frame;
            head.writable = promoted.writable;
        } else {
            table.entries[canonical] = PageTableEntry::VACANT;
        }
        table.mapped -= 1;
        true
    }

    /// Clears the write-permission bit of a mapping. Returns whether the
    /// mapping existed.
    pub fn set_read_only(&self, owner: SpaceId, vpage: PageNumber) -> bool {
        let mut table = self.inner.lock();
        match table.find(owner, vpage) {
            Some(idx) => {
                table.entries[idx].writable = false;
                true
            }
            None => false,
        }
    }

    /// Number of live mappings owned by one address space.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn mapped_pages_for(&self, owner: SpaceId) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.valid && entry.owner == owner)
            .count()
    }

    /// Checks every structural rule of the arena, panicking on the first
    /// violation.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn verify_chains(&self) {
        let table = self.inner.lock();
        let len = table.entries.len();
        let mut visited = vec![false; len];
        let mut frames = Vec::new();

        for head in 0..len {
            let entry = table.entries[head];
            if !entry.valid || table.slot_of(entry.owner, entry.vpage) != head {
                continue;
            }
            let mut idx = head;
            let mut steps = 0;
            loop {
                let entry = table.entries[idx];
                assert!(entry.valid, "chain links through vacant slot {idx}");
                assert!(!visited[idx], "slot {idx} is reachable from two chains");
                assert_eq!(
                    table.slot_of(entry.owner, entry.vpage),
                    head,
                    "slot {idx} is chained to the wrong canonical slot"
                );
                visited[idx] = true;
                frames.push(entry.frame);
                match entry.next {
                    Some(next) => {
                        idx = next;
                        steps += 1;
                        assert!(steps <= len, "page table chain does not terminate");
                    }
                    None => break,
                }
            }
        }

        for idx in 0..len {
            let entry = table.entries[idx];
            if entry.valid {
                assert!(visited[idx], "slot {idx} is unreachable from any chain");
            } else {
                assert!(entry.next.is_none(), "vacant slot {idx} holds a chain link");
            }
        }

        frames.sort_unstable();
        assert!(
            frames.windows(2).all(|pair| pair[0] != pair[1]),
            "two mappings share a frame"
        );
        assert_eq!(frames.len(), table.mapped, "mapped-page counter out of sync");
    }
}

fn allocate_zeroed(frames: &FrameTable) -> Result<FrameNumber, VmError> {
    let frame = frames.allocate()?;
    let dst = AddressTranslator::current().phys_to_ptr(frame.start());
    // SAFETY: the frame just came off the free list, so nothing else
    // references it, and the direct map covers all of RAM.
    unsafe { ptr::write_bytes(dst, 0, arch::PAGE_SIZE) };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PhysicalAddress, RamInfo};

    const RAM_FRAMES: usize = 64;

    fn frame_table() -> FrameTable {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(
                RAM_FRAMES * arch::PAGE_SIZE,
            ));
        }
        let frames = FrameTable::early(RamInfo::new(
            RAM_FRAMES * arch::PAGE_SIZE,
            PhysicalAddress::new(arch::PAGE_SIZE),
        ));
        frames.bootstrap();
        frames
    }

    fn space(id: usize) -> SpaceId {
        SpaceId::new(id)
    }

    fn page(number: usize) -> PageNumber {
        PageNumber::new(number)
    }

    mod lookups {
        use super::*;

        #[test]
        fn returns_what_was_inserted() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            let frame = table.insert(&frames, space(1), page(2), true).unwrap();
            let mapping = table.lookup(space(1), page(2)).unwrap();
            assert_eq!(mapping.frame, frame);
            assert!(mapping.writable);
            assert_eq!(table.mapped_pages(), 1);
        }

        #[test]
        fn misses_unmapped_keys() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            table.insert(&frames, space(1), page(2), true).unwrap();
            assert!(table.lookup(space(1), page(3)).is_none());
            assert!(table.lookup(space(2), page(2)).is_none());
        }

        #[test]
        fn insert_zero_fills_the_frame() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            // Scribble on a frame and return it; the free list is LIFO, so
            // the next insert maps the same frame again.
            let dirty = frames.allocate().unwrap();
            let ptr = AddressTranslator::current().phys_to_ptr(dirty.start());
            unsafe { ptr.write_bytes(0xEE, arch::PAGE_SIZE) };
            frames.deallocate(dirty);

            let frame = table.insert(&frames, space(1), page(1), true).unwrap();
            assert_eq!(frame, dirty);
            let ptr = AddressTranslator::current().phys_to_ptr(frame.start());
            for offset in 0..arch::PAGE_SIZE {
                assert_eq!(unsafe { ptr.add(offset).read() }, 0);
            }
        }
    }

    mod collisions {
        use super::*;

        #[test]
        fn chains_colliding_keys() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            // All three keys hash to slot 0.
            let f1 = table.insert(&frames, space(1), page(1), true).unwrap();
            let f2 = table.insert(&frames, space(2), page(2), true).unwrap();
            let f3 = table.insert(&frames, space(1), page(9), false).unwrap();

            assert_eq!(table.lookup(space(1), page(1)).unwrap().frame, f1);
            assert_eq!(table.lookup(space(2), page(2)).unwrap().frame, f2);
            let third = table.lookup(space(1), page(9)).unwrap();
            assert_eq!(third.frame, f3);
            assert!(!third.writable);

            assert_ne!(f1, f2);
            assert_ne!(f2, f3);
            assert_eq!(table.mapped_pages(), 3);
            table.verify_chains();
        }

        #[test]
        fn probes_wrap_around_the_arena_end() {
            let frames = frame_table();
            let table = HashedPageTable::new(4);

            // Both keys hash to the last slot; the second probes around to
            // slot 0.
            table.insert(&frames, space(1), page(2), true).unwrap();
            table.insert(&frames, space(2), page(1), true).unwrap();

            assert!(table.lookup(space(1), page(2)).is_some());
            assert!(table.lookup(space(2), page(1)).is_some());
            table.verify_chains();
        }

        #[test]
        fn relocates_a_probed_in_resident() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            // (1,1) roots a chain at slot 0, (2,2) collides and probes into
            // slot 1. (1,0) then hashes to slot 1: the resident there belongs
            // to slot 0's chain, so it must move aside.
            table.insert(&frames, space(1), page(1), true).unwrap();
            table.insert(&frames, space(2), page(2), true).unwrap();
            table.insert(&frames, space(1), page(0), true).unwrap();

            assert!(table.lookup(space(1), page(1)).is_some());
            assert!(table.lookup(space(2), page(2)).is_some());
            assert!(table.lookup(space(1), page(0)).is_some());
            assert_eq!(table.mapped_pages(), 3);
            table.verify_chains();
        }

        #[test]
        fn survives_a_long_chain_with_interleaved_removals() {
            let frames = frame_table();
            let table = HashedPageTable::new(16);

            // Pages 1, 17, 33, ... all hash to slot 0 for owner 1.
            for index in 0..8 {
                table
                    .insert(&frames, space(1), page(1 + 16 * index), index % 2 == 0)
                    .unwrap();
            }
            table.verify_chains();

            for index in (0..8).step_by(2) {
                assert!(table.remove(&frames, space(1), page(1 + 16 * index)));
                table.verify_chains();
            }

            for index in (1..8).step_by(2) {
                assert!(table.lookup(space(1), page(1 + 16 * index)).is_some());
            }
            assert_eq!(table.mapped_pages(), 4);
        }

        #[test]
        #[should_panic(expected = "already present")]
        fn duplicate_insert_is_a_bug() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            table.insert(&frames, space(1), page(1), true).unwrap();
            let _ = table.insert(&frames, space(1), page(1), true);
        }
    }

    mod removal {
        use super::*;

        fn colliding_chain(frames: &FrameTable, table: &HashedPageTable) {
            table.insert(frames, space(1), page(1), true).unwrap();
            table.insert(frames, space(2), page(2), true).unwrap();
            table.insert(frames, space(1), page(9), true).unwrap();
        }

        #[test]
        fn removes_a_lone_head() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            table.insert(&frames, space(1), page(1), true).unwrap();
            assert!(table.remove(&frames, space(1), page(1)));
            assert!(table.lookup(space(1), page(1)).is_none());
            assert_eq!(table.mapped_pages(), 0);
            table.verify_chains();
        }

        #[test]
        fn promotes_the_tail_when_the_head_goes() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);
            colliding_chain(&frames, &table);

            assert!(table.remove(&frames, space(1), page(1)));
            assert!(table.lookup(space(2), page(2)).is_some());
            assert!(table.lookup(space(1), page(9)).is_some());
            table.verify_chains();

            assert!(table.remove(&frames, space(2), page(2)));
            assert!(table.lookup(space(1), page(9)).is_some());
            table.verify_chains();
        }

        #[test]
        fn splices_out_an_interior_member() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);
            colliding_chain(&frames, &table);

            assert!(table.remove(&frames, space(2), page(2)));
            assert!(table.lookup(space(1), page(1)).is_some());
            assert!(table.lookup(space(1), page(9)).is_some());
            assert_eq!(table.mapped_pages(), 2);
            table.verify_chains();
        }

        #[test]
        fn returns_the_backing_frame() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            let before = frames.free_frames();
            table.insert(&frames, space(1), page(1), true).unwrap();
            assert_eq!(frames.free_frames(), before - 1);
            table.remove(&frames, space(1), page(1));
            assert_eq!(frames.free_frames(), before);
        }

        #[test]
        fn missing_keys_are_not_an_error() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            assert!(!table.remove(&frames, space(1), page(1)));

            // A probed-in resident on the key's canonical slot is not a chain
            // for that key.
            table.insert(&frames, space(1), page(1), true).unwrap();
            table.insert(&frames, space(2), page(2), true).unwrap();
            assert!(!table.remove(&frames, space(1), page(0)));
            assert!(table.lookup(space(2), page(2)).is_some());
            assert_eq!(table.mapped_pages(), 2);
        }
    }

    mod permissions {
        use super::*;

        #[test]
        fn clears_the_write_bit() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);

            table.insert(&frames, space(1), page(1), true).unwrap();
            assert!(table.set_read_only(space(1), page(1)));
            assert!(!table.lookup(space(1), page(1)).unwrap().writable);
        }

        #[test]
        fn reports_missing_mappings() {
            let frames = frame_table();
            let table = HashedPageTable::new(8);
            assert!(!table.set_read_only(space(1), page(1)));
        }
    }

    mod capacity {
        use super::*;

        #[test]
        fn fails_cleanly_when_the_arena_is_full() {
            let frames = frame_table();
            let table = HashedPageTable::new(2);

            table.insert(&frames, space(1), page(1), true).unwrap();
            table.insert(&frames, space(1), page(3), true).unwrap();

            let free_before = frames.free_frames();
            assert_eq!(
                table.insert(&frames, space(1), page(5), true),
                Err(VmError::OutOfMemory)
            );
            // The vacant-slot probe runs before any frame is claimed.
            assert_eq!(frames.free_frames(), free_before);
            assert_eq!(table.mapped_pages(), 2);
            assert!(table.lookup(space(1), page(1)).is_some());
            assert!(table.lookup(space(1), page(3)).is_some());
            table.verify_chains();
        }

        #[test]
        fn propagates_frame_exhaustion() {
            let frames = frame_table();
            let table = HashedPageTable::new(256);

            while frames.free_frames() > 0 {
                frames.allocate().unwrap();
            }
            assert_eq!(
                table.insert(&frames, space(1), page(1), true),
                Err(VmError::OutOfMemory)
            );
            assert_eq!(table.mapped_pages(), 0);
            table.verify_chains();
        }
    }
}
