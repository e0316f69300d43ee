//! The memory-manager service object.
//!
//! One [`VirtualMemoryManager`] is constructed at boot and owns the frame
//! table, the hashed page table, and the translation cache. Every
//! translation fault the trap path sees funnels through
//! [`VirtualMemoryManager::fault`]; the process lifecycle drives the rest
//! (create, load, copy on fork, activate on switch, destroy on exit).

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    AddressSpace, AddressTranslator, FaultKind, FrameNumber, FrameTable, HashedPageTable, RamInfo,
    SpaceId, Tlb, VirtualAddress, VmError, arch,
};

/// Page-table slots provisioned per physical frame. Over-provisioning keeps
/// collision chains short and means the arena cannot fill before RAM does.
const PAGE_TABLE_SLOTS_PER_FRAME: usize = 2;

/// The virtual memory subsystem.
pub struct VirtualMemoryManager {
    frames: FrameTable,
    pages: HashedPageTable,
    tlb: Tlb,
    next_space: AtomicUsize,
}

impl VirtualMemoryManager {
    /// Brings the subsystem up from the boot-time RAM snapshot.
    pub fn bootstrap(ram: RamInfo) -> Self {
        let frames = FrameTable::early(ram);
        frames.bootstrap();
        let pages = HashedPageTable::new(frames.total_frames() * PAGE_TABLE_SLOTS_PER_FRAME);
        log::info!(
            "hashed page table sized at {} slots for {} frames",
            pages.capacity(),
            frames.total_frames()
        );

        Self {
            frames,
            pages,
            tlb: Tlb::new(),
            next_space: AtomicUsize::new(1),
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn page_table(&self) -> &HashedPageTable {
        &self.pages
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Creates an empty address space with a fresh identity.
    pub fn create_space(&self) -> AddressSpace {
        let id = SpaceId::new(self.next_space.fetch_add(1, Ordering::Relaxed));
        log::debug!("created address space {id}");
        AddressSpace::new(id)
    }

    /// Services a translation fault.
    ///
    /// `space` is the faulting thread's address space; kernel-only threads
    /// have none and must never fault. `code` is the raw classification the
    /// trap path hands up.
    ///
    /// A fault on a mapped page republishes the existing mapping to the
    /// cache. A first touch inside a region materializes the page in a
    /// zero-filled frame under the region's current permissions. Everything
    /// else is an error the caller turns into process termination.
    pub fn fault(
        &self,
        space: Option<&AddressSpace>,
        code: usize,
        addr: VirtualAddress,
    ) -> Result<(), VmError> {
        let Some(kind) = FaultKind::from_code(code) else {
            return Err(VmError::InvalidRequest);
        };
        if kind == FaultKind::ReadOnly {
            // Stores to read-only mappings are fatal, never an upgrade.
            return Err(VmError::InvalidAccess);
        }
        let space = space.ok_or(VmError::InvalidAccess)?;
        let Some(region) = space.find_region(addr) else {
            log::trace!("space {}: fault at {addr} outside every region", space.id());
            return Err(VmError::InvalidAccess);
        };

        let vpage = addr.page_number();
        match self.pages.lookup(space.id(), vpage) {
            Some(mapping) => {
                // Still mapped; the entry only fell out of the cache.
                self.tlb.install(vpage, mapping.frame, mapping.writable);
            }
            None => {
                let frame = self
                    .pages
                    .insert(&self.frames, space.id(), vpage, region.writable())?;
                self.tlb.install(vpage, frame, region.writable());
                log::trace!(
                    "space {}: page {vpage} materialized in frame {frame}",
                    space.id()
                );
            }
        }
        Ok(())
    }

    /// Closes the load window opened by [`AddressSpace::prepare_load`].
    ///
    /// Declared permissions come back into force, pages already materialized
    /// in read-only regions are downgraded in place, and the cache is flushed
    /// so no stale writable entry survives.
    pub fn complete_load(&self, space: &mut AddressSpace) {
        for region in space.regions_mut() {
            region.set_writable(region.can_write());
        }

        let owner = space.id();
        for region in space.regions() {
            if region.can_write() {
                continue;
            }
            for vpage in region.pages() {
                self.pages.set_read_only(owner, vpage);
            }
        }
        self.tlb.flush_all();
        log::debug!("space {owner}: load complete");
    }

    /// Eagerly duplicates an address space: the region ledger and the
    /// contents of every materialized page. Pages the original never touched
    /// stay absent in the copy.
    pub fn copy_space(&self, old: &AddressSpace) -> Result<AddressSpace, VmError> {
        let mut new_space = self.create_space();
        for region in old.regions() {
            new_space.push_region(region.clone());
        }
        debug_assert_eq!(new_space.regions().len(), old.regions().len());

        for region in old.regions() {
            for vpage in region.pages() {
                let Some(mapping) = self.pages.lookup(old.id(), vpage) else {
                    continue;
                };
                let frame =
                    match self
                        .pages
                        .insert(&self.frames, new_space.id(), vpage, mapping.writable)
                    {
                        Ok(frame) => frame,
                        Err(err) => {
                            // Give back everything the partial copy claimed.
                            self.destroy_space(new_space);
                            return Err(err);
                        }
                    };
                // SAFETY: source and destination are distinct frames (the
                // insert claimed a fresh one) and the direct map covers both.
                unsafe {
                    ptr::copy_nonoverlapping(
                        frame_ptr(mapping.frame),
                        frame_ptr(frame),
                        arch::PAGE_SIZE,
                    );
                }
            }
        }

        self.tlb.flush_all();
        log::debug!("space {} copied into space {}", old.id(), new_space.id());
        Ok(new_space)
    }

    /// Tears an address space down, returning every materialized page's frame.
    /// Pages that never faulted have nothing to release and are skipped.
    pub fn destroy_space(&self, space: AddressSpace) {
        let owner = space.id();
        for region in space.regions() {
            for vpage in region.pages() {
                self.pages.remove(&self.frames, owner, vpage);
            }
        }
        self.tlb.flush_all();
        log::debug!("destroyed address space {owner}");
    }

    /// Makes `space` the running thread's address space on this processor.
    ///
    /// Cache entries carry no owner tag, so every switch to a user space
    /// flushes the cache wholesale. Kernel-only threads (`None`) install no
    /// user mappings and skip the flush.
    pub fn activate(&self, space: Option<&AddressSpace>) {
        if space.is_some() {
            self.tlb.flush_all();
        }
    }
}

fn frame_ptr(frame: FrameNumber) -> *mut u8 {
    AddressTranslator::current().phys_to_ptr(frame.start())
}
