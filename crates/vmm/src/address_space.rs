//! Address spaces and their region ledgers.
//!
//! An [`AddressSpace`] records which virtual spans a process may touch: one
//! [`Region`] per loadable segment plus the fixed-size stack. Regions only
//! describe; no frame is claimed until the process actually faults on a page.

use alloc::vec::Vec;
use core::fmt;

use crate::{PageNumber, VirtualAddress, arch};

/// Number of pages in every user stack.
pub const STACK_PAGES: usize = 16;

/// Identity of an address space.
///
/// Ids are handed out monotonically and never reused, so a stale page-table
/// entry can never alias a later address space that happens to live at the
/// same allocation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(usize);

impl SpaceId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceId({})", self.0)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous, permission-tagged span of virtual pages.
///
/// `writable` is the permission in force right now; `can_write` is the
/// permission the region was declared with. The two differ only inside the
/// load window, when declared-read-only segments are temporarily writable so
/// the loader can populate them.
#[derive(Debug, Clone)]
pub struct Region {
    vbase: VirtualAddress,
    npages: usize,
    readable: bool,
    writable: bool,
    can_write: bool,
}

impl Region {
    fn new(vbase: VirtualAddress, npages: usize, readable: bool, writable: bool) -> Self {
        Self {
            vbase,
            npages,
            readable,
            writable,
            can_write: writable,
        }
    }

    pub fn vbase(&self) -> VirtualAddress {
        self.vbase
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Declared readability. Recorded for completeness; the MMU has no
    /// read-disable bit, so it is never enforced.
    pub fn readable(&self) -> bool {
        self.readable
    }

    /// Write permission currently in force.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Write permission the region was declared with.
    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Whether the address falls inside the region.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        let addr = addr.as_usize();
        let base = self.vbase.as_usize();
        addr >= base && addr - base < self.npages * arch::PAGE_SIZE
    }

    /// Iterates the virtual pages the region spans.
    pub fn pages(&self) -> impl Iterator<Item = PageNumber> {
        let first = self.vbase.page_number().as_usize();
        (first..first + self.npages).map(PageNumber::new)
    }
}

/// One process's virtual address space: an identity plus the region ledger.
#[derive(Debug)]
pub struct AddressSpace {
    id: SpaceId,
    regions: Vec<Region>,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId) -> Self {
        Self {
            id,
            regions: Vec::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub(crate) fn regions_mut(&mut self) -> &mut [Region] {
        &mut self.regions
    }

    pub(crate) fn push_region(&mut self, region: Region) {
        self.regions.push(region);
    }

    /// Declares a legal span of the address space.
    ///
    /// The base is rounded down to a page boundary and the size rounded up,
    /// so the declared bytes are always covered. Nothing is allocated here;
    /// pages materialize on first touch.
    ///
    /// # Panics
    ///
    /// Panics if the span covers zero pages.
    pub fn define_region(
        &mut self,
        vbase: VirtualAddress,
        size: usize,
        readable: bool,
        writable: bool,
    ) {
        let offset = vbase.page_offset();
        let vbase = vbase.align_down(arch::PAGE_SIZE);
        let npages = (size + offset).div_ceil(arch::PAGE_SIZE);
        assert!(npages > 0, "region at {vbase} covers zero pages");
        self.regions.push(Region::new(vbase, npages, readable, writable));
    }

    /// Opens the load window: the stack region is defined (the loader may
    /// touch it immediately) and every region becomes writable so
    /// declared-read-only segments can be populated.
    ///
    /// [`VirtualMemoryManager::complete_load`] closes the window again.
    ///
    /// [`VirtualMemoryManager::complete_load`]: crate::VirtualMemoryManager::complete_load
    pub fn prepare_load(&mut self) {
        let stack_base = VirtualAddress::new(arch::USER_TOP - STACK_PAGES * arch::PAGE_SIZE);
        self.define_region(stack_base, STACK_PAGES * arch::PAGE_SIZE, true, true);
        for region in &mut self.regions {
            region.writable = true;
        }
    }

    /// Returns the initial user stack pointer. The stack grows down from the
    /// top of the user window into the region [`prepare_load`] defined.
    ///
    /// [`prepare_load`]: AddressSpace::prepare_load
    pub fn define_stack(&self) -> VirtualAddress {
        VirtualAddress::new(arch::USER_TOP)
    }

    /// Finds the region covering an address, the stack included.
    pub fn find_region(&self, addr: VirtualAddress) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(addr))
    }
}
