//! Physical frame allocator.
//!
//! All of physical memory is carved into page frames tracked by one
//! [`FrameTable`]. Free frames are threaded onto an intrusive free list whose
//! links are frame numbers into the table itself, so a corrupt link can never
//! point outside the arena. The allocator starts in a boot phase that hands
//! out frames from a monotonic cursor (those frames are permanent); once the
//! kernel heap is up, [`FrameTable::bootstrap`] builds the real table and
//! everything the cursor passed over stays reserved.

use alloc::boxed::Box;
use alloc::vec;

use crate::{FrameNumber, HumanSize, PhysicalAddress, VirtualAddress, VmError, arch};

/// One-shot snapshot of the machine's physical memory, taken from the boot
/// loader's hand-off.
///
/// Not copyable: memory is sized exactly once, and the snapshot is consumed
/// by [`FrameTable::early`].
#[derive(Debug)]
pub struct RamInfo {
    total_bytes: usize,
    first_free: PhysicalAddress,
}

impl RamInfo {
    /// Captures the boot-time view of physical memory.
    ///
    /// `total_bytes` is rounded down to a whole number of frames and
    /// `first_free` up to the next frame boundary; everything below
    /// `first_free` (the kernel image and loader data) stays permanently
    /// reserved.
    ///
    /// # Panics
    ///
    /// Panics if no allocatable frame remains above `first_free`.
    pub fn new(total_bytes: usize, first_free: PhysicalAddress) -> Self {
        let total_bytes = total_bytes & !(arch::PAGE_SIZE - 1);
        let first_free = first_free.align_up(arch::PAGE_SIZE);
        assert!(
            first_free.as_usize() < total_bytes,
            "no allocatable memory above the kernel image"
        );
        Self {
            total_bytes,
            first_free,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_frames(&self) -> usize {
        self.total_bytes / arch::PAGE_SIZE
    }

    pub fn first_free(&self) -> PhysicalAddress {
        self.first_free
    }
}

/// Allocation state of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Permanently owned by the kernel image or a boot-phase allocation.
    Reserved,

    /// On the free list.
    Free,

    /// Handed out to exactly one owner.
    Allocated,
}

/// Frame-table slot: the frame's state plus its free-list link.
#[derive(Debug, Clone, Copy)]
struct FrameSlot {
    state: FrameState,
    next: Option<FrameNumber>,
}

enum TableState {
    /// Boot phase: a monotonic cursor over RAM. Frames handed out here can
    /// never be returned.
    Boot { next: FrameNumber, limit: FrameNumber },

    /// Free-list allocator over the whole frame arena.
    Ready(Frames),
}

struct Frames {
    slots: Box<[FrameSlot]>,
    free_head: Option<FrameNumber>,
    free: usize,
    reserved: usize,
}

impl Frames {
    fn pop(&mut self) -> Result<FrameNumber, VmError> {
        let frame = self.free_head.ok_or(VmError::OutOfMemory)?;
        let slot = &mut self.slots[frame.as_usize()];
        debug_assert_eq!(
            slot.state,
            FrameState::Free,
            "free list contains a non-free frame"
        );
        self.free_head = slot.next;
        slot.state = FrameState::Allocated;
        slot.next = None;
        self.free -= 1;
        Ok(frame)
    }

    fn push(&mut self, frame: FrameNumber) {
        assert!(
            frame.as_usize() < self.slots.len(),
            "frame {frame} is outside installed memory"
        );
        let head = self.free_head;
        let slot = &mut self.slots[frame.as_usize()];
        match slot.state {
            FrameState::Allocated => {}
            FrameState::Free => panic!("double free of frame {frame}"),
            FrameState::Reserved => panic!("freed a reserved frame {frame}"),
        }
        slot.state = FrameState::Free;
        slot.next = head;
        self.free_head = Some(frame);
        self.free += 1;
    }
}

/// The system-wide physical frame allocator.
///
/// Every frame of RAM is in exactly one of three states (reserved, free, or
/// allocated), and the counters derived from the table always sum to the
/// total frame count.
pub struct FrameTable {
    state: spin::Mutex<TableState>,
}

impl FrameTable {
    /// Creates the allocator in its boot phase, stealing frames from the
    /// cursor until [`FrameTable::bootstrap`] is called.
    pub fn early(ram: RamInfo) -> Self {
        Self {
            state: spin::Mutex::new(TableState::Boot {
                next: ram.first_free().frame_number(),
                limit: FrameNumber::new(ram.total_frames()),
            }),
        }
    }

    /// Ends the boot phase: builds the frame arena and threads every frame
    /// the cursor never reached onto the free list.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn bootstrap(&self) {
        let mut state = self.state.lock();
        let (reserved, total) = match &*state {
            TableState::Boot { next, limit } => (next.as_usize(), limit.as_usize()),
            TableState::Ready(_) => panic!("frame table already bootstrapped"),
        };

        let mut slots = vec![
            FrameSlot {
                state: FrameState::Reserved,
                next: None,
            };
            total
        ]
        .into_boxed_slice();
        for index in reserved..total {
            slots[index].state = FrameState::Free;
            slots[index].next = if index + 1 < total {
                Some(FrameNumber::new(index + 1))
            } else {
                None
            };
        }

        let free = total - reserved;
        *state = TableState::Ready(Frames {
            slots,
            free_head: if free > 0 {
                Some(FrameNumber::new(reserved))
            } else {
                None
            },
            free,
            reserved,
        });
        drop(state);

        log::info!(
            "frame table ready: {} frames ({} reserved), {} of RAM",
            total,
            reserved,
            HumanSize::new(total * arch::PAGE_SIZE)
        );
    }

    /// Allocates one frame.
    pub fn allocate(&self) -> Result<FrameNumber, VmError> {
        match &mut *self.state.lock() {
            TableState::Boot { next, limit } => {
                if *next < *limit {
                    let frame = *next;
                    *next = frame + 1;
                    Ok(frame)
                } else {
                    Err(VmError::OutOfMemory)
                }
            }
            TableState::Ready(frames) => frames.pop(),
        }
    }

    /// Returns one frame to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the frame is outside installed memory, already free,
    /// reserved, or if the allocator is still in its boot phase.
    pub fn deallocate(&self, frame: FrameNumber) {
        match &mut *self.state.lock() {
            TableState::Boot { .. } => {
                panic!("boot-phase frames are permanent and cannot be freed")
            }
            TableState::Ready(frames) => frames.push(frame),
        }
    }

    /// Allocates kernel working memory, returning its direct-mapped virtual
    /// address.
    ///
    /// # Panics
    ///
    /// Panics if `npages` is not 1; multi-page kernel allocations are not
    /// supported.
    pub fn alloc_kernel_pages(&self, npages: usize) -> Result<VirtualAddress, VmError> {
        assert_eq!(npages, 1, "only single-page kernel allocations are supported");
        let frame = self.allocate()?;
        Ok(VirtualAddress::direct_mapped(frame.start()))
    }

    /// Frees kernel working memory by its direct-mapped virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not point at the base of an allocated
    /// frame.
    pub fn free_kernel_pages(&self, addr: VirtualAddress) {
        debug_assert!(addr.is_direct_mapped(), "freed address is not kernel memory");
        let phys = PhysicalAddress::from_direct_mapped(addr);
        assert!(
            phys.is_aligned(arch::PAGE_SIZE),
            "freed address is not frame-aligned"
        );
        self.deallocate(phys.frame_number());
    }

    /// Total number of frames the table tracks.
    pub fn total_frames(&self) -> usize {
        match &*self.state.lock() {
            TableState::Boot { limit, .. } => limit.as_usize(),
            TableState::Ready(frames) => frames.slots.len(),
        }
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        match &*self.state.lock() {
            TableState::Boot { next, limit } => *limit - *next,
            TableState::Ready(frames) => frames.free,
        }
    }

    /// Number of frames permanently reserved.
    pub fn reserved_frames(&self) -> usize {
        match &*self.state.lock() {
            TableState::Boot { next, .. } => next.as_usize(),
            TableState::Ready(frames) => frames.reserved,
        }
    }

    /// Number of frames currently allocated.
    pub fn allocated_frames(&self) -> usize {
        match &*self.state.lock() {
            TableState::Boot { .. } => 0,
            TableState::Ready(frames) => frames.slots.len() - frames.free - frames.reserved,
        }
    }
}
