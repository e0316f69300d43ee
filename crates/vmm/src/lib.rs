#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Borealis Virtual Memory Manager (VMM)
//!
//! The Borealis Virtual Memory Manager (VMM) is the virtual memory subsystem
//! of the single-core Borealis teaching kernel. It provides:
//!
//! - Physical frame accounting and allocation.
//! - Demand-paged address spaces backed by a global hashed page table.
//! - A software-loaded translation cache in front of the page table.
//! - Software emulation so the whole stack runs as ordinary host tests.

extern crate alloc;

mod addr;
mod address_space;
mod arch;
mod fault;
mod frame_table;
mod hashed_page_table;
mod human_size;
mod tlb;
mod virtual_memory_manager;

pub use addr::{AddressTranslator, FrameNumber, PageNumber, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, Region, STACK_PAGES, SpaceId};
pub use fault::{FaultKind, VmError};
pub use frame_table::{FrameTable, RamInfo};
pub use hashed_page_table::{HashedPageTable, Mapping};
pub use human_size::HumanSize;
pub use tlb::Tlb;
pub use virtual_memory_manager::VirtualMemoryManager;

pub use arch::{PAGE_SIZE, TLB_SLOTS, TlbEntry, USER_TOP};
