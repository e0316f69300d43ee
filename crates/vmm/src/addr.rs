//! Address and page-number types.
//!
//! Physical memory is referred to by [`FrameNumber`], virtual memory by
//! [`PageNumber`]; the address types validate against the architecture's
//! layout on construction. User addresses live below [`arch::USER_TOP`] and
//! kernel addresses inside the direct-map window directly above it, so a
//! kernel pointer is always `physical address + window base`.
// cSpell:ignore kseg

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

/// Translates between physical addresses and kernel-accessible pointers.
///
/// On hardware this is simple arithmetic against the direct-map window. In
/// tests and emulation, physical memory is a host buffer and translation
/// indexes into it.
pub enum AddressTranslator {
    /// Hardware translation through the direct map at a fixed offset.
    Hardware { direct_map_offset: usize },

    /// Software translation through an emulated memory buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(arch::EmulatedMemory),
}

// The current translator is installed once at boot. Tests run in parallel
// threads and each needs its own emulated memory, so test builds store the
// translator thread-locally instead.
#[cfg(not(any(test, feature = "software-emulation")))]
static CURRENT_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static CURRENT_TRANSLATOR: spin::Once<&'static AddressTranslator> = spin::Once::new();
}

impl AddressTranslator {
    /// Creates a translator for hardware running with a direct map at the
    /// given offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a translator backed by `size` bytes of emulated physical
    /// memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(arch::EmulatedMemory::new(size))
    }

    /// Installs the global translator.
    ///
    /// # Panics
    ///
    /// Panics if a translator has already been installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            assert!(
                CURRENT_TRANSLATOR.get().is_none(),
                "address translator already set"
            );
            CURRENT_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            CURRENT_TRANSLATOR.with(|current| {
                assert!(current.get().is_none(), "address translator already set");

                // The translator lives for the rest of the thread; leaking it
                // gives out the same 'static reference the hardware path has.
                let leaked: &'static AddressTranslator = Box::leak(Box::new(translator));
                current.call_once(|| leaked);
            });
        }
    }

    /// Returns the current translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been installed.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect("no address translator configured")
    }

    /// Returns the current translator, if one has been installed.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            CURRENT_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            CURRENT_TRANSLATOR.with(|current| current.get().copied())
        }
    }

    /// Translates a physical address to the virtual address it is reachable
    /// at in the kernel.
    pub fn phys_to_virt(&self, addr: PhysicalAddress) -> VirtualAddress {
        match self {
            Self::Hardware { direct_map_offset } => {
                VirtualAddress::new(addr.as_usize() + direct_map_offset)
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => VirtualAddress(memory.translate(addr.as_usize()) as usize),
        }
    }

    /// Translates a kernel virtual address back to the physical address it
    /// maps.
    pub fn virt_to_phys(&self, addr: VirtualAddress) -> PhysicalAddress {
        match self {
            Self::Hardware { direct_map_offset } => {
                assert!(
                    addr.as_usize() >= *direct_map_offset,
                    "address is below the direct-map window"
                );
                PhysicalAddress::new(addr.as_usize() - direct_map_offset)
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => {
                PhysicalAddress::new(memory.ptr_to_phys(addr.as_usize() as *const u8))
            }
        }
    }

    /// Returns a raw pointer to the memory behind a physical address.
    pub fn phys_to_ptr(&self, addr: PhysicalAddress) -> *mut u8 {
        match self {
            Self::Hardware { .. } => self.phys_to_virt(addr).as_mut_ptr(),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(addr.as_usize()),
        }
    }
}

macro_rules! impl_address_common {
    ($name:ident) => {
        impl $name {
            /// Creates a new address without validating it.
            ///
            /// # Safety
            ///
            /// The caller must guarantee the address is valid for the
            /// architecture's layout.
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address.
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns whether the address is aligned to `alignment`, which
            /// must be a power of two.
            #[inline]
            pub const fn is_aligned(self, alignment: usize) -> bool {
                assert!(
                    alignment.is_power_of_two(),
                    "alignment must be a power of two"
                );
                self.0 & (alignment - 1) == 0
            }

            /// Aligns the address down to `alignment`, which must be a power
            /// of two.
            #[inline]
            pub const fn align_down(self, alignment: usize) -> Self {
                assert!(
                    alignment.is_power_of_two(),
                    "alignment must be a power of two"
                );
                Self(self.0 & !(alignment - 1))
            }

            /// Aligns the address up to `alignment`, which must be a power of
            /// two.
            #[inline]
            pub const fn align_up(self, alignment: usize) -> Self {
                assert!(
                    alignment.is_power_of_two(),
                    "alignment must be a power of two"
                );
                Self((self.0 + alignment - 1) & !(alignment - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Pointer::fmt(&(self.0 as *const ()), f)
            }
        }

        impl From<usize> for $name {
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self {
                Self::new(self.0 - rhs)
            }
        }
    };
}

macro_rules! impl_page_number_common {
    ($name:ident) => {
        impl $name {
            /// Creates a new number from a raw index.
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw index.
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            fn sub(self, rhs: $name) -> usize {
                self.0 - rhs.0
            }
        }
    };
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl_address_common!(PhysicalAddress);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit the physical window.
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address outside the direct-map window"
        );
        Self(addr)
    }

    /// Recovers the physical address behind a kernel direct-mapped virtual
    /// address.
    pub fn from_direct_mapped(addr: VirtualAddress) -> Self {
        AddressTranslator::current().virt_to_phys(addr)
    }

    /// Returns the number of the frame containing this address.
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl_address_common!(VirtualAddress);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is outside both the user window and the kernel
    /// direct-map window.
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "virtual address outside the user and kernel windows"
        );
        Self(addr)
    }

    /// Creates a virtual address from a pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        // Host pointers in emulated mode do not fit the target layout; trust
        // them as-is.
        #[cfg(any(test, feature = "software-emulation"))]
        if let Some(AddressTranslator::Emulated(_)) = AddressTranslator::try_current() {
            return Self(ptr as usize);
        }

        Self::new(ptr as usize)
    }

    /// Returns the virtual address a physical address is direct-mapped at.
    pub fn direct_mapped(addr: PhysicalAddress) -> Self {
        AddressTranslator::current().phys_to_virt(addr)
    }

    /// Returns whether this address lies inside the kernel direct-map window.
    pub fn is_direct_mapped(self) -> bool {
        match AddressTranslator::current() {
            AddressTranslator::Hardware { direct_map_offset } => self.0 >= *direct_map_offset,
            #[cfg(any(test, feature = "software-emulation"))]
            AddressTranslator::Emulated(_) => true,
        }
    }

    /// Returns the address as a const pointer.
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mut pointer.
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the number of the page containing this address.
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

/// The number of a physical page frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl_page_number_common!(FrameNumber);

impl FrameNumber {
    /// Physical address of the first byte of the frame.
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Physical address one past the last byte of the frame.
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 + 1) * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

/// The number of a virtual page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNumber(usize);

impl_page_number_common!(PageNumber);

impl PageNumber {
    /// Virtual address of the first byte of the page.
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Virtual address one past the last byte of the page.
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new((self.0 + 1) * arch::PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}
