//! Architecture backends.
//!
//! Exactly one backend is active at a time. Each exports the same surface:
//! the memory-layout constants, address validation, the interrupt window
//! helper, and the translation-cache primitives.

#[cfg(target_arch = "mips")]
mod mips;

#[cfg(all(target_arch = "mips", not(test), not(feature = "software-emulation")))]
pub use self::mips::*;

// The software scale model is used for tests, for explicit emulation, and
// for any build on a development host.
#[cfg(any(test, feature = "software-emulation", not(target_arch = "mips")))]
mod software;

#[cfg(any(test, feature = "software-emulation", not(target_arch = "mips")))]
pub use self::software::*;
