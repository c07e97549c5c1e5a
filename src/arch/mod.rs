//! Architecture-specific code.
//!
//! The kernel targets 32-bit x86. The module also compiles for the build
//! host so that the architecture-independent logic can be unit tested; every
//! function that touches hardware is gated on `target_os = "none"` and has a
//! host stub next to it.

pub mod x86;

pub use self::x86::*;
