use std::fmt;

mod aarch64;
mod x86_64;

pub use aarch64::*;
pub use x86_64::*;

/// The register state that the unwinder tracks from frame to frame.
pub trait UnwindRegs: Copy + fmt::Debug {
    /// The stack pointer. Each step must leave it at least as high as before.
    fn sp(&self) -> u64;
}

/// Formats a register value as `0x...` in debug output.
pub(crate) struct HexNum(pub u64);

impl fmt::Debug for HexNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
