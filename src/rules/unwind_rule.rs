use crate::error::Error;

/// A compact description of how to get from one frame to its caller.
///
/// Rules are small and `Copy` so that they can be stored in the rule cache.
/// `exec` returns `Ok(None)` when the rule finds the outermost frame.
pub trait UnwindRule: Copy + std::fmt::Debug {
    type UnwindRegs;

    fn exec<F>(self, regs: &mut Self::UnwindRegs, read_stack: &mut F) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>;

    /// The rule used for addresses without usable unwind info.
    fn fallback_rule() -> Self;
}
