/// The outcome of looking at a frame's unwind info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindResult<R> {
    /// The unwind info translates into a compact rule. It can be cached for the
    /// address and executed against the registers.
    ExecRule(R),
    /// The registers have already been updated. Holds the return address, or
    /// `None` if this was the outermost frame.
    Uncacheable(Option<u64>),
}
