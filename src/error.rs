use crate::unwinders::DwarfUnwinderError;

/// The error type of a single unwind step.
///
/// Any of these ends the walk. The frames gathered before the failure are kept.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Could not read stack memory at 0x{0:x}")]
    CouldNotReadStack(u64),

    #[error("Frame pointer unwinding moved backwards")]
    FramepointerUnwindingMovedBackwards,

    #[error("Stack pointer moved backwards")]
    StackPointerMovedBackwards,

    #[error("Unwinding did not advance to a new frame")]
    DidNotAdvance,

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,

    #[error("Stopped after {0} frames")]
    IterationCapReached(usize),
}

/// Why a module's own unwind data could not be used for an address. This is
/// never surfaced to callers; the unwinder logs it and falls back to frame
/// pointer unwinding.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UnwinderError {
    #[error("DWARF unwinding failed: {0}")]
    Dwarf(#[from] DwarfUnwinderError),

    #[error("No unwind data for the module containing the address")]
    NoModuleUnwindData,

    #[error(".eh_frame_hdr was not successful in looking up the address in the table")]
    EhFrameHdrCouldNotFindAddress,
}

/// The error type of [`capture_context!`](crate::capture_context).
///
/// This is the only failure that a capture reports as an error. A walk that
/// fails after a successful capture yields a partial backtrace instead.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("Capturing the execution context is not supported on this platform")]
    UnsupportedPlatform,

    #[error("Could not determine the stack bounds of the current thread: {0}")]
    StackBounds(#[source] std::io::Error),

    #[error("The captured stack pointer is zero")]
    ZeroStackPointer,

    #[error("The captured stack pointer 0x{sp:x} is outside the thread's stack 0x{bottom:x}..0x{top:x}")]
    StackPointerOutsideStack { sp: u64, bottom: u64, top: u64 },
}
