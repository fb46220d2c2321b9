//! In-process stack unwinding and symbolization.
//!
//! ```no_run
//! fn func1() {
//!     funcstack::print_backtrace();
//! }
//! ```
//!
//! prints
//!
//! ```text
//! ---------backstrace---------
//! Func: my_crate::func1
//! Func: my_crate::main
//! ...
//! ```

mod arch;
mod backtrace;
mod cache;
mod code_address;
mod context;
mod error;
mod modules;
mod rule_cache;
mod rules;
mod symbols;
mod unwind_result;
mod unwinder;
mod unwinders;
mod unwindregs;
mod walker;

pub use arch::{Arch, ArchAarch64, ArchX86_64};
pub use backtrace::{Backtrace, DisplayBacktrace, Frame, ReportOptions, Termination, HEADER};
pub use cache::Cache;
pub use code_address::CodeAddress;
pub use context::{ExecutionContext, RawContext, StackBounds};
pub use error::{CaptureError, Error, UnwinderError};
pub use modules::{loaded_objects, process_unwinder, LoadedObject};
pub use rule_cache::CacheStats;
pub use rules::{UnwindRule, UnwindRuleAarch64, UnwindRuleX86_64};
pub use symbols::{
    demangle, ProcessSymbols, Resolution, SymbolList, SymbolRef, SymbolTable, UNKNOWN_SYMBOL,
};
pub use unwind_result::UnwindResult;
pub use unwinder::{
    Module, SectionAddresses, UnwindData, Unwinder, UnwinderAarch64, UnwinderX86_64,
};
pub use unwinders::{ConversionError, DwarfUnwinderError, DwarfUnwinding};
pub use unwindregs::*;
pub use walker::{Cursor, Frames, StackWalker, StepResult, WalkOptions};

use tracing::warn;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub type ArchNative = ArchAarch64;
        pub type UnwindRegsNative = UnwindRegsAarch64;
        pub type UnwindRuleNative = UnwindRuleAarch64;
        pub type UnwinderNative<D> = UnwinderAarch64<D>;
    } else {
        pub type ArchNative = ArchX86_64;
        pub type UnwindRegsNative = UnwindRegsX86_64;
        pub type UnwindRuleNative = UnwindRuleX86_64;
        pub type UnwinderNative<D> = UnwinderX86_64<D>;
    }
}

/// Captures the backtrace of the calling function, resolved against the
/// symbols of the current process.
///
/// The first frame is the caller of this function. Only a failure to capture
/// the context is an error; a walk that fails midway returns the frames found
/// so far, see [`Backtrace::termination`].
#[inline(never)]
pub fn capture_backtrace() -> Result<Backtrace, CaptureError> {
    let ctx = capture_context!()?;
    let backtrace = StackWalker::new().walk(&ctx);
    Ok(std::hint::black_box(backtrace))
}

/// Prints the backtrace of the calling function to stdout.
#[inline(never)]
pub fn print_backtrace() {
    let backtrace = match capture_context!() {
        Ok(ctx) => StackWalker::new().walk(&ctx),
        Err(err) => {
            warn!("Could not capture the backtrace: {}", err);
            backtrace::print_header();
            return;
        }
    };
    std::hint::black_box(&backtrace).print(ReportOptions::default());
}

/// Like [`print_backtrace`], with explicit report options.
#[inline(never)]
pub fn print_backtrace_with(options: ReportOptions) {
    let backtrace = match capture_context!() {
        Ok(ctx) => StackWalker::new().walk(&ctx),
        Err(err) => {
            warn!("Could not capture the backtrace: {}", err);
            backtrace::print_header();
            return;
        }
    };
    std::hint::black_box(&backtrace).print(options);
}
