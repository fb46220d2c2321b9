use fallible_iterator::FallibleIterator;
use tracing::trace;

use crate::backtrace::{Backtrace, Frame, Termination};
use crate::cache::Cache;
use crate::code_address::CodeAddress;
use crate::context::{ExecutionContext, StackBounds};
use crate::error::{CaptureError, Error};
use crate::modules::process_unwinder;
use crate::rule_cache::CacheStats;
use crate::symbols::{ProcessSymbols, SymbolTable};
use crate::{UnwindRegsNative, UnwindRuleNative, UnwinderNative};

/// Limits for a single walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkOptions {
    /// The walk fails with [`Error::IterationCapReached`] if the stack has
    /// more than this many frames.
    pub max_frames: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self { max_frames: 256 }
    }
}

impl WalkOptions {
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }
}

/// The outcome of [`Cursor::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// The cursor moved to the caller's frame.
    Advanced,
    /// There are no more frames.
    Exhausted,
    /// Unwinding failed. The cursor is exhausted from now on.
    Failed(Error),
}

/// Walks call stacks and resolves their frames.
///
/// The walker borrows a module list to unwind with and a symbol table to
/// resolve frames with. [`StackWalker::new`] uses the ones for the current
/// process.
pub struct StackWalker<'a, S: SymbolTable + ?Sized> {
    unwinder: &'a UnwinderNative<&'static [u8]>,
    symbols: &'a S,
    options: WalkOptions,
}

impl StackWalker<'static, ProcessSymbols> {
    pub fn new() -> Self {
        Self::with_unwinder(
            process_unwinder(),
            ProcessSymbols::get(),
            WalkOptions::default(),
        )
    }
}

impl Default for StackWalker<'static, ProcessSymbols> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, S: SymbolTable + ?Sized> StackWalker<'a, S> {
    /// A walker over the current process's modules that resolves names with `symbols`.
    pub fn with_symbols(symbols: &'a S) -> Self {
        Self::with_unwinder(process_unwinder(), symbols, WalkOptions::default())
    }

    pub fn with_unwinder(
        unwinder: &'a UnwinderNative<&'static [u8]>,
        symbols: &'a S,
        options: WalkOptions,
    ) -> Self {
        Self {
            unwinder,
            symbols,
            options,
        }
    }

    pub fn options(&self) -> WalkOptions {
        self.options
    }

    /// Creates a cursor positioned on the function that captured `ctx`.
    pub fn init_cursor(&self, ctx: &ExecutionContext) -> Cursor<'a> {
        Cursor {
            unwinder: self.unwinder,
            cache: Cache::new(),
            regs: ctx.regs(),
            address: ctx.code_address(),
            stack: ctx.stack_bounds(),
            steps: 0,
            max_frames: self.options.max_frames,
            exhausted: false,
        }
    }

    /// The frames of the callers of the function that captured `ctx`,
    /// innermost first. Each call starts a new walk.
    pub fn frames(&self, ctx: &ExecutionContext) -> Frames<'a, S> {
        Frames {
            cursor: self.init_cursor(ctx),
            symbols: self.symbols,
            termination: None,
        }
    }

    /// Walks the whole stack described by `ctx`.
    pub fn walk(&self, ctx: &ExecutionContext) -> Backtrace {
        self.frames(ctx).into_backtrace()
    }

    /// Captures and walks the stack of the calling function. The returned
    /// backtrace starts with the caller of this method.
    #[inline(never)]
    pub fn capture_backtrace(&self) -> Result<Backtrace, CaptureError> {
        let ctx = crate::capture_context!()?;
        let backtrace = self.walk(&ctx);
        Ok(std::hint::black_box(backtrace))
    }
}

/// The unwinding position of one walk.
pub struct Cursor<'a> {
    unwinder: &'a UnwinderNative<&'static [u8]>,
    cache: Cache<UnwindRuleNative>,
    regs: UnwindRegsNative,
    address: CodeAddress,
    stack: StackBounds,
    steps: usize,
    max_frames: usize,
    exhausted: bool,
}

impl<'a> Cursor<'a> {
    /// The code address of the current frame.
    pub fn address(&self) -> CodeAddress {
        self.address
    }

    pub fn regs(&self) -> UnwindRegsNative {
        self.regs
    }

    /// The number of frames stepped to so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Moves to the caller of the current frame.
    pub fn step(&mut self) -> StepResult {
        if self.exhausted {
            return StepResult::Exhausted;
        }
        match self.try_step() {
            Ok(true) => StepResult::Advanced,
            Ok(false) => {
                self.exhausted = true;
                StepResult::Exhausted
            }
            Err(err) => {
                trace!("Unwinding stopped at {:?}: {}", self.address, err);
                self.exhausted = true;
                StepResult::Failed(err)
            }
        }
    }

    fn try_step(&mut self) -> Result<bool, Error> {
        let stack = self.stack;
        let mut read_stack = |address| stack.read_u64(address);
        let mut regs = self.regs;
        let return_address =
            match self
                .unwinder
                .unwind_frame(self.address, &mut regs, &mut self.cache, &mut read_stack)?
            {
                Some(return_address) => return_address,
                None => return Ok(false),
            };
        // The step is attempted even at the cap, so a stack of exactly
        // `max_frames` frames still ends as exhausted.
        if self.steps >= self.max_frames {
            return Err(Error::IterationCapReached(self.max_frames));
        }

        let (sp, new_sp) = (self.regs.sp(), regs.sp());
        if new_sp < sp {
            return Err(Error::StackPointerMovedBackwards);
        }
        if new_sp == sp && return_address == self.address.address() {
            return Err(Error::DidNotAdvance);
        }

        trace!(
            "Step {}: 0x{:x} -> 0x{:x}, {:?}",
            self.steps,
            self.address.address(),
            return_address,
            regs
        );
        self.regs = regs;
        self.address = CodeAddress::ReturnAddress(return_address);
        self.steps += 1;
        Ok(true)
    }
}

impl<'a> FallibleIterator for Cursor<'a> {
    type Item = CodeAddress;
    type Error = Error;

    fn next(&mut self) -> Result<Option<CodeAddress>, Error> {
        match self.step() {
            StepResult::Advanced => Ok(Some(self.address)),
            StepResult::Exhausted => Ok(None),
            StepResult::Failed(err) => Err(err),
        }
    }
}

/// An iterator over the resolved frames of one walk.
pub struct Frames<'a, S: SymbolTable + ?Sized> {
    cursor: Cursor<'a>,
    symbols: &'a S,
    termination: Option<Termination>,
}

impl<'a, S: SymbolTable + ?Sized> Frames<'a, S> {
    /// Why the walk ended, or `None` while frames remain.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn cursor(&self) -> &Cursor<'a> {
        &self.cursor
    }

    /// Collects the remaining frames.
    pub fn into_backtrace(mut self) -> Backtrace {
        let frames: Vec<Frame> = self.by_ref().collect();
        Backtrace::new(
            frames,
            self.termination.unwrap_or(Termination::Exhausted),
        )
    }
}

impl<'a, S: SymbolTable + ?Sized> Iterator for Frames<'a, S> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.termination.is_some() {
            return None;
        }
        match self.cursor.step() {
            StepResult::Advanced => Some(resolve_frame(self.symbols, self.cursor.address())),
            StepResult::Exhausted => {
                self.termination = Some(Termination::Exhausted);
                None
            }
            StepResult::Failed(err) => {
                self.termination = Some(Termination::Failed(err));
                None
            }
        }
    }
}

/// Resolves the symbol for a frame. Return addresses are looked up at
/// `address - 1`, and the offset is then reported relative to the return
/// address itself.
fn resolve_frame<S: SymbolTable + ?Sized>(symbols: &S, address: CodeAddress) -> Frame {
    let resolution = symbols.resolve(address.address_for_lookup());
    let offset = match address {
        _ if resolution.is_unknown() => 0,
        CodeAddress::ReturnAddress(_) => resolution.offset + 1,
        CodeAddress::InstructionPointer(_) => resolution.offset,
    };
    Frame {
        name: resolution.name,
        offset,
        address: address.address(),
    }
}
