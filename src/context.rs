use std::cell::Cell;

use crate::code_address::CodeAddress;
use crate::error::CaptureError;
use crate::UnwindRegsNative;

/// Register values read by [`capture_context!`](crate::capture_context).
///
/// `lr` is only meaningful on aarch64.
#[doc(hidden)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawContext {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub lr: u64,
}

/// The part of the current thread's stack that a walk may read: from the
/// captured stack pointer up to the top of the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    low: u64,
    high: u64,
}

impl StackBounds {
    /// # Safety
    ///
    /// All memory in `low..high` must stay readable for as long as these
    /// bounds (or a context holding them) are used.
    pub unsafe fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.low..self.high).contains(&address)
    }

    /// Reads the aligned word at `address`, or fails if any of its bytes are
    /// outside the bounds.
    pub fn read_u64(&self, address: u64) -> Result<u64, ()> {
        if address % 8 != 0 || address < self.low {
            return Err(());
        }
        match address.checked_add(8) {
            Some(end) if end <= self.high => {}
            _ => return Err(()),
        }
        // SAFETY: the range is readable per the contract of `StackBounds::new`.
        Ok(unsafe { std::ptr::read(address as *const u64) })
    }
}

/// The register state of a live function, together with the stack it runs on.
///
/// A context is only meaningful while the function that captured it has not
/// returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    regs: UnwindRegsNative,
    code_address: u64,
    stack: StackBounds,
}

impl ExecutionContext {
    /// Builds a context from captured registers, looking up the stack bounds
    /// of the current thread.
    ///
    /// Fails if `raw.sp` does not lie within the current thread's stack.
    ///
    /// # Safety
    ///
    /// `raw` must hold the registers of a function on the current thread that
    /// has not returned yet, as read by [`capture_context!`](crate::capture_context).
    /// Walks read the stack between `raw.sp` and the stack top, and follow the
    /// frame records that `raw.fp` leads to.
    #[doc(hidden)]
    pub unsafe fn from_raw(raw: RawContext) -> Result<Self, CaptureError> {
        if !cfg!(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        )) {
            return Err(CaptureError::UnsupportedPlatform);
        }
        if raw.sp == 0 {
            return Err(CaptureError::ZeroStackPointer);
        }
        let (stack_bottom, stack_top) = current_thread_stack()?;
        if raw.sp < stack_bottom || raw.sp >= stack_top {
            return Err(CaptureError::StackPointerOutsideStack {
                sp: raw.sp,
                bottom: stack_bottom,
                top: stack_top,
            });
        }
        // SAFETY: everything between the live stack pointer and the stack top
        // belongs to frames that outlive the capturing function.
        let stack = StackBounds::new(raw.sp, stack_top);
        Ok(Self::with_stack(raw, stack))
    }

    /// Builds a context over an explicit stack range.
    pub fn with_stack(raw: RawContext, stack: StackBounds) -> Self {
        Self {
            regs: native_regs(raw),
            code_address: raw.pc,
            stack,
        }
    }

    pub fn regs(&self) -> UnwindRegsNative {
        self.regs
    }

    /// The address the capturing function was executing at.
    pub fn code_address(&self) -> CodeAddress {
        CodeAddress::InstructionPointer(self.code_address)
    }

    pub fn stack_bounds(&self) -> StackBounds {
        self.stack
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        fn native_regs(raw: RawContext) -> UnwindRegsNative {
            UnwindRegsNative::new(raw.pc, raw.lr, raw.sp, raw.fp)
        }
    } else {
        fn native_regs(raw: RawContext) -> UnwindRegsNative {
            UnwindRegsNative::new(raw.pc, raw.sp, raw.fp)
        }
    }
}

thread_local! {
    static THREAD_STACK: Cell<Option<(u64, u64)>> = const { Cell::new(None) };
}

/// Returns `(bottom, top)` of the current thread's stack. Cached per thread,
/// because for the main thread this has to parse /proc/self/maps.
fn current_thread_stack() -> Result<(u64, u64), CaptureError> {
    if let Some(range) = THREAD_STACK.with(Cell::get) {
        return Ok(range);
    }
    let range = query_thread_stack()?;
    THREAD_STACK.with(|cell| cell.set(Some(range)));
    Ok(range)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn query_thread_stack() -> Result<(u64, u64), CaptureError> {
            unsafe {
                let mut attr: libc::pthread_attr_t = std::mem::zeroed();
                let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
                if rc != 0 {
                    return Err(CaptureError::StackBounds(std::io::Error::from_raw_os_error(rc)));
                }
                let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
                let mut stack_size: libc::size_t = 0;
                let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
                libc::pthread_attr_destroy(&mut attr);
                if rc != 0 {
                    return Err(CaptureError::StackBounds(std::io::Error::from_raw_os_error(rc)));
                }
                let bottom = stack_addr as u64;
                Ok((bottom, bottom + stack_size as u64))
            }
        }
    } else {
        fn query_thread_stack() -> Result<(u64, u64), CaptureError> {
            Err(CaptureError::UnsupportedPlatform)
        }
    }
}

/// Captures the execution context of the function this macro is expanded in.
///
/// The registers are read by inline assembly placed directly in the calling
/// function, so the context describes that function and none of this crate's.
/// It evaluates to `Result<ExecutionContext, CaptureError>`.
///
/// ```
/// let ctx = funcstack::capture_context!();
/// # let _ = ctx;
/// ```
#[macro_export]
macro_rules! capture_context {
    () => {{
        let raw = $crate::__capture_registers!();
        // SAFETY: `raw` holds the registers of the function this expands in.
        unsafe { $crate::ExecutionContext::from_raw(raw) }
    }};
}

#[cfg(target_arch = "x86_64")]
#[doc(hidden)]
#[macro_export]
macro_rules! __capture_registers {
    () => {{
        let pc: u64;
        let sp: u64;
        let fp: u64;
        unsafe {
            ::core::arch::asm!(
                "lea {pc}, [rip]",
                "mov {sp}, rsp",
                "mov {fp}, rbp",
                pc = out(reg) pc,
                sp = out(reg) sp,
                fp = out(reg) fp,
                options(nomem, nostack, preserves_flags),
            );
        }
        $crate::RawContext { pc, sp, fp, lr: 0 }
    }};
}

#[cfg(target_arch = "aarch64")]
#[doc(hidden)]
#[macro_export]
macro_rules! __capture_registers {
    () => {{
        let pc: u64;
        let sp: u64;
        let fp: u64;
        let lr: u64;
        unsafe {
            ::core::arch::asm!(
                "adr {pc}, .",
                "mov {sp}, sp",
                "mov {fp}, x29",
                "mov {lr}, x30",
                pc = out(reg) pc,
                sp = out(reg) sp,
                fp = out(reg) fp,
                lr = out(reg) lr,
                options(nomem, nostack, preserves_flags),
            );
        }
        $crate::RawContext { pc, sp, fp, lr }
    }};
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[doc(hidden)]
#[macro_export]
macro_rules! __capture_registers {
    () => {
        $crate::RawContext::default()
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_u64_bounds() {
        let words: Vec<u64> = vec![11, 22, 33, 44];
        let low = words.as_ptr() as u64;
        let stack = unsafe { StackBounds::new(low, low + 32) };
        assert_eq!(stack.read_u64(low), Ok(11));
        assert_eq!(stack.read_u64(low + 24), Ok(44));
        assert_eq!(stack.read_u64(low + 32), Err(()));
        assert_eq!(stack.read_u64(low - 8), Err(()));
        assert_eq!(stack.read_u64(low + 4), Err(()));
        assert_eq!(stack.read_u64(u64::MAX - 7), Err(()));
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_capture_context() {
        let ctx = crate::capture_context!().unwrap();
        let stack = ctx.stack_bounds();
        assert_eq!(stack.low(), ctx.regs().sp());
        assert!(stack.high() > stack.low());
        let local = 5u64;
        assert!(stack.contains(&local as *const u64 as u64));
        assert_ne!(ctx.code_address().address(), 0);
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_stack_pointer_outside_thread_stack_is_rejected() {
        let raw = RawContext {
            pc: 0x1000,
            sp: 0x1000,
            fp: 0x1008,
            lr: 0,
        };
        let err = unsafe { ExecutionContext::from_raw(raw) }.unwrap_err();
        assert!(
            matches!(err, CaptureError::StackPointerOutsideStack { sp: 0x1000, .. }),
            "{:?}",
            err
        );

        let raw = RawContext {
            sp: u64::MAX - 7,
            ..raw
        };
        let err = unsafe { ExecutionContext::from_raw(raw) }.unwrap_err();
        assert!(matches!(err, CaptureError::StackPointerOutsideStack { .. }));

        let raw = RawContext { sp: 0, ..raw };
        let err = unsafe { ExecutionContext::from_raw(raw) }.unwrap_err();
        assert!(matches!(err, CaptureError::ZeroStackPointer));
    }
}
