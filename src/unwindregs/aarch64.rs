use std::fmt;

use super::{HexNum, UnwindRegs};

/// With pointer authentication enabled, return addresses saved on the stack
/// carry a signature in their high bits. Linux user space addresses fit in 48
/// bits, so everything above that is stripped.
const PTR_MASK: u64 = (1 << 48) - 1;

pub fn strip_ptr_auth(ptr: u64) -> u64 {
    ptr & PTR_MASK
}

/// The aarch64 registers needed to walk a stack: pc, the link register (x30),
/// sp and the frame pointer (x29). All values are stored with pointer
/// authentication bits stripped.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegsAarch64 {
    pc: u64,
    lr: u64,
    sp: u64,
    fp: u64,
}

impl UnwindRegsAarch64 {
    pub fn new(pc: u64, lr: u64, sp: u64, fp: u64) -> Self {
        Self {
            pc: strip_ptr_auth(pc),
            lr: strip_ptr_auth(lr),
            sp: strip_ptr_auth(sp),
            fp: strip_ptr_auth(fp),
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn lr(&self) -> u64 {
        self.lr
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn fp(&self) -> u64 {
        self.fp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.sp = strip_ptr_auth(sp);
    }

    pub fn set_fp(&mut self, fp: u64) {
        self.fp = strip_ptr_auth(fp);
    }

    /// Moves to the caller: the restored link register is both the new lr and
    /// the address execution resumes at.
    pub fn return_to(&mut self, lr: u64) {
        self.lr = strip_ptr_auth(lr);
        self.pc = self.lr;
    }
}

impl UnwindRegs for UnwindRegsAarch64 {
    fn sp(&self) -> u64 {
        self.sp
    }
}

impl fmt::Debug for UnwindRegsAarch64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwindRegsAarch64")
            .field("pc", &HexNum(self.pc))
            .field("lr", &HexNum(self.lr))
            .field("sp", &HexNum(self.sp))
            .field("fp", &HexNum(self.fp))
            .finish()
    }
}
