use std::fmt;

use super::{HexNum, UnwindRegs};

/// The x86_64 registers needed to walk a stack: the instruction pointer, the
/// stack pointer (rsp) and the frame pointer (rbp).
///
/// `ip` is the address execution resumes at in the current frame. For the
/// first frame it comes from the captured context, for every other frame it is
/// a return address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegsX86_64 {
    ip: u64,
    sp: u64,
    bp: u64,
}

impl UnwindRegsX86_64 {
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        Self { ip, sp, bp }
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn bp(&self) -> u64 {
        self.bp
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.ip = ip;
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.sp = sp;
    }

    /// rbp is callee-saved, so a frame that never touches it leaves the
    /// caller's value in place. Rules that do not restore it skip this call.
    pub fn set_bp(&mut self, bp: u64) {
        self.bp = bp;
    }
}

impl UnwindRegs for UnwindRegsX86_64 {
    fn sp(&self) -> u64 {
        self.sp
    }
}

impl fmt::Debug for UnwindRegsX86_64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwindRegsX86_64")
            .field("ip", &HexNum(self.ip))
            .field("sp", &HexNum(self.sp))
            .field("bp", &HexNum(self.bp))
            .finish()
    }
}
