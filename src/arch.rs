use crate::rules::{UnwindRule, UnwindRuleAarch64, UnwindRuleX86_64};
use crate::unwindregs::{UnwindRegs, UnwindRegsAarch64, UnwindRegsX86_64};

/// Ties together the register set and the cached rule type of one CPU
/// architecture. The walker and the unwinder are generic over this.
pub trait Arch {
    type UnwindRegs: UnwindRegs;
    type UnwindRule: UnwindRule<UnwindRegs = Self::UnwindRegs>;
}

/// Linux on 64-bit ARM: pc, lr, sp and fp (x29).
pub struct ArchAarch64;

/// Linux on x86_64: rip, rsp and rbp.
pub struct ArchX86_64;

impl Arch for ArchAarch64 {
    type UnwindRegs = UnwindRegsAarch64;
    type UnwindRule = UnwindRuleAarch64;
}

impl Arch for ArchX86_64 {
    type UnwindRegs = UnwindRegsX86_64;
    type UnwindRule = UnwindRuleX86_64;
}
