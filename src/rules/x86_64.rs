use super::UnwindRule;
use crate::error::Error;
use crate::unwindregs::UnwindRegsX86_64;

/// For all of these: return address is *(new_sp - 8)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindRuleX86_64 {
    /// (sp, bp) = (sp + 8, bp)
    JustReturn,
    /// (sp, bp) = (sp + 8x, bp)
    OffsetSp { sp_offset_by_8: u16 },
    /// (sp, bp) = (sp + 8x, *(sp + 8y))
    OffsetSpAndRestoreBp {
        sp_offset_by_8: u16,
        bp_storage_offset_from_sp_by_8: i16,
    },
    /// (sp, bp) = (bp + 16, *bp)
    UseFramePointer,
}

impl UnwindRule for UnwindRuleX86_64 {
    type UnwindRegs = UnwindRegsX86_64;

    fn fallback_rule() -> Self {
        UnwindRuleX86_64::UseFramePointer
    }

    fn exec<F>(self, regs: &mut UnwindRegsX86_64, read_stack: &mut F) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let sp = regs.sp();
        let (new_sp, new_bp) = match self {
            UnwindRuleX86_64::JustReturn => {
                (sp.checked_add(8).ok_or(Error::IntegerOverflow)?, regs.bp())
            }
            UnwindRuleX86_64::OffsetSp { sp_offset_by_8 } => (
                sp.checked_add(sp_offset_by_8 as u64 * 8)
                    .ok_or(Error::IntegerOverflow)?,
                regs.bp(),
            ),
            UnwindRuleX86_64::OffsetSpAndRestoreBp {
                sp_offset_by_8,
                bp_storage_offset_from_sp_by_8,
            } => {
                let new_sp = sp
                    .checked_add(sp_offset_by_8 as u64 * 8)
                    .ok_or(Error::IntegerOverflow)?;
                let bp_location = sp
                    .checked_add_signed(bp_storage_offset_from_sp_by_8 as i64 * 8)
                    .ok_or(Error::IntegerOverflow)?;
                let new_bp =
                    read_stack(bp_location).map_err(|_| Error::CouldNotReadStack(bp_location))?;
                (new_sp, new_bp)
            }
            UnwindRuleX86_64::UseFramePointer => {
                // Do a frame pointer stack walk. Code that is compiled with frame pointers
                // has the following function prologues and epilogues:
                //
                // Function prologue:
                // pushq  %rbp
                // movq   %rsp, %rbp
                //
                // Function epilogue:
                // popq   %rbp
                // ret
                //
                // So: *rbp is the caller's frame pointer, and *(rbp + 8) is the return address.
                // The entry points clear rbp, so a zero frame pointer ends the chain.
                let bp = regs.bp();
                if bp == 0 {
                    return Ok(None);
                }
                let new_sp = bp.checked_add(16).ok_or(Error::IntegerOverflow)?;
                let new_bp = read_stack(bp).map_err(|_| Error::CouldNotReadStack(bp))?;
                if new_bp == 0 {
                    return Ok(None);
                }
                if new_bp <= bp || new_sp <= sp {
                    return Err(Error::FramepointerUnwindingMovedBackwards);
                }
                (new_sp, new_bp)
            }
        };
        let return_address_location = new_sp.checked_sub(8).ok_or(Error::IntegerOverflow)?;
        let return_address = read_stack(return_address_location)
            .map_err(|_| Error::CouldNotReadStack(return_address_location))?;
        if return_address == 0 {
            return Ok(None);
        }
        regs.set_ip(return_address);
        regs.set_sp(new_sp);
        regs.set_bp(new_bp);
        Ok(Some(return_address))
    }
}
