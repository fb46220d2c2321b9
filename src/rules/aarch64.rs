use super::UnwindRule;
use crate::error::Error;
use crate::unwindregs::UnwindRegsAarch64;

/// Every rule restores lr from the stack; the restored lr is the return address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindRuleAarch64 {
    /// (sp, fp, lr) = (sp + 16x, fp, *(sp + 8y))
    OffsetSpAndRestoreLr {
        sp_offset_by_16: u16,
        lr_storage_offset_from_sp_by_8: i16,
    },
    /// (sp, fp, lr) = (sp + 16x, *(sp + 8y), *(sp + 8z))
    OffsetSpAndRestoreFpAndLr {
        sp_offset_by_16: u16,
        fp_storage_offset_from_sp_by_8: i16,
        lr_storage_offset_from_sp_by_8: i16,
    },
    /// (sp, fp, lr) = (fp + 16, *fp, *(fp + 8))
    UseFramePointer,
}

fn read_slot<F>(base: u64, offset_by_8: i16, read_stack: &mut F) -> Result<u64, Error>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    let location =
        base.checked_add_signed(offset_by_8 as i64 * 8).ok_or(Error::IntegerOverflow)?;
    read_stack(location).map_err(|_| Error::CouldNotReadStack(location))
}

impl UnwindRule for UnwindRuleAarch64 {
    type UnwindRegs = UnwindRegsAarch64;

    fn fallback_rule() -> Self {
        UnwindRuleAarch64::UseFramePointer
    }

    fn exec<F>(self, regs: &mut UnwindRegsAarch64, read_stack: &mut F) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let sp = regs.sp();
        let fp = regs.fp();
        let (new_sp, new_fp, new_lr) = match self {
            UnwindRuleAarch64::OffsetSpAndRestoreLr {
                sp_offset_by_16,
                lr_storage_offset_from_sp_by_8,
            } => {
                let new_sp = sp
                    .checked_add(sp_offset_by_16 as u64 * 16)
                    .ok_or(Error::IntegerOverflow)?;
                let new_lr = read_slot(sp, lr_storage_offset_from_sp_by_8, read_stack)?;
                (new_sp, fp, new_lr)
            }
            UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
                sp_offset_by_16,
                fp_storage_offset_from_sp_by_8,
                lr_storage_offset_from_sp_by_8,
            } => {
                let new_sp = sp
                    .checked_add(sp_offset_by_16 as u64 * 16)
                    .ok_or(Error::IntegerOverflow)?;
                let new_fp = read_slot(sp, fp_storage_offset_from_sp_by_8, read_stack)?;
                let new_lr = read_slot(sp, lr_storage_offset_from_sp_by_8, read_stack)?;
                (new_sp, new_fp, new_lr)
            }
            UnwindRuleAarch64::UseFramePointer => {
                // Frame-based arm64 functions store the caller's fp and lr next to each
                // other on the stack and then set fp to the address where the caller's fp
                // is stored:
                //
                // stp  fp, lr, [sp, #0x20]
                // add  fp, sp, #0x20
                //
                // So: *fp is the caller's frame pointer, and *(fp + 8) is the return address.
                if fp == 0 {
                    return Ok(None);
                }
                let new_sp = fp.checked_add(16).ok_or(Error::IntegerOverflow)?;
                let new_fp = read_slot(fp, 0, read_stack)?;
                let new_lr = read_slot(fp, 1, read_stack)?;
                if new_fp == 0 {
                    return Ok(None);
                }
                if new_fp <= fp || new_sp <= sp {
                    return Err(Error::FramepointerUnwindingMovedBackwards);
                }
                (new_sp, new_fp, new_lr)
            }
        };
        if new_lr == 0 {
            return Ok(None);
        }
        regs.set_sp(new_sp);
        regs.set_fp(new_fp);
        regs.return_to(new_lr);
        Ok(Some(regs.lr()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic() {
        let stack = [
            1, 2, 3, 4, 0x40, 0x100200, 5, 6, 0x70, 0x100100, 7, 8, 9, 10, 0x0, 0x0,
        ];
        let mut read_stack = |addr| Ok(stack[(addr / 8) as usize]);
        let mut regs = UnwindRegsAarch64::new(0x100300, 0x100300, 0x10, 0x20);
        let res = UnwindRuleAarch64::UseFramePointer.exec(&mut regs, &mut read_stack);
        assert_eq!(res, Ok(Some(0x100200)));
        assert_eq!(regs.sp(), 0x30);
        assert_eq!(regs.fp(), 0x40);
        assert_eq!(regs.pc(), 0x100200);
        let res = UnwindRuleAarch64::UseFramePointer.exec(&mut regs, &mut read_stack);
        assert_eq!(res, Ok(Some(0x100100)));
        assert_eq!(regs.sp(), 0x50);
        assert_eq!(regs.fp(), 0x70);
        let res = UnwindRuleAarch64::UseFramePointer.exec(&mut regs, &mut read_stack);
        assert_eq!(res, Ok(None));
    }

    #[test]
    fn test_offset_sp_and_restore_fp_and_lr() {
        // stp x29, x30, [sp, #-0x20]!: CFA=sp+32, fp at CFA-32, lr at CFA-24
        let stack = [0x60, 0x100800, 0, 0, 0];
        let mut read_stack = |addr| stack.get((addr / 8) as usize).copied().ok_or(());
        let mut regs = UnwindRegsAarch64::new(0x100900, 0x100900, 0x0, 0x0);
        let rule = UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
            sp_offset_by_16: 2,
            fp_storage_offset_from_sp_by_8: 0,
            lr_storage_offset_from_sp_by_8: 1,
        };
        assert_eq!(rule.exec(&mut regs, &mut read_stack), Ok(Some(0x100800)));
        assert_eq!(regs.sp(), 0x20);
        assert_eq!(regs.fp(), 0x60);
        assert_eq!(regs.lr(), 0x100800);
    }

    #[test]
    fn test_strip_ptr_auth() {
        let stack = [0, 0, 0x40, 0x002a_0000_0010_0200, 0, 0, 0, 0, 0x0, 0x0];
        let mut read_stack = |addr| stack.get((addr / 8) as usize).copied().ok_or(());
        let mut regs = UnwindRegsAarch64::new(0x100300, 0x100300, 0x8, 0x10);
        let res = UnwindRuleAarch64::UseFramePointer.exec(&mut regs, &mut read_stack);
        assert_eq!(res, Ok(Some(0x0000_0000_0010_0200)));
    }
}
