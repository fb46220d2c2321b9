use gimli::{AArch64, CfaRule, RegisterRule, UnwindTableRow};
use tracing::trace;

use crate::{
    arch::ArchAarch64, rules::UnwindRuleAarch64, unwind_result::UnwindResult,
    unwindregs::UnwindRegsAarch64,
};

use super::{ConversionError, DwarfUnwinderError, DwarfUnwinding};

impl DwarfUnwinding for ArchAarch64 {
    fn unwind_frame<F>(
        unwind_info: &UnwindTableRow<usize>,
        is_first_frame: bool,
        regs: &mut UnwindRegsAarch64,
        read_stack: &mut F,
    ) -> Result<UnwindResult<UnwindRuleAarch64>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        unwind_with_rules(
            unwind_info.cfa(),
            &unwind_info.register(AArch64::X29),
            &unwind_info.register(AArch64::X30),
            is_first_frame,
            regs,
            read_stack,
        )
    }
}

fn unwind_with_rules<F>(
    cfa_rule: &CfaRule<usize>,
    fp_rule: &RegisterRule<usize>,
    lr_rule: &RegisterRule<usize>,
    is_first_frame: bool,
    regs: &mut UnwindRegsAarch64,
    read_stack: &mut F,
) -> Result<UnwindResult<UnwindRuleAarch64>, DwarfUnwinderError>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    // gimli reports "no rule" and DW_CFA_undefined alike as Undefined. With
    // no rule for x30, the return address is still in lr, which is only
    // possible in the frame the walk starts in. Further out, every frame is
    // stopped at a call and has saved lr, so Undefined there marks an entry
    // point such as _start or a thread start routine.
    let lr_in_register = matches!(lr_rule, RegisterRule::Undefined);
    if lr_in_register && !is_first_frame {
        return Ok(UnwindResult::Uncacheable(None));
    }

    if !lr_in_register {
        match translate_into_unwind_rule(cfa_rule, fp_rule, lr_rule) {
            Ok(unwind_rule) => return Ok(UnwindResult::ExecRule(unwind_rule)),
            Err(err) => trace!("Unwind rule translation failed: {}", err),
        }
    }

    let cfa = eval_cfa_rule(cfa_rule, regs).ok_or(DwarfUnwinderError::CouldNotRecoverCfa)?;
    if cfa < regs.sp() {
        return Err(DwarfUnwinderError::StackPointerMovedBackwards);
    }

    let fp = match fp_rule {
        RegisterRule::Undefined => regs.fp(),
        rule => eval_rule(rule, cfa, regs.fp(), regs, read_stack)
            .ok_or(DwarfUnwinderError::CouldNotRecoverFramePointer)?,
    };
    let lr = if lr_in_register {
        regs.lr()
    } else {
        eval_rule(lr_rule, cfa, regs.lr(), regs, read_stack)
            .ok_or(DwarfUnwinderError::CouldNotRecoverReturnAddress)?
    };
    if lr == 0 {
        return Ok(UnwindResult::Uncacheable(None));
    }

    regs.set_fp(fp);
    regs.set_sp(cfa);
    regs.return_to(lr);
    Ok(UnwindResult::Uncacheable(Some(regs.lr())))
}

fn register_rule_to_cfa_offset(rule: &RegisterRule<usize>) -> Result<Option<i64>, ConversionError> {
    match *rule {
        RegisterRule::Undefined | RegisterRule::SameValue => Ok(None),
        RegisterRule::Offset(offset) => Ok(Some(offset)),
        _ => Err(ConversionError::RegisterNotStoredRelativeToCfa),
    }
}

fn storage_offset_by_8(cfa_offset: i64, register_offset: i64) -> Result<i16, ConversionError> {
    let offset = cfa_offset + register_offset;
    if offset % 8 != 0 {
        return Err(ConversionError::StorageOffsetDoesNotFit);
    }
    i16::try_from(offset / 8).map_err(|_| ConversionError::StorageOffsetDoesNotFit)
}

fn translate_into_unwind_rule(
    cfa_rule: &CfaRule<usize>,
    fp_rule: &RegisterRule<usize>,
    lr_rule: &RegisterRule<usize>,
) -> Result<UnwindRuleAarch64, ConversionError> {
    let lr_cfa_offset = register_rule_to_cfa_offset(lr_rule)?
        .ok_or(ConversionError::ReturnAddressRuleWasWeird)?;

    match cfa_rule {
        CfaRule::RegisterAndOffset { register, offset } => match *register {
            AArch64::SP => {
                if offset % 16 != 0 {
                    return Err(ConversionError::CfaOffsetIsMisaligned);
                }
                let sp_offset_by_16 =
                    u16::try_from(offset / 16).map_err(|_| ConversionError::SpOffsetDoesNotFit)?;
                let lr_storage_offset_from_sp_by_8 = storage_offset_by_8(*offset, lr_cfa_offset)?;
                match register_rule_to_cfa_offset(fp_rule)? {
                    None => Ok(UnwindRuleAarch64::OffsetSpAndRestoreLr {
                        sp_offset_by_16,
                        lr_storage_offset_from_sp_by_8,
                    }),
                    Some(fp_cfa_offset) => Ok(UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
                        sp_offset_by_16,
                        fp_storage_offset_from_sp_by_8: storage_offset_by_8(
                            *offset,
                            fp_cfa_offset,
                        )?,
                        lr_storage_offset_from_sp_by_8,
                    }),
                }
            }
            AArch64::X29 => Err(ConversionError::CfaIsFramePointerBased),
            _ => Err(ConversionError::CfaIsOffsetFromUnknownRegister),
        },
        CfaRule::Expression(_) => Err(ConversionError::CfaIsExpression),
    }
}

fn eval_cfa_rule(rule: &CfaRule<usize>, regs: &UnwindRegsAarch64) -> Option<u64> {
    match rule {
        CfaRule::RegisterAndOffset { register, offset } => {
            let val = match *register {
                AArch64::SP => regs.sp(),
                AArch64::X29 => regs.fp(),
                AArch64::X30 => regs.lr(),
                _ => return None,
            };
            val.checked_add_signed(*offset)
        }
        CfaRule::Expression(_) => None,
    }
}

fn eval_rule<F>(
    rule: &RegisterRule<usize>,
    cfa: u64,
    val: u64,
    regs: &UnwindRegsAarch64,
    read_stack: &mut F,
) -> Option<u64>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    match *rule {
        RegisterRule::Undefined => None,
        RegisterRule::SameValue => Some(val),
        RegisterRule::Offset(offset) => read_stack(cfa.checked_add_signed(offset)?).ok(),
        RegisterRule::ValOffset(offset) => cfa.checked_add_signed(offset),
        RegisterRule::Register(register) => match register {
            AArch64::SP => Some(regs.sp()),
            AArch64::X29 => Some(regs.fp()),
            AArch64::X30 => Some(regs.lr()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_translate_frame_record() {
        // stp x29, x30, [sp, #-0x30]!
        let cfa = CfaRule::RegisterAndOffset {
            register: AArch64::SP,
            offset: 48,
        };
        let rule = translate_into_unwind_rule(
            &cfa,
            &RegisterRule::Offset(-48),
            &RegisterRule::Offset(-40),
        );
        assert_eq!(
            rule,
            Ok(UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
                sp_offset_by_16: 3,
                fp_storage_offset_from_sp_by_8: 0,
                lr_storage_offset_from_sp_by_8: 1,
            })
        );
    }

    #[test]
    fn test_translate_lr_in_register() {
        let cfa = CfaRule::RegisterAndOffset {
            register: AArch64::SP,
            offset: 0,
        };
        let rule =
            translate_into_unwind_rule(&cfa, &RegisterRule::Undefined, &RegisterRule::SameValue);
        assert_eq!(rule, Err(ConversionError::ReturnAddressRuleWasWeird));
    }

    #[test]
    fn test_lr_without_rule_in_first_frame() {
        // Leaf function before its prologue: cfa = sp, lr and fp untouched.
        let cfa = CfaRule::RegisterAndOffset {
            register: AArch64::SP,
            offset: 0,
        };
        let mut read_stack = |_: u64| -> Result<u64, ()> { Err(()) };
        let mut regs = UnwindRegsAarch64::new(0x100400, 0x100300, 0x80, 0x90);
        let res = unwind_with_rules(
            &cfa,
            &RegisterRule::Undefined,
            &RegisterRule::Undefined,
            true,
            &mut regs,
            &mut read_stack,
        );
        assert_eq!(res, Ok(UnwindResult::Uncacheable(Some(0x100300))));
        assert_eq!(regs.pc(), 0x100300);
        assert_eq!(regs.sp(), 0x80);
        assert_eq!(regs.fp(), 0x90);
    }

    #[test]
    fn test_lr_without_rule_in_caller_is_outermost() {
        let cfa = CfaRule::RegisterAndOffset {
            register: AArch64::SP,
            offset: 0,
        };
        let mut read_stack = |_: u64| -> Result<u64, ()> { Err(()) };
        let mut regs = UnwindRegsAarch64::new(0x100400, 0x100300, 0x80, 0x90);
        let res = unwind_with_rules(
            &cfa,
            &RegisterRule::Undefined,
            &RegisterRule::Undefined,
            false,
            &mut regs,
            &mut read_stack,
        );
        assert_eq!(res, Ok(UnwindResult::Uncacheable(None)));
        assert_eq!(regs, UnwindRegsAarch64::new(0x100400, 0x100300, 0x80, 0x90));
    }

    #[test]
    fn test_translate_fp_based_cfa() {
        let cfa = CfaRule::RegisterAndOffset {
            register: AArch64::X29,
            offset: 16,
        };
        let rule = translate_into_unwind_rule(
            &cfa,
            &RegisterRule::Offset(-16),
            &RegisterRule::Offset(-8),
        );
        assert_eq!(rule, Err(ConversionError::CfaIsFramePointerBased));
    }
}
