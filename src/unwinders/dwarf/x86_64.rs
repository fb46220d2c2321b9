use gimli::{CfaRule, RegisterRule, UnwindTableRow, X86_64};
use tracing::trace;

use crate::{
    arch::ArchX86_64, rules::UnwindRuleX86_64, unwind_result::UnwindResult,
    unwindregs::UnwindRegsX86_64,
};

use super::{ConversionError, DwarfUnwinderError, DwarfUnwinding};

impl DwarfUnwinding for ArchX86_64 {
    fn unwind_frame<F>(
        unwind_info: &UnwindTableRow<usize>,
        _is_first_frame: bool,
        regs: &mut UnwindRegsX86_64,
        read_stack: &mut F,
    ) -> Result<UnwindResult<UnwindRuleX86_64>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let cfa_rule = unwind_info.cfa();
        let bp_rule = unwind_info.register(X86_64::RBP);
        let ra_rule = unwind_info.register(X86_64::RA);

        // The CIE puts the return address at CFA - 8 from the first
        // instruction on, so an undefined rule comes from DW_CFA_undefined and
        // marks the outermost frame, e.g. _start or the thread entry point.
        if let RegisterRule::Undefined = ra_rule {
            return Ok(UnwindResult::Uncacheable(None));
        }

        match translate_into_unwind_rule(cfa_rule, &bp_rule, &ra_rule) {
            Ok(unwind_rule) => return Ok(UnwindResult::ExecRule(unwind_rule)),
            Err(err) => trace!("Unwind rule translation failed: {}", err),
        }

        let cfa = eval_cfa_rule(cfa_rule, regs).ok_or(DwarfUnwinderError::CouldNotRecoverCfa)?;
        if cfa <= regs.sp() {
            return Err(DwarfUnwinderError::StackPointerMovedBackwards);
        }

        let bp = match bp_rule {
            // rbp is callee-saved; no rule means it was left alone.
            RegisterRule::Undefined => regs.bp(),
            rule => eval_rule(&rule, cfa, regs.bp(), regs, read_stack)
                .ok_or(DwarfUnwinderError::CouldNotRecoverFramePointer)?,
        };
        let return_address = eval_rule(&ra_rule, cfa, regs.ip(), regs, read_stack)
            .ok_or(DwarfUnwinderError::CouldNotRecoverReturnAddress)?;
        if return_address == 0 {
            return Ok(UnwindResult::Uncacheable(None));
        }

        regs.set_ip(return_address);
        regs.set_sp(cfa);
        regs.set_bp(bp);
        Ok(UnwindResult::Uncacheable(Some(return_address)))
    }
}

fn register_rule_to_cfa_offset(rule: &RegisterRule<usize>) -> Result<Option<i64>, ConversionError> {
    match *rule {
        RegisterRule::Undefined | RegisterRule::SameValue => Ok(None),
        RegisterRule::Offset(offset) => Ok(Some(offset)),
        _ => Err(ConversionError::RegisterNotStoredRelativeToCfa),
    }
}

fn translate_into_unwind_rule(
    cfa_rule: &CfaRule<usize>,
    bp_rule: &RegisterRule<usize>,
    ra_rule: &RegisterRule<usize>,
) -> Result<UnwindRuleX86_64, ConversionError> {
    match ra_rule {
        RegisterRule::Offset(-8) => {}
        RegisterRule::Offset(_) => return Err(ConversionError::ReturnAddressRuleWithUnexpectedOffset),
        _ => return Err(ConversionError::ReturnAddressRuleWasWeird),
    }

    match cfa_rule {
        CfaRule::RegisterAndOffset { register, offset } => match *register {
            X86_64::RSP => {
                if offset % 8 != 0 {
                    return Err(ConversionError::CfaOffsetIsMisaligned);
                }
                let sp_offset_by_8 =
                    u16::try_from(offset / 8).map_err(|_| ConversionError::SpOffsetDoesNotFit)?;
                match register_rule_to_cfa_offset(bp_rule)? {
                    None if sp_offset_by_8 == 1 => Ok(UnwindRuleX86_64::JustReturn),
                    None => Ok(UnwindRuleX86_64::OffsetSp { sp_offset_by_8 }),
                    Some(bp_cfa_offset) => {
                        let bp_storage_offset_from_sp_by_8 =
                            i16::try_from((offset + bp_cfa_offset) / 8)
                                .map_err(|_| ConversionError::StorageOffsetDoesNotFit)?;
                        Ok(UnwindRuleX86_64::OffsetSpAndRestoreBp {
                            sp_offset_by_8,
                            bp_storage_offset_from_sp_by_8,
                        })
                    }
                }
            }
            // rbp-based frames take the slow path. The compact frame pointer rule
            // treats a zero saved rbp as the end of the chain, which is only right
            // for heuristic walks.
            X86_64::RBP => Err(ConversionError::CfaIsFramePointerBased),
            _ => Err(ConversionError::CfaIsOffsetFromUnknownRegister),
        },
        CfaRule::Expression(_) => Err(ConversionError::CfaIsExpression),
    }
}

fn eval_cfa_rule(rule: &CfaRule<usize>, regs: &UnwindRegsX86_64) -> Option<u64> {
    match rule {
        CfaRule::RegisterAndOffset { register, offset } => {
            let val = match *register {
                X86_64::RSP => regs.sp(),
                X86_64::RBP => regs.bp(),
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
    regs: &UnwindRegsX86_64,
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
            X86_64::RSP => Some(regs.sp()),
            X86_64::RBP => Some(regs.bp()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_translate_push_rbp_prologue() {
        let cfa = CfaRule::RegisterAndOffset {
            register: X86_64::RSP,
            offset: 16,
        };
        let rule = translate_into_unwind_rule(
            &cfa,
            &RegisterRule::Offset(-16),
            &RegisterRule::Offset(-8),
        );
        assert_eq!(
            rule,
            Ok(UnwindRuleX86_64::OffsetSpAndRestoreBp {
                sp_offset_by_8: 2,
                bp_storage_offset_from_sp_by_8: 0
            })
        );
    }

    #[test]
    fn test_translate_function_entry() {
        let cfa = CfaRule::RegisterAndOffset {
            register: X86_64::RSP,
            offset: 8,
        };
        let rule =
            translate_into_unwind_rule(&cfa, &RegisterRule::Undefined, &RegisterRule::Offset(-8));
        assert_eq!(rule, Ok(UnwindRuleX86_64::JustReturn));
    }

    #[test]
    fn test_rbp_based_cfa_takes_slow_path() {
        let cfa = CfaRule::RegisterAndOffset {
            register: X86_64::RBP,
            offset: 16,
        };
        let rule = translate_into_unwind_rule(
            &cfa,
            &RegisterRule::Offset(-16),
            &RegisterRule::Offset(-8),
        );
        assert_eq!(rule, Err(ConversionError::CfaIsFramePointerBased));

        // Saved rbp of zero is a regular value here, not the end of the stack.
        let stack = [0, 0, 0x0, 0x100200];
        let mut read_stack = |addr| stack.get((addr / 8) as usize).copied().ok_or(());
        let regs = UnwindRegsX86_64::new(0x100400, 0x8, 0x10);
        let cfa = eval_cfa_rule(&cfa, &regs).unwrap();
        assert_eq!(cfa, 0x20);
        assert_eq!(
            eval_rule(&RegisterRule::Offset(-16), cfa, regs.bp(), &regs, &mut read_stack),
            Some(0)
        );
        assert_eq!(
            eval_rule(&RegisterRule::Offset(-8), cfa, regs.ip(), &regs, &mut read_stack),
            Some(0x100200)
        );
    }
}
