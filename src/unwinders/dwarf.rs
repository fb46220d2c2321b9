mod aarch64;
mod x86_64;

use std::marker::PhantomData;

use gimli::{
    BaseAddresses, EhFrame, EhFrameHdr, NativeEndian, UnwindContext, UnwindSection,
    UnwindTableRow,
};

use crate::{arch::Arch, unwind_result::UnwindResult, unwinder::SectionAddresses};

/// Evaluates DWARF call frame information for one module, using the
/// `.eh_frame_hdr` binary search table to find the FDE for an address.
pub struct DwarfUnwinder<'a, A: DwarfUnwinding> {
    eh_frame_hdr_data: &'a [u8],
    eh_frame_data: &'a [u8],
    unwind_context: &'a mut UnwindContext<usize>,
    bases: BaseAddresses,
    _arch: PhantomData<A>,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfUnwinderError {
    #[error("Could not parse the .eh_frame_hdr section: {0}")]
    EhFrameHdrParseFailed(#[source] gimli::Error),

    #[error("The .eh_frame_hdr section has no binary search table")]
    NoEhFrameHdrTable,

    #[error("Could not find the FDE for the requested address: {0}")]
    FdeFromAddressFailed(#[source] gimli::Error),

    #[error("Could not find DWARF unwind info for the requested address: {0}")]
    UnwindInfoForAddressFailed(#[source] gimli::Error),

    #[error("Stack pointer moved backwards")]
    StackPointerMovedBackwards,

    #[error("Could not recover the CFA")]
    CouldNotRecoverCfa,

    #[error("Could not recover the return address")]
    CouldNotRecoverReturnAddress,

    #[error("Could not recover the frame pointer")]
    CouldNotRecoverFramePointer,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionError {
    #[error("CFA is defined by an expression")]
    CfaIsExpression,

    #[error("CFA is an offset from an unhandled register")]
    CfaIsOffsetFromUnknownRegister,

    #[error("CFA offset is not a multiple of the stack alignment")]
    CfaOffsetIsMisaligned,

    #[error("The stack pointer offset does not fit into the compact rule")]
    SpOffsetDoesNotFit,

    #[error("The register storage offset does not fit into the compact rule")]
    StorageOffsetDoesNotFit,

    #[error("A register is not stored at an offset from the CFA")]
    RegisterNotStoredRelativeToCfa,

    #[error("The return address rule is unusual")]
    ReturnAddressRuleWasWeird,

    #[error("The return address rule has an unexpected offset")]
    ReturnAddressRuleWithUnexpectedOffset,

    #[error("The CFA is derived from the frame pointer")]
    CfaIsFramePointerBased,
}

/// The architecture-specific part of DWARF unwinding: turning an unwind table
/// row into new register values.
///
/// `is_first_frame` is set for the frame the walk starts in, which may be
/// stopped anywhere in its function, including before its prologue.
pub trait DwarfUnwinding: Arch {
    fn unwind_frame<F>(
        unwind_info: &UnwindTableRow<usize>,
        is_first_frame: bool,
        regs: &mut Self::UnwindRegs,
        read_stack: &mut F,
    ) -> Result<UnwindResult<Self::UnwindRule>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>;
}

impl<'a, A: DwarfUnwinding> DwarfUnwinder<'a, A> {
    pub fn new(
        eh_frame_hdr_data: &'a [u8],
        eh_frame_data: &'a [u8],
        unwind_context: &'a mut UnwindContext<usize>,
        sections: &SectionAddresses,
    ) -> Self {
        Self {
            eh_frame_hdr_data,
            eh_frame_data,
            unwind_context,
            bases: BaseAddresses::default()
                .set_eh_frame_hdr(sections.eh_frame_hdr)
                .set_eh_frame(sections.eh_frame)
                .set_text(sections.text),
            _arch: PhantomData,
        }
    }

    pub fn unwind_frame<F>(
        &mut self,
        lookup_address: u64,
        is_first_frame: bool,
        regs: &mut A::UnwindRegs,
        read_stack: &mut F,
    ) -> Result<UnwindResult<A::UnwindRule>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let eh_frame_hdr = EhFrameHdr::new(self.eh_frame_hdr_data, NativeEndian);
        let parsed_hdr = eh_frame_hdr
            .parse(&self.bases, 8)
            .map_err(DwarfUnwinderError::EhFrameHdrParseFailed)?;
        let table = parsed_hdr
            .table()
            .ok_or(DwarfUnwinderError::NoEhFrameHdrTable)?;

        let mut eh_frame = EhFrame::new(self.eh_frame_data, NativeEndian);
        eh_frame.set_address_size(8);

        let fde = table
            .fde_for_address(&eh_frame, &self.bases, lookup_address, |section, bases, offset| {
                section.cie_from_offset(bases, offset)
            })
            .map_err(DwarfUnwinderError::FdeFromAddressFailed)?;
        let unwind_info = fde
            .unwind_info_for_address(&eh_frame, &self.bases, self.unwind_context, lookup_address)
            .map_err(DwarfUnwinderError::UnwindInfoForAddressFailed)?;
        A::unwind_frame(unwind_info, is_first_frame, regs, read_stack)
    }
}
