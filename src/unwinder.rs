use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Deref, Range};

use gimli::UnwindContext;
use tracing::{debug, trace};

use crate::arch::{Arch, ArchAarch64, ArchX86_64};
use crate::cache::Cache;
use crate::code_address::CodeAddress;
use crate::error::{Error, UnwinderError};
use crate::rule_cache::CacheResult;
use crate::rules::UnwindRule;
use crate::unwind_result::UnwindResult;
use crate::unwinders::{DwarfUnwinder, DwarfUnwinderError, DwarfUnwinding};

/// Unwinds one frame at a time, using the unwind data of the module that
/// contains the frame's code address.
///
/// Addresses outside all known modules, and addresses whose module has no
/// usable unwind info for them, are unwound by following the frame pointer.
pub struct Unwinder<D: Deref<Target = [u8]>, A: Arch> {
    /// sorted by address_range.start
    modules: Vec<Module<D>>,
    _arch: PhantomData<A>,
}

pub type UnwinderX86_64<D> = Unwinder<D, ArchX86_64>;
pub type UnwinderAarch64<D> = Unwinder<D, ArchAarch64>;

impl<D: Deref<Target = [u8]>, A: Arch> Default for Unwinder<D, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Deref<Target = [u8]>, A: Arch> Unwinder<D, A> {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            _arch: PhantomData,
        }
    }

    pub fn add_module(&mut self, module: Module<D>) {
        let insertion_index = match self
            .modules
            .binary_search_by_key(&module.address_range.start, |module| {
                module.address_range.start
            }) {
            Ok(i) => {
                debug!(
                    "Two modules at the same start address 0x{:x}: {} and {}",
                    module.address_range.start, self.modules[i].name, module.name
                );
                i
            }
            Err(i) => i,
        };
        self.modules.insert(insertion_index, module);
    }

    pub fn modules(&self) -> &[Module<D>] {
        &self.modules
    }

    pub fn find_module_for_address(&self, address: u64) -> Option<&Module<D>> {
        let module_index = match self
            .modules
            .binary_search_by_key(&address, |m| m.address_range.start)
        {
            Ok(i) => i,
            Err(insertion_index) => {
                if insertion_index == 0 {
                    // address is before first known module
                    return None;
                }
                let i = insertion_index - 1;
                if self.modules[i].address_range.end <= address {
                    // address is after this module
                    return None;
                }
                i
            }
        };
        Some(&self.modules[module_index])
    }
}

impl<D: Deref<Target = [u8]>, A: DwarfUnwinding> Unwinder<D, A> {
    /// Moves `regs` from the frame executing at `address` to its caller.
    ///
    /// Returns the caller's return address, or `None` if this was the
    /// outermost frame. On error, `regs` are unchanged.
    pub fn unwind_frame<F>(
        &self,
        address: CodeAddress,
        regs: &mut A::UnwindRegs,
        cache: &mut Cache<A::UnwindRule>,
        read_stack: &mut F,
    ) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let lookup_address = address.address_for_lookup();
        let cache_handle = match cache.rule_cache.try_unwind(lookup_address, regs, read_stack) {
            CacheResult::Hit(result) => return result,
            CacheResult::Miss(handle) => handle,
        };

        let unwind_result = match self.find_module_for_address(lookup_address) {
            Some(module) => {
                match module.unwind_frame::<A, F>(
                    lookup_address,
                    matches!(address, CodeAddress::InstructionPointer(_)),
                    regs,
                    &mut cache.gimli_unwind_context,
                    read_stack,
                ) {
                    Ok(unwind_result) => unwind_result,
                    Err(err) => {
                        debug!(
                            "Falling back to frame pointers at {} + 0x{:x}: {}",
                            module.name,
                            lookup_address.wrapping_sub(module.base_address),
                            err
                        );
                        UnwindResult::ExecRule(A::UnwindRule::fallback_rule())
                    }
                }
            }
            None => {
                trace!("No module for address 0x{:x}", lookup_address);
                UnwindResult::ExecRule(A::UnwindRule::fallback_rule())
            }
        };

        match unwind_result {
            UnwindResult::ExecRule(rule) => {
                cache.rule_cache.insert(cache_handle, rule);
                rule.exec(regs, read_stack)
            }
            UnwindResult::Uncacheable(return_address) => Ok(return_address),
        }
    }
}

pub enum UnwindData<D: Deref<Target = [u8]>> {
    /// The `.eh_frame_hdr` binary search table, and the `.eh_frame` section it indexes.
    EhFrameHdrAndEhFrame(D, D),
    None,
}

/// A loaded object: the main executable, a shared library, or the vDSO.
pub struct Module<D: Deref<Target = [u8]>> {
    name: String,
    address_range: Range<u64>,
    base_address: u64,
    sections: SectionAddresses,
    unwind_data: UnwindData<D>,
}

/// Runtime addresses of the sections that DWARF pointer encodings are relative to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionAddresses {
    pub text: u64,
    pub eh_frame: u64,
    pub eh_frame_hdr: u64,
}

impl<D: Deref<Target = [u8]>> Debug for Module<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("address_range", &self.address_range)
            .finish()
    }
}

impl<D: Deref<Target = [u8]>> Module<D> {
    pub fn new(
        name: String,
        address_range: Range<u64>,
        base_address: u64,
        sections: SectionAddresses,
        unwind_data: UnwindData<D>,
    ) -> Self {
        Self {
            name,
            address_range,
            base_address,
            sections,
            unwind_data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_range(&self) -> Range<u64> {
        self.address_range.clone()
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn has_unwind_data(&self) -> bool {
        !matches!(self.unwind_data, UnwindData::None)
    }

    fn unwind_frame<A, F>(
        &self,
        lookup_address: u64,
        is_first_frame: bool,
        regs: &mut A::UnwindRegs,
        unwind_context: &mut UnwindContext<usize>,
        read_stack: &mut F,
    ) -> Result<UnwindResult<A::UnwindRule>, UnwinderError>
    where
        A: DwarfUnwinding,
        F: FnMut(u64) -> Result<u64, ()>,
    {
        match &self.unwind_data {
            UnwindData::EhFrameHdrAndEhFrame(eh_frame_hdr, eh_frame) => {
                let mut unwinder = DwarfUnwinder::<A>::new(
                    &eh_frame_hdr[..],
                    &eh_frame[..],
                    unwind_context,
                    &self.sections,
                );
                match unwinder.unwind_frame(lookup_address, is_first_frame, regs, read_stack) {
                    Ok(unwind_result) => Ok(unwind_result),
                    Err(DwarfUnwinderError::FdeFromAddressFailed(_)) => {
                        Err(UnwinderError::EhFrameHdrCouldNotFindAddress)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            UnwindData::None => Err(UnwinderError::NoModuleUnwindData),
        }
    }
}
