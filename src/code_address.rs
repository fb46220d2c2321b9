/// A code address reached during unwinding.
///
/// The first address of a walk is where the capturing function was executing.
/// Every address after it is a return address, pointing at the instruction
/// *after* a call. Looking up unwind
/// info or symbols for them has to use `address - 1`, otherwise a call in
/// tail position of a function would be attributed to the next function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeAddress {
    InstructionPointer(u64),
    ReturnAddress(u64),
}

impl CodeAddress {
    pub fn address(self) -> u64 {
        match self {
            CodeAddress::InstructionPointer(address) => address,
            CodeAddress::ReturnAddress(address) => address,
        }
    }

    pub fn address_for_lookup(self) -> u64 {
        match self {
            CodeAddress::InstructionPointer(address) => address,
            CodeAddress::ReturnAddress(address) => address.saturating_sub(1),
        }
    }
}
