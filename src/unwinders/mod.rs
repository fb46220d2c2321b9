mod dwarf;

pub use dwarf::*;
