//! Mapping code addresses to function names.

use std::borrow::Cow;
use std::ffi::CStr;
use std::sync::OnceLock;

use object::{Object, ObjectSymbol, SymbolKind};
use tracing::{debug, trace};

use crate::modules::{loaded_objects, LoadedObject};

/// The name reported for addresses no symbol covers.
pub const UNKNOWN_SYMBOL: &str = "unknown";

/// A symbol found for an address: its name and start address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolRef<'a> {
    pub name: Cow<'a, str>,
    pub address: u64,
}

/// The symbol resolution of one code address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    /// Distance from the symbol's start address. Zero for unknown addresses.
    pub offset: u64,
    /// Start address of the symbol, `None` if no symbol covers the address.
    pub symbol_address: Option<u64>,
}

impl Resolution {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_SYMBOL.to_string(),
            offset: 0,
            symbol_address: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.symbol_address.is_none()
    }
}

/// A source of symbols for code addresses.
pub trait SymbolTable {
    /// Finds the symbol with the highest start address at or below `address`.
    fn lookup(&self, address: u64) -> Option<SymbolRef<'_>>;

    /// Resolves `address` to a display name and offset. Never fails: addresses
    /// without a symbol resolve to `"unknown"` with offset zero.
    fn resolve(&self, address: u64) -> Resolution {
        match self.lookup(address) {
            Some(symbol) => Resolution {
                offset: address.saturating_sub(symbol.address),
                name: demangle(&symbol.name),
                symbol_address: Some(symbol.address),
            },
            None => Resolution::unknown(),
        }
    }
}

/// Demangles Rust symbol names, returning other names unchanged.
pub fn demangle(name: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(name))
}

/// A sorted list of `(start address, name)` pairs.
#[derive(Clone, Debug, Default)]
pub struct SymbolList {
    symbols: Vec<(u64, String)>,
}

impl SymbolList {
    pub fn new(mut symbols: Vec<(u64, String)>) -> Self {
        symbols.sort_by_key(|(address, _)| *address);
        symbols.dedup_by_key(|(address, _)| *address);
        Self { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Loads the function symbols of `object`, at their runtime addresses.
    /// Falls back to the dynamic symbol table if the file is stripped.
    fn load(object: &LoadedObject) -> Option<Self> {
        let path = object.path()?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                debug!("Could not read {}: {}", path.display(), err);
                return None;
            }
        };
        let file = match object::File::parse(&*data) {
            Ok(file) => file,
            Err(err) => {
                debug!("Could not parse {}: {}", path.display(), err);
                return None;
            }
        };
        let mut symbols = text_symbols(file.symbols(), object.bias);
        if symbols.is_empty() {
            symbols = text_symbols(file.dynamic_symbols(), object.bias);
        }
        trace!(
            "Loaded {} symbols from {}",
            symbols.len(),
            object.display_name()
        );
        Some(Self::new(symbols))
    }
}

fn text_symbols<'data, S: ObjectSymbol<'data>>(
    symbols: impl Iterator<Item = S>,
    bias: u64,
) -> Vec<(u64, String)> {
    symbols
        .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.address() != 0)
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            Some((symbol.address().wrapping_add(bias), name.to_string()))
        })
        .collect()
}

impl SymbolTable for SymbolList {
    fn lookup(&self, address: u64) -> Option<SymbolRef<'_>> {
        let index = self
            .symbols
            .partition_point(|(start, _)| *start <= address)
            .checked_sub(1)?;
        let (start, name) = &self.symbols[index];
        Some(SymbolRef {
            name: Cow::Borrowed(name),
            address: *start,
        })
    }
}

struct ObjectSymbols {
    object: LoadedObject,
    symbols: OnceLock<Option<SymbolList>>,
}

/// Symbols of all objects loaded into this process.
///
/// Each object's symbol table is read from its file on first use. Addresses
/// whose object has no readable symbols are resolved by the dynamic loader.
pub struct ProcessSymbols {
    objects: Vec<ObjectSymbols>,
}

impl ProcessSymbols {
    pub fn new() -> Self {
        let objects = loaded_objects()
            .into_iter()
            .map(|object| ObjectSymbols {
                object,
                symbols: OnceLock::new(),
            })
            .collect();
        Self { objects }
    }

    /// The symbols of the objects loaded when this function is first called.
    pub fn get() -> &'static ProcessSymbols {
        static SYMBOLS: OnceLock<ProcessSymbols> = OnceLock::new();
        SYMBOLS.get_or_init(ProcessSymbols::new)
    }

    fn object_symbols(&self, address: u64) -> Option<&SymbolList> {
        let entry = self
            .objects
            .iter()
            .find(|entry| entry.object.contains(address))?;
        entry
            .symbols
            .get_or_init(|| SymbolList::load(&entry.object))
            .as_ref()
    }
}

impl Default for ProcessSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable for ProcessSymbols {
    fn lookup(&self, address: u64) -> Option<SymbolRef<'_>> {
        if let Some(symbol) = self
            .object_symbols(address)
            .and_then(|symbols| symbols.lookup(address))
        {
            return Some(symbol);
        }
        dladdr_lookup(address)
    }
}

/// Asks the dynamic loader for the exported symbol covering `address`.
fn dladdr_lookup(address: u64) -> Option<SymbolRef<'static>> {
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(address as *const libc::c_void, &mut info) == 0 {
            return None;
        }
        if info.dli_sname.is_null() || info.dli_saddr.is_null() {
            return None;
        }
        let name = CStr::from_ptr(info.dli_sname).to_string_lossy().into_owned();
        Some(SymbolRef {
            name: Cow::Owned(name),
            address: info.dli_saddr as u64,
        })
    }
}
