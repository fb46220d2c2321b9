use crate::{error::Error, rules::UnwindRule};

const CACHE_ENTRY_COUNT: usize = 509;

/// A small direct-mapped cache from lookup address to unwind rule.
///
/// Deep recursion goes through the same few return addresses over and over,
/// so a hit here skips the FDE lookup and CFI evaluation entirely.
pub struct RuleCache<R: UnwindRule> {
    entries: Box<[Option<CacheEntry<R>>; CACHE_ENTRY_COUNT]>,
    stats: CacheStats,
}

impl<R: UnwindRule> RuleCache<R> {
    pub fn new() -> Self {
        Self {
            entries: Box::new([None; CACHE_ENTRY_COUNT]),
            stats: CacheStats::default(),
        }
    }

    pub fn try_unwind<F>(
        &mut self,
        address: u64,
        regs: &mut R::UnwindRegs,
        read_stack: &mut F,
    ) -> CacheResult
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let slot = (address % CACHE_ENTRY_COUNT as u64) as u16;
        if let Some(entry) = &self.entries[slot as usize] {
            if entry.address == address {
                self.stats.hits += 1;
                return CacheResult::Hit(entry.unwind_rule.exec(regs, read_stack));
            }
        }
        self.stats.misses += 1;
        CacheResult::Miss(CacheHandle { slot, address })
    }

    pub fn insert(&mut self, handle: CacheHandle, unwind_rule: R) {
        let CacheHandle { slot, address } = handle;
        self.entries[slot as usize] = Some(CacheEntry {
            address,
            unwind_rule,
        });
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl<R: UnwindRule> Default for RuleCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

pub enum CacheResult {
    Miss(CacheHandle),
    Hit(Result<Option<u64>, Error>),
}

pub struct CacheHandle {
    slot: u16,
    address: u64,
}

#[derive(Clone, Copy, Debug)]
struct CacheEntry<R: UnwindRule> {
    address: u64,
    unwind_rule: R,
}

/// Statistics about the rule cache of one walk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}
