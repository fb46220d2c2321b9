use crate::{
    rule_cache::{CacheStats, RuleCache},
    rules::UnwindRule,
};

/// The unwinder cache. During unwinding, the unwinder needs exclusive access
/// to this cache.
///
/// It stores unwind rules for addresses it has seen before, and it stores the
/// unwind context which gimli needs for DWARF CFI evaluation. Each cursor owns
/// one, so no state is shared between walks.
pub struct Cache<R: UnwindRule> {
    pub(crate) gimli_unwind_context: Box<gimli::UnwindContext<usize>>,
    pub(crate) rule_cache: RuleCache<R>,
}

impl<R: UnwindRule> Cache<R> {
    pub fn new() -> Self {
        Self {
            gimli_unwind_context: Box::new(gimli::UnwindContext::new()),
            rule_cache: RuleCache::new(),
        }
    }

    /// Returns a snapshot with cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.rule_cache.stats()
    }
}

impl<R: UnwindRule> Default for Cache<R> {
    fn default() -> Self {
        Self::new()
    }
}
