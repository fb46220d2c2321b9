//! Per-architecture unwind rules, compact enough to cache per address.

mod aarch64;
mod unwind_rule;
mod x86_64;

pub use aarch64::UnwindRuleAarch64;
pub use unwind_rule::UnwindRule;
pub use x86_64::UnwindRuleX86_64;
