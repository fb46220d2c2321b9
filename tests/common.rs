use funcstack::Backtrace;

/// Index of the first frame whose name ends with `suffix`. Rust names are
/// demangled to full paths, so tests match on the last path component.
pub fn position_of(backtrace: &Backtrace, suffix: &str) -> Option<usize> {
    backtrace
        .frames()
        .iter()
        .position(|frame| frame.name.ends_with(suffix))
}

pub fn count_of(backtrace: &Backtrace, suffix: &str) -> usize {
    backtrace
        .frames()
        .iter()
        .filter(|frame| frame.name.ends_with(suffix))
        .count()
}

/// Asserts that frames ending in `suffixes` appear in this order, innermost first.
pub fn assert_order(backtrace: &Backtrace, suffixes: &[&str]) {
    let positions: Vec<usize> = suffixes
        .iter()
        .map(|suffix| {
            position_of(backtrace, suffix)
                .unwrap_or_else(|| panic!("no frame for {} in\n{}", suffix, backtrace))
        })
        .collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "frames out of order: {:?} in\n{}",
        positions,
        backtrace
    );
}
