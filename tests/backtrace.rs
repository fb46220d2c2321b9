use std::hint::black_box;

use fallible_iterator::FallibleIterator;
use funcstack::*;

mod common;

#[inline(never)]
fn level_d() -> Backtrace {
    let backtrace = capture_backtrace().unwrap();
    black_box(backtrace)
}

#[inline(never)]
fn level_c() -> Backtrace {
    black_box(level_d())
}

#[inline(never)]
fn level_b() -> Backtrace {
    black_box(level_c())
}

#[inline(never)]
fn level_a() -> Backtrace {
    black_box(level_b())
}

#[test]
#[inline(never)]
fn test_four_level_chain_order() {
    let backtrace = black_box(level_a());
    common::assert_order(&backtrace, &["level_d", "level_c", "level_b", "level_a"]);
    common::assert_order(&backtrace, &["level_a", "test_four_level_chain_order"]);
    assert!(backtrace.is_complete(), "{:?}", backtrace.termination());
}

#[test]
fn test_capturing_function_is_excluded() {
    let backtrace = black_box(level_a());
    assert!(
        backtrace.frames()[0].name.ends_with("level_d"),
        "first frame should be the caller of capture_backtrace:\n{}",
        backtrace
    );
    assert_eq!(common::position_of(&backtrace, "capture_backtrace"), None);
}

#[inline(never)]
fn recurse(depth: usize) -> Backtrace {
    if depth <= 1 {
        return black_box(capture_backtrace().unwrap());
    }
    black_box(recurse(black_box(depth - 1)))
}

#[test]
fn test_deep_recursion_terminates() {
    let backtrace = black_box(recurse(200));
    assert!(backtrace.len() <= WalkOptions::default().max_frames);
    assert_eq!(common::count_of(&backtrace, "recurse"), 200);
    assert_ne!(
        backtrace.termination(),
        Termination::Failed(Error::IterationCapReached(256))
    );
}

#[test]
fn test_recursion_beyond_cap_is_partial() {
    let backtrace = black_box(recurse(300));
    assert_eq!(backtrace.len(), 256);
    assert_eq!(common::count_of(&backtrace, "recurse"), 256);
    assert_eq!(
        backtrace.termination(),
        Termination::Failed(Error::IterationCapReached(256))
    );
    assert!(!backtrace.is_complete());
}

#[inline(never)]
fn capture_here() -> Backtrace {
    black_box(capture_backtrace().unwrap())
}

#[inline(never)]
fn capture_twice() -> (Backtrace, Backtrace) {
    let first = black_box(capture_here());
    let second = black_box(capture_here());
    (first, second)
}

fn names(backtrace: &Backtrace) -> Vec<&str> {
    backtrace.frames().iter().map(|frame| frame.name.as_str()).collect()
}

#[test]
fn test_captures_from_one_call_site_are_identical() {
    let (first, second) = black_box(capture_twice());
    assert!(!first.is_empty());
    assert_eq!(names(&first), names(&second));
    // Both captures sit at the same spot in `capture_here`. The callers'
    // return addresses differ, since `capture_twice` calls it twice.
    assert_eq!(first.frames()[0], second.frames()[0]);
    assert!(first.frames()[0].name.ends_with("capture_here"));
    assert_eq!(first.termination(), second.termination());
}

#[inline(never)]
fn func1() -> String {
    let backtrace = capture_backtrace().unwrap();
    black_box(backtrace.to_string())
}

#[inline(never)]
fn func2() -> String {
    black_box(func1())
}

#[test]
#[inline(never)]
fn test_func2_func1_report() {
    let report = black_box(func2());
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines[0], HEADER);
    assert!(lines[1].starts_with("Func: ") && lines[1].ends_with("func1"), "{}", report);
    assert!(lines[2].starts_with("Func: ") && lines[2].ends_with("func2"), "{}", report);
    assert!(lines[3].ends_with("test_func2_func1_report"), "{}", report);
    assert!(lines[1..].iter().all(|line| line.starts_with("Func: ")));
}

#[inline(never)]
fn func1_backtrace() -> Backtrace {
    black_box(capture_backtrace().unwrap())
}

#[inline(never)]
fn func2_backtrace() -> Backtrace {
    black_box(func1_backtrace())
}

#[test]
fn test_func2_func1_walk_is_complete() {
    let backtrace = black_box(func2_backtrace());
    common::assert_order(&backtrace, &["func1_backtrace", "func2_backtrace"]);
    assert!(backtrace.is_complete(), "{:?}", backtrace.termination());
    assert_eq!(backtrace.termination(), Termination::Exhausted);
}

#[test]
fn test_last_frame_has_no_successor() {
    let walker = StackWalker::new();
    let ctx = capture_context!().unwrap();
    let mut cursor = walker.init_cursor(&ctx);
    let mut last = None;
    loop {
        match cursor.step() {
            StepResult::Advanced => last = Some(cursor.address()),
            StepResult::Exhausted => break,
            StepResult::Failed(err) => panic!("walk failed after {:?}: {}", last, err),
        }
    }
    assert!(last.is_some());
    assert_eq!(cursor.address(), last.unwrap());
    assert_eq!(cursor.step(), StepResult::Exhausted);
    assert_eq!(cursor.steps(), walker.walk(&ctx).len());
    black_box(&ctx);
}

#[test]
fn test_offsets_point_into_functions() {
    let backtrace = black_box(level_a());
    let frame = &backtrace.frames()[0];
    assert!(frame.offset > 0);
    let report = backtrace
        .display(ReportOptions::default().show_offsets(true))
        .to_string();
    let expected = format!("Func: {}+0x{:x}", frame.name, frame.offset);
    assert_eq!(report.lines().nth(1), Some(expected.as_str()));
}

#[test]
fn test_custom_symbol_table() {
    let symbols = SymbolList::default();
    let walker = StackWalker::with_symbols(&symbols);
    let ctx = capture_context!().unwrap();
    let backtrace = walker.walk(&ctx);
    assert!(!backtrace.is_empty());
    assert!(backtrace
        .frames()
        .iter()
        .all(|frame| frame.name == UNKNOWN_SYMBOL && frame.offset == 0));
    black_box(&backtrace);
}

#[test]
fn test_cursor_matches_frames() {
    let walker = StackWalker::new();
    let ctx = capture_context!().unwrap();
    let mut cursor = walker.init_cursor(&ctx);
    let mut addresses = Vec::new();
    while let Ok(Some(address)) = cursor.next() {
        addresses.push(address.address());
    }
    let frames: Vec<u64> = walker.frames(&ctx).map(|frame| frame.address).collect();
    assert!(!frames.is_empty());
    assert_eq!(addresses, frames);
    black_box(&ctx);
}

#[test]
fn test_concurrent_captures() {
    let handles: Vec<_> = (0..4)
        .map(|_| std::thread::spawn(|| black_box(level_a())))
        .collect();
    for handle in handles {
        let backtrace = handle.join().unwrap();
        common::assert_order(&backtrace, &["level_d", "level_c", "level_b", "level_a"]);
    }
}

#[test]
fn test_print_backtrace_does_not_panic() {
    print_backtrace();
    print_backtrace_with(ReportOptions::default().show_offsets(true).name_width(16));
}
