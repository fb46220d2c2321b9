use std::fmt;
use std::io::Write;

use crate::error::Error;

/// The first line of every printed backtrace.
pub const HEADER: &str = "---------backstrace---------";

/// One resolved frame of a backtrace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// The demangled function name, or `"unknown"`.
    pub name: String,
    /// Byte offset of `address` from the start of the function.
    pub offset: u64,
    /// The return address into this frame's function.
    pub address: u64,
}

/// Why a walk stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The outermost frame was reached; the backtrace is complete.
    Exhausted,
    /// Unwinding failed; the backtrace holds the frames found before the failure.
    Failed(Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<Frame>,
    termination: Termination,
}

impl Backtrace {
    pub fn new(frames: Vec<Frame>, termination: Termination) -> Self {
        Self {
            frames,
            termination,
        }
    }

    /// Frames, innermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn termination(&self) -> Termination {
        self.termination
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Exhausted
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn display(&self, options: ReportOptions) -> DisplayBacktrace<'_> {
        DisplayBacktrace {
            backtrace: self,
            options,
        }
    }

    /// Writes the report to stdout. Write errors are ignored.
    pub fn print(&self, options: ReportOptions) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = write!(out, "{}", self.display(options));
        let _ = out.flush();
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.display(ReportOptions::default()), f)
    }
}

/// Prints only the header line, for captures that failed.
pub(crate) fn print_header() {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{}", HEADER);
    let _ = out.flush();
}

/// How frames are rendered in a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportOptions {
    /// Names longer than this many characters are cut off.
    pub name_width: usize,
    /// Append `+0x<offset>` to every name.
    pub show_offsets: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            name_width: 127,
            show_offsets: false,
        }
    }
}

impl ReportOptions {
    pub fn name_width(mut self, name_width: usize) -> Self {
        self.name_width = name_width;
        self
    }

    pub fn show_offsets(mut self, show_offsets: bool) -> Self {
        self.show_offsets = show_offsets;
        self
    }
}

pub struct DisplayBacktrace<'a> {
    backtrace: &'a Backtrace,
    options: ReportOptions,
}

impl fmt::Display for DisplayBacktrace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", HEADER)?;
        for frame in &self.backtrace.frames {
            let name = truncate(&frame.name, self.options.name_width);
            if self.options.show_offsets {
                writeln!(f, "Func: {}+0x{:x}", name, frame.offset)?;
            } else {
                writeln!(f, "Func: {}", name)?;
            }
        }
        Ok(())
    }
}

fn truncate(name: &str, width: usize) -> &str {
    match name.char_indices().nth(width) {
        Some((index, _)) => &name[..index],
        None => name,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(name: &str, offset: u64) -> Frame {
        Frame {
            name: name.to_string(),
            offset,
            address: 0x1000 + offset,
        }
    }

    #[test]
    fn test_legacy_format() {
        let backtrace = Backtrace::new(
            vec![frame("func1", 0x13), frame("func2", 0x9), frame("main", 0x20)],
            Termination::Exhausted,
        );
        assert_eq!(
            backtrace.to_string(),
            "---------backstrace---------\nFunc: func1\nFunc: func2\nFunc: main\n"
        );
        assert!(backtrace.is_complete());
    }

    #[test]
    fn test_offsets() {
        let backtrace = Backtrace::new(
            vec![frame("func1", 0x13), frame("unknown", 0)],
            Termination::Failed(Error::DidNotAdvance),
        );
        let report = backtrace
            .display(ReportOptions::default().show_offsets(true))
            .to_string();
        assert_eq!(
            report,
            "---------backstrace---------\nFunc: func1+0x13\nFunc: unknown+0x0\n"
        );
        assert!(!backtrace.is_complete());
    }

    #[test]
    fn test_truncation() {
        let long_name = "x".repeat(300);
        let backtrace = Backtrace::new(vec![frame(&long_name, 0)], Termination::Exhausted);
        let report = backtrace.to_string();
        let line = report.lines().nth(1).unwrap();
        assert_eq!(line.len(), "Func: ".len() + 127);
        // The frame keeps the full name.
        assert_eq!(backtrace.frames()[0].name.len(), 300);

        assert_eq!(truncate("äöü", 2), "äö");
        assert_eq!(truncate("abc", 0), "");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_empty_backtrace() {
        let backtrace = Backtrace::new(Vec::new(), Termination::Exhausted);
        assert_eq!(backtrace.to_string(), format!("{}\n", HEADER));
        assert!(backtrace.is_empty());
    }
}
