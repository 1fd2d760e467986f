//! Streaming output matchers.
//!
//! A matcher consumes job output as arbitrarily fragmented byte chunks and
//! renders it to the output sink. Line-oriented matchers hold back the
//! trailing, not yet newline-terminated fragment between feeds so that
//! classification always sees whole lines.
//!
//! | Kind        | Behaviour                                               | Exit code            |
//! |-------------|---------------------------------------------------------|----------------------|
//! | `raw`       | every chunk written through immediately                 | 0                    |
//! | `lines`     | complete lines written, fragment buffered               | 0                    |
//! | `unity`     | Unity test output colorized, summary block tracked      | 1 if any `:FAIL`     |
//! | `exit-code` | lines written until the separator, trailer is the code  | trailer, else -1     |

use std::io::{self, Write};

use console::Style;
use memchr::memmem;

/// Line that opens the Unity summary block.
pub const SUMMARY_SEPARATOR: &[u8] = b"-----------------------";

/// Exit code reported when the gateway never sent one.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

const FAIL_MARKER: &[u8] = b":FAIL";
const PASS_MARKER: &[u8] = b":PASS";
const INFO_MARKER: &[u8] = b":INFO";

/// Stateful renderer for one session's output.
pub trait OutputMatcher: Send {
    /// Consume one chunk. Never blocks on anything but the sink itself.
    fn feed(&mut self, out: &mut dyn Write, chunk: &[u8]) -> io::Result<()>;

    /// Called exactly once when the session ends, however it ends.
    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.flush()
    }

    fn exit_code(&self) -> i32 {
        0
    }
}

/// Matcher selection, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MatcherKind {
    #[default]
    Raw,
    Lines,
    Unity,
    ExitCode,
}

/// Options shared by all matcher kinds.
#[derive(Debug, Clone, Default)]
pub struct MatcherOptions {
    /// Emit ANSI colors (Unity only).
    pub colorize: bool,
    /// Line that precedes the exit-code trailer (exit-code only).
    pub separator: Option<Vec<u8>>,
}

impl MatcherKind {
    pub fn build(self, options: &MatcherOptions) -> Box<dyn OutputMatcher> {
        match self {
            MatcherKind::Raw => Box::new(RawMatcher),
            MatcherKind::Lines => Box::new(LineMatcher::default()),
            MatcherKind::Unity => Box::new(UnityMatcher::new(options.colorize)),
            MatcherKind::ExitCode => Box::new(ExitCodeMatcher::new(options.separator.clone())),
        }
    }
}

/// Holds the fragment after the last newline between feeds.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and hand every completed line (without `\n`) to `on_line`.
    fn push(
        &mut self,
        chunk: &[u8],
        mut on_line: impl FnMut(&[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut rest = chunk;
        while let Some(pos) = memchr::memchr(b'\n', rest) {
            if self.pending.is_empty() {
                on_line(&rest[..pos])?;
            } else {
                self.pending.extend_from_slice(&rest[..pos]);
                let line = std::mem::take(&mut self.pending);
                on_line(&line)?;
            }
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        Ok(())
    }
}

/// Write `line` followed by a newline, styled when it is printable text.
/// Bytes that are not valid UTF-8 are echoed unmodified.
fn write_line(out: &mut dyn Write, line: &[u8], style: Option<&Style>) -> io::Result<()> {
    match (std::str::from_utf8(line), style) {
        (Ok(text), Some(style)) => writeln!(out, "{}", style.apply_to(text)),
        _ => {
            out.write_all(line)?;
            out.write_all(b"\n")
        }
    }
}

/// Passthrough.
#[derive(Debug, Default)]
pub struct RawMatcher;

impl OutputMatcher for RawMatcher {
    fn feed(&mut self, out: &mut dyn Write, chunk: &[u8]) -> io::Result<()> {
        out.write_all(chunk)
    }
}

/// Writes complete lines only.
#[derive(Debug, Default)]
pub struct LineMatcher {
    lines: LineBuffer,
}

impl OutputMatcher for LineMatcher {
    fn feed(&mut self, out: &mut dyn Write, chunk: &[u8]) -> io::Result<()> {
        self.lines.push(chunk, |line| write_line(out, line, None))
    }
}

/// Classifier for Unity test-framework output.
#[derive(Debug)]
pub struct UnityMatcher {
    lines: LineBuffer,
    in_summary: bool,
    has_failure: bool,
    pass: Style,
    fail: Style,
    info: Style,
}

impl UnityMatcher {
    pub fn new(colorize: bool) -> Self {
        Self {
            lines: LineBuffer::default(),
            in_summary: false,
            has_failure: false,
            pass: Style::new().green().force_styling(colorize),
            fail: Style::new().red().force_styling(colorize),
            info: Style::new().yellow().force_styling(colorize),
        }
    }

    pub fn in_summary(&self) -> bool {
        self.in_summary
    }

    pub fn has_failure(&self) -> bool {
        self.has_failure
    }
}

impl OutputMatcher for UnityMatcher {
    fn feed(&mut self, out: &mut dyn Write, chunk: &[u8]) -> io::Result<()> {
        let Self {
            lines,
            in_summary,
            has_failure,
            pass,
            fail,
            info,
        } = self;

        lines.push(chunk, |line| {
            if line == SUMMARY_SEPARATOR {
                *in_summary = true;
                return write_line(out, line, None);
            }
            let style = if *in_summary {
                Some(if *has_failure { &*fail } else { &*pass })
            } else if memmem::find(line, FAIL_MARKER).is_some() {
                *has_failure = true;
                Some(&*fail)
            } else if memmem::find(line, PASS_MARKER).is_some() {
                Some(&*pass)
            } else if memmem::find(line, INFO_MARKER).is_some() {
                Some(&*info)
            } else {
                None
            };
            write_line(out, line, style)
        })
    }

    fn exit_code(&self) -> i32 {
        i32::from(self.has_failure)
    }
}

/// Passes output through until a separator line, then reads the remaining
/// bytes as the remote process' exit code.
#[derive(Debug)]
pub struct ExitCodeMatcher {
    lines: LineBuffer,
    separator: Option<Vec<u8>>,
    trailer: Option<Vec<u8>>,
}

impl ExitCodeMatcher {
    pub fn new(separator: Option<Vec<u8>>) -> Self {
        Self {
            lines: LineBuffer::default(),
            separator,
            trailer: None,
        }
    }
}

impl OutputMatcher for ExitCodeMatcher {
    fn feed(&mut self, out: &mut dyn Write, chunk: &[u8]) -> io::Result<()> {
        if let Some(trailer) = &mut self.trailer {
            trailer.extend_from_slice(chunk);
            return Ok(());
        }
        let Some(separator) = self.separator.as_deref() else {
            return out.write_all(chunk);
        };

        let mut rest = chunk;
        while let Some(pos) = memchr::memchr(b'\n', rest) {
            let (line_tail, after) = (&rest[..pos], &rest[pos + 1..]);
            let mut line = std::mem::take(&mut self.lines.pending);
            line.extend_from_slice(line_tail);
            if line == separator {
                self.trailer = Some(after.to_vec());
                return Ok(());
            }
            write_line(out, &line, None)?;
            rest = after;
        }
        self.lines.pending.extend_from_slice(rest);
        Ok(())
    }

    fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if self.trailer.is_none() && !self.lines.pending.is_empty() {
            out.write_all(&std::mem::take(&mut self.lines.pending))?;
        }
        out.flush()
    }

    fn exit_code(&self) -> i32 {
        self.trailer
            .as_deref()
            .and_then(|t| std::str::from_utf8(t).ok())
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(EXIT_CODE_UNKNOWN)
    }
}
