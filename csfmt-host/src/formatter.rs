//! The formatting seam.
//!
//! The host treats the actual format engine as an opaque dependency behind
//! the [`Formatter`] trait. [`TextFormatter`] is the built-in engine: a
//! conservative whitespace normaliser that keeps the bridge useful without a
//! full layout engine.

use csfmt_protocol::{Diagnostic, FormatOptions, Severity};
use std::ops::Range;
use thiserror::Error;

/// Errors a format engine can raise.
///
/// These are catastrophic failures; malformed input is reported through
/// diagnostics on a successful outcome instead.
#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("formatter failed: {0}")]
    Failed(String),
}

/// What one format invocation produced.
#[derive(Debug, Clone)]
pub struct FormatOutcome {
    /// Full document text after formatting (range edits already spliced in).
    pub formatted: String,
    /// Parse diagnostics from the engine.
    pub diagnostics: Vec<Diagnostic>,
}

/// A format engine.
pub trait Formatter: Send {
    /// Formats `content`, restricted to the validated byte `range` when
    /// present. The returned text is always the full document.
    fn format(
        &mut self,
        content: &str,
        range: Option<Range<usize>>,
        options: &FormatOptions,
    ) -> Result<FormatOutcome, FormatterError>;

    /// Drops internal workspaces/caches. Called by the memory guard before it
    /// re-samples the working set.
    fn reclaim(&mut self) {}
}

/// The built-in whitespace formatter.
///
/// Trims trailing whitespace, normalises leading indentation to the
/// requested tab style, and reports unbalanced braces as parse diagnostics.
#[derive(Debug, Default)]
pub struct TextFormatter;

impl TextFormatter {
    pub fn new() -> Self {
        Self
    }

    fn format_slice(slice: &str, options: &FormatOptions) -> String {
        let tab_width = options.tab_width.max(1) as usize;
        let mut out = String::with_capacity(slice.len());

        let mut rest = slice;
        loop {
            let (line, terminator, remaining) = split_line(rest);
            out.push_str(&normalize_line(line, tab_width, options.use_tabs));
            out.push_str(terminator);
            match remaining {
                Some(r) => rest = r,
                None => break,
            }
        }
        out
    }

    fn brace_diagnostics(slice: &str, offset: usize) -> Vec<Diagnostic> {
        let mut depth: i64 = 0;
        let mut first_unmatched_close = None;
        for (i, b) in slice.bytes().enumerate() {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth < 0 && first_unmatched_close.is_none() {
                        first_unmatched_close = Some(offset + i);
                        depth = 0;
                    }
                }
                _ => {}
            }
        }

        let mut diagnostics = Vec::new();
        if let Some(at) = first_unmatched_close {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                message: "Unmatched closing brace.".to_string(),
                start: Some(at),
                end: Some(at + 1),
            });
        }
        if depth > 0 {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                message: format!("{depth} unclosed brace(s) at end of input."),
                start: None,
                end: None,
            });
        }
        diagnostics
    }
}

impl Formatter for TextFormatter {
    fn format(
        &mut self,
        content: &str,
        range: Option<Range<usize>>,
        options: &FormatOptions,
    ) -> Result<FormatOutcome, FormatterError> {
        let (start, end) = match range {
            Some(r) => (r.start, r.end),
            None => (0, content.len()),
        };

        let slice = &content[start..end];
        let formatted_slice = Self::format_slice(slice, options);
        let diagnostics = Self::brace_diagnostics(slice, start);

        let mut formatted = String::with_capacity(
            content.len() - slice.len() + formatted_slice.len(),
        );
        formatted.push_str(&content[..start]);
        formatted.push_str(&formatted_slice);
        formatted.push_str(&content[end..]);

        Ok(FormatOutcome {
            formatted,
            diagnostics,
        })
    }
}

/// Splits off the first line, returning `(line, terminator, rest)` where
/// `rest` is `None` after the final line.
fn split_line(text: &str) -> (&str, &str, Option<&str>) {
    match text.find('\n') {
        Some(pos) => {
            let (line, rest) = text.split_at(pos);
            let (line, terminator) = match line.strip_suffix('\r') {
                Some(stripped) => (stripped, "\r\n"),
                None => (line, "\n"),
            };
            (line, terminator, Some(&rest[1..]))
        }
        None => (text, "", None),
    }
}

/// Trims trailing whitespace and rewrites leading indentation in the
/// requested tab style.
fn normalize_line(line: &str, tab_width: usize, use_tabs: bool) -> String {
    let trimmed = line.trim_end();
    let body = trimmed.trim_start();
    if body.is_empty() {
        return String::new();
    }

    let leading = &trimmed[..trimmed.len() - body.len()];
    let columns: usize = leading
        .chars()
        .map(|c| if c == '\t' { tab_width } else { 1 })
        .sum();

    let mut out = String::with_capacity(columns + body.len());
    if use_tabs {
        out.extend(std::iter::repeat('\t').take(columns / tab_width));
        out.extend(std::iter::repeat(' ').take(columns % tab_width));
    } else {
        out.extend(std::iter::repeat(' ').take(columns));
    }
    out.push_str(body);
    out
}
