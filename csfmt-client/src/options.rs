//! Caller-facing option and range normalisation.
//!
//! Normalisation happens once, here, before a request is posted; the worker
//! and the host never re-derive defaults (the host only clamps defensively).

use csfmt_protocol::{EndOfLine, FormatOptions, TextRange};

/// Default print width.
pub const DEFAULT_PRINT_WIDTH: u32 = 80;

/// Default tab width for C# sources.
pub const DEFAULT_TAB_WIDTH: u32 = 4;

/// Caller-facing formatting settings; unset fields take defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatSettings {
    /// Desired line width. Fractions are truncated; values below 40 are
    /// raised to 40.
    pub print_width: Option<f64>,
    /// Spaces per indentation level, floored at 1.
    pub tab_width: Option<u32>,
    /// Indent with tabs instead of spaces.
    pub use_tabs: Option<bool>,
    /// Line terminator for the output.
    pub end_of_line: Option<EndOfLine>,
}

impl FormatSettings {
    /// Produces the normalised wire options.
    pub fn normalize(&self) -> FormatOptions {
        let print_width = match self.print_width {
            Some(value) if value.is_finite() => {
                let truncated = value.trunc();
                if truncated >= u32::MAX as f64 {
                    u32::MAX
                } else {
                    (truncated as i64).max(40) as u32
                }
            }
            _ => DEFAULT_PRINT_WIDTH,
        };

        FormatOptions {
            print_width,
            tab_width: self.tab_width.unwrap_or(DEFAULT_TAB_WIDTH).max(1),
            use_tabs: self.use_tabs.unwrap_or(false),
            end_of_line: self.end_of_line.unwrap_or(EndOfLine::Lf),
        }
    }
}

/// Normalises a requested byte range against the text: `None` when it covers
/// the whole document, otherwise clamped to `start ≥ 0`, `end ∈ (start, len]`.
/// Unusable ranges collapse to `None` (whole document).
pub fn normalize_range(text: &str, range: Option<(i64, i64)>) -> Option<TextRange> {
    let (start, end) = range?;
    let len = text.len() as i64;

    let start = start.max(0);
    let end = end.min(len);
    if end <= start {
        return None;
    }
    if start == 0 && end == len {
        return None;
    }
    Some(TextRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = FormatSettings::default().normalize();
        assert_eq!(options.print_width, 80);
        assert_eq!(options.tab_width, 4);
        assert!(!options.use_tabs);
        assert_eq!(options.end_of_line, EndOfLine::Lf);
    }

    #[test]
    fn test_print_width_truncated_and_floored() {
        let settings = FormatSettings {
            print_width: Some(99.9),
            ..Default::default()
        };
        assert_eq!(settings.normalize().print_width, 99);

        let settings = FormatSettings {
            print_width: Some(12.0),
            ..Default::default()
        };
        assert_eq!(settings.normalize().print_width, 40);

        let settings = FormatSettings {
            print_width: Some(f64::NAN),
            ..Default::default()
        };
        assert_eq!(settings.normalize().print_width, 80);
    }

    #[test]
    fn test_tab_width_floor() {
        let settings = FormatSettings {
            tab_width: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.normalize().tab_width, 1);
    }

    #[test]
    fn test_whole_document_range_is_none() {
        let text = "hello";
        assert_eq!(normalize_range(text, Some((0, 5))), None);
        assert_eq!(normalize_range(text, None), None);
    }

    #[test]
    fn test_range_clamping() {
        let text = "hello world";
        assert_eq!(
            normalize_range(text, Some((-3, 5))),
            Some(TextRange { start: 0, end: 5 })
        );
        assert_eq!(
            normalize_range(text, Some((6, 999))),
            Some(TextRange { start: 6, end: 11 })
        );
        // Collapses after clamping: whole document.
        assert_eq!(normalize_range(text, Some((-10, 999))), None);
        // Empty after clamping: unusable.
        assert_eq!(normalize_range(text, Some((5, 5))), None);
        assert_eq!(normalize_range(text, Some((20, 30))), None);
    }
}
