//! Text blocks and key/value rows.

use super::commands::{self, Alignment, LF};
use super::{CharacterEncoding, PayloadEncoder};

/// Print head width of a 58mm printer, in dots.
pub const HEAD_WIDTH_DOTS: usize = 384;

/// Width of one half-width character cell in the default font, in dots.
pub const FONT_WIDTH_DOTS: usize = 12;

/// One or more lines of text sharing a style. Each line is its own chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    content: String,
    bold: bool,
    alignment: Alignment,
}

impl TextBlock {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            bold: false,
            alignment: Alignment::Left,
        }
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn center(mut self) -> Self {
        self.alignment = Alignment::Center;
        self
    }

    pub fn right(mut self) -> Self {
        self.alignment = Alignment::Right;
        self
    }
}

impl PayloadEncoder for TextBlock {
    fn encode(&self, encoding: CharacterEncoding) -> Vec<Vec<u8>> {
        let styled = self.bold || self.alignment != Alignment::Left;

        self.content
            .lines()
            .enumerate()
            .map(|(i, line)| {
                let mut chunk = Vec::new();
                if i == 0 && styled {
                    chunk.extend(commands::align(self.alignment));
                    chunk.extend(commands::emphasize(self.bold));
                }
                chunk.extend(encoding.encode(line));
                chunk.push(LF);
                chunk
            })
            .chain(styled.then(|| {
                let mut reset = commands::emphasize(false);
                reset.extend(commands::align(Alignment::Left));
                reset
            }))
            .collect()
    }
}

/// A bold key and a value pushed to the right edge of the line.
///
/// ```text
/// Coffee                      3.50
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueLine {
    key: String,
    value: String,
    columns: usize,
}

impl KeyValueLine {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            columns: HEAD_WIDTH_DOTS / FONT_WIDTH_DOTS,
        }
    }

    /// Override the line width in half-width columns (32 by default).
    pub fn columns(mut self, columns: usize) -> Self {
        self.columns = columns;
        self
    }

    /// Spaces between key and value. Zero when they already fill the line.
    pub fn padding(&self) -> usize {
        let used = display_width(&self.key) + display_width(&self.value);
        self.columns.saturating_sub(used)
    }
}

impl PayloadEncoder for KeyValueLine {
    fn encode(&self, encoding: CharacterEncoding) -> Vec<Vec<u8>> {
        let mut chunk = commands::emphasize(true);
        chunk.extend(encoding.encode(&self.key));
        chunk.extend(commands::emphasize(false));
        chunk.extend(std::iter::repeat_n(b' ', self.padding()));
        chunk.extend(encoding.encode(&self.value));
        chunk.push(LF);
        vec![chunk]
    }
}

/// Columns a string occupies; CJK and full-width characters take two.
pub fn display_width(s: &str) -> usize {
    s.chars()
        .map(|c| if is_wide(c) { 2 } else { 1 })
        .sum()
}

fn is_wide(c: char) -> bool {
    ('\u{2E80}'..='\u{FE4F}').contains(&c) || c == '\u{FFE5}'
}
