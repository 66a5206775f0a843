//! # Payload Encoders
//!
//! Turn printable content into the ordered byte chunks the dispatcher writes,
//! one write per chunk. The dispatcher does not care what a chunk holds.
//!
//! ## Module Structure
//!
//! - [`commands`]: ESC/POS command builders
//! - [`text`]: text lines and key/value rows
//! - [`image`]: thresholded bitmaps as raster bands
//!
//! ## Usage Example
//!
//! ```
//! use ticketline::encoder::{CharacterEncoding, KeyValueLine, PayloadEncoder, TextBlock, Ticket};
//!
//! let ticket = Ticket::new()
//!     .block(TextBlock::new("ORDER #42").bold().center())
//!     .block(KeyValueLine::new("Coffee", "3.50"))
//!     .feed(3);
//!
//! let chunks = ticket.encode(CharacterEncoding::Utf8);
//! assert_eq!(chunks[0], vec![0x1B, 0x40]); // init
//! ```

pub mod commands;
pub mod image;
pub mod text;

use serde::{Deserialize, Serialize};

pub use self::image::BitmapImage;
pub use self::text::{KeyValueLine, TextBlock};

/// Character set used to turn text into bytes.
///
/// GB18030 is the native code page of this printer family and covers all of
/// Unicode, so it is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterEncoding {
    #[default]
    Gb18030,
    Utf8,
    /// ISO-8859-1; characters outside it print as `?`
    Latin1,
}

impl CharacterEncoding {
    pub fn encode(self, s: &str) -> Vec<u8> {
        match self {
            CharacterEncoding::Gb18030 => encoding_rs::GB18030.encode(s).0.into_owned(),
            CharacterEncoding::Utf8 => s.as_bytes().to_vec(),
            CharacterEncoding::Latin1 => s
                .chars()
                .map(|ch| u8::try_from(u32::from(ch)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

/// Anything that can be turned into an ordered sequence of print chunks.
pub trait PayloadEncoder {
    fn encode(&self, encoding: CharacterEncoding) -> Vec<Vec<u8>>;
}

/// Chunks that are already encoded; passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChunks(pub Vec<Vec<u8>>);

impl PayloadEncoder for RawChunks {
    fn encode(&self, _encoding: CharacterEncoding) -> Vec<Vec<u8>> {
        self.0.clone()
    }
}

/// A sequence of blocks printed as one job, starting with a printer reset.
#[derive(Default)]
pub struct Ticket {
    blocks: Vec<Box<dyn PayloadEncoder + Send + Sync>>,
    feed: u8,
}

impl Ticket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block<B: PayloadEncoder + Send + Sync + 'static>(mut self, block: B) -> Self {
        self.blocks.push(Box::new(block));
        self
    }

    /// Blank lines fed after the last block
    pub fn feed(mut self, lines: u8) -> Self {
        self.feed = lines;
        self
    }
}

impl PayloadEncoder for Ticket {
    fn encode(&self, encoding: CharacterEncoding) -> Vec<Vec<u8>> {
        let mut chunks = vec![commands::init()];
        for block in &self.blocks {
            chunks.extend(block.encode(encoding));
        }
        if self.feed > 0 {
            chunks.push(commands::feed_lines(self.feed));
        }
        chunks
    }
}
