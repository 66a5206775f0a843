//! # ESC/POS Command Builders
//!
//! The handful of ESC/POS commands the bundled encoders need. BLE receipt
//! printers of the E7810A71 service family speak this dialect.
//!
//! ## Byte Order
//!
//! Multi-byte integers use **little-endian** encoding:
//! - `u16` value 0x1234 is sent as bytes `[0x34, 0x12]`

// ============================================================================
// ESCAPE SEQUENCE CONSTANTS
// ============================================================================

/// ESC (Escape) - Command prefix byte
pub const ESC: u8 = 0x1B;

/// GS (Group Separator) - Extended command prefix
pub const GS: u8 = 0x1D;

/// LF (Line Feed) - Print the line buffer and advance one line
pub const LF: u8 = 0x0A;

// ============================================================================
// COMMANDS
// ============================================================================

/// # Initialize Printer (ESC @)
///
/// Clears the print buffer and resets text formatting to power-on defaults.
///
/// ```
/// use ticketline::encoder::commands;
///
/// assert_eq!(commands::init(), vec![0x1B, 0x40]);
/// ```
#[inline]
pub fn init() -> Vec<u8> {
    vec![ESC, b'@']
}

/// # Emphasized Mode (ESC E n)
///
/// | n | Effect |
/// |---|--------|
/// | 0 | bold off |
/// | 1 | bold on |
#[inline]
pub fn emphasize(on: bool) -> Vec<u8> {
    vec![ESC, b'E', on as u8]
}

/// Horizontal text alignment for [`align`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    #[default]
    Left = 0,
    Center = 1,
    Right = 2,
}

/// # Select Justification (ESC a n)
#[inline]
pub fn align(alignment: Alignment) -> Vec<u8> {
    vec![ESC, b'a', alignment as u8]
}

/// # Print and Feed n Lines (ESC d n)
#[inline]
pub fn feed_lines(n: u8) -> Vec<u8> {
    vec![ESC, b'd', n]
}

/// # Raster Bit Image Header (GS v 0 m xL xH yL yH)
///
/// Precedes `width_bytes × rows` bytes of packed image data.
///
/// ## Data Layout
///
/// ```text
/// Row 0:   d1 d2 ... d(width_bytes)
/// Row 1:   ...
/// Each byte: bit7 = leftmost dot, 1 = black
/// ```
///
/// ```
/// use ticketline::encoder::commands;
///
/// let header = commands::raster_header(48, 24);
/// assert_eq!(header, vec![0x1D, 0x76, 0x30, 0x00, 48, 0, 24, 0]);
/// ```
#[inline]
pub fn raster_header(width_bytes: u16, rows: u16) -> Vec<u8> {
    let [xl, xh] = u16_le(width_bytes);
    let [yl, yh] = u16_le(rows);
    vec![GS, b'v', b'0', 0, xl, xh, yl, yh]
}

/// Split a u16 into little-endian bytes
#[inline]
pub fn u16_le(n: u16) -> [u8; 2] {
    n.to_le_bytes()
}
