//! ARGB32 color constants.

pub const RED: u32 = 0xFFFF_0000;
pub const GREEN: u32 = 0xFF00_FF00;
pub const BLUE: u32 = 0xFF00_00FF;
pub const YELLOW: u32 = RED | GREEN;
pub const CYAN: u32 = GREEN | BLUE;
pub const MAGENTA: u32 = RED | BLUE;
/// Opaque black; the alpha byte must stay set.
pub const BLACK: u32 = RED & GREEN & BLUE;
pub const WHITE: u32 = RED | GREEN | BLUE;

/// Indexed by a 3-bit RGB value: bit 0 red, bit 1 green, bit 2 blue.
pub const PALETTE: [u32; 8] = [BLACK, RED, GREEN, YELLOW, BLUE, MAGENTA, CYAN, WHITE];
