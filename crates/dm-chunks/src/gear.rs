//! Gear table for the rolling boundary hash.
//!
//! The table is part of the chunk format: changing any entry moves chunk
//! boundaries for all content, so every change must bump
//! [`GEAR_TABLE_VERSION`].

pub const GEAR_TABLE_VERSION: u32 = 1;

const LEADING: [u32; 32] = [
    0x3a8f13b1, 0x5c6d7e2f, 0x1d2a3b4c, 0x9f8e7d6c, 0xa1b2c3d4, 0x0f1e2d3c, 0x12345678, 0xabcdef01,
    0x23456789, 0x3456789a, 0x456789ab, 0x56789abc, 0x6789abcd, 0x789abcde, 0x89abcdef, 0x9abcdef0,
    0x0a0b0c0d, 0x1a1b1c1d, 0x2a2b2c2d, 0x3b3c3d3e, 0x4c4d4e4f, 0x5d5e5f60, 0x6e6f7071, 0x7f808182,
    0x8f909192, 0x9fa0a1a2, 0xafb0b1b2, 0xbfc0c1c2, 0xcfd0d1d2, 0xdfd1d2d3, 0xefc1c2c3, 0xffb1b2b3,
];

/// Entries 0..32 are the published constants, 32..256 are `0x11111111 + (i - 32)`.
pub static GEAR: [u32; 256] = build();

const fn build() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < LEADING.len() {
        table[i] = LEADING[i];
        i += 1;
    }
    while i < 256 {
        table[i] = 0x1111_1111u32.wrapping_add((i - LEADING.len()) as u32);
        i += 1;
    }
    table
}
