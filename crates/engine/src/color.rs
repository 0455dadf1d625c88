use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::error::ColorError;

/// Canonical color identity used for set membership and frequency counting.
///
/// Every fully transparent color collapses to [`ColorId::TRANSPARENT`], which is
/// also the value the placement endpoint uses for "no paint".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorId(pub i32);

impl ColorId {
    pub const TRANSPARENT: ColorId = ColorId(-1);

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ColorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::TRANSPARENT {
            f.write_str("transparent")
        } else {
            write!(f, "#{:06x}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::rgba(r, g, b, 0xff)
    }

    /// Reads one pixel from an RGBA byte slice (at least 4 bytes).
    pub fn from_rgba_slice(px: &[u8]) -> Self {
        Self::rgba(px[0], px[1], px[2], px[3])
    }

    /// Parses `rgb`, `rgba`, `rrggbb` or `rrggbbaa`, with or without a leading `#`.
    pub fn from_hex(s: &str) -> Result<Self, ColorError> {
        let invalid = || ColorError::InvalidColorFormat(s.to_string());
        let digits = s.trim().strip_prefix('#').unwrap_or(s.trim());
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let mut full = match digits.len() {
            3 | 4 => digits.chars().flat_map(|c| [c, c]).collect::<String>(),
            6 | 8 => digits.to_string(),
            _ => return Err(invalid()),
        };
        if full.len() == 6 {
            full.push_str("ff");
        }

        let channel = |i: usize| u8::from_str_radix(&full[i..i + 2], 16).map_err(|_| invalid());
        Ok(Self::rgba(channel(0)?, channel(2)?, channel(4)?, channel(6)?))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }

    pub fn identity(&self) -> ColorId {
        if self.is_transparent() {
            ColorId::TRANSPARENT
        } else {
            ColorId(((self.r as i32) << 16) | ((self.g as i32) << 8) | self.b as i32)
        }
    }

    pub fn is_transparent(&self) -> bool {
        self.a == 0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for Color {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Palette the host lets every account place without spending energy.
pub const FREE_COLORS: [Color; 16] = [
    Color::rgb(0xff, 0xff, 0xff),
    Color::rgb(0xff, 0xca, 0x3a),
    Color::rgb(0xff, 0x59, 0x5e),
    Color::rgb(0xf3, 0xbb, 0xc2),
    Color::rgb(0xbd, 0x63, 0x7d),
    Color::rgb(0x6a, 0x4c, 0x93),
    Color::rgb(0xa8, 0xd0, 0xdc),
    Color::rgb(0x1a, 0x53, 0x5c),
    Color::rgb(0x19, 0x82, 0xc4),
    Color::rgb(0x8a, 0xc9, 0x26),
    Color::rgb(0x6b, 0x42, 0x26),
    Color::rgb(0xcf, 0xd0, 0x78),
    Color::rgb(0x8b, 0x1d, 0x24),
    Color::rgb(0xc4, 0x9a, 0x6c),
    Color::rgb(0x00, 0x00, 0x00),
    Color::rgba(0x00, 0x00, 0x00, 0x00),
];

pub fn free_color_ids() -> &'static HashSet<ColorId> {
    static IDS: OnceLock<HashSet<ColorId>> = OnceLock::new();
    IDS.get_or_init(|| FREE_COLORS.iter().map(Color::identity).collect())
}

/// Parses a list of hex colors into identities. Blank entries are skipped.
pub fn parse_color_ids<I, S>(colors: I) -> Result<HashSet<ColorId>, ColorError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    colors
        .into_iter()
        .filter(|c| !c.as_ref().trim().is_empty())
        .map(|c| Color::from_hex(c.as_ref()).map(|c| c.identity()))
        .collect()
}

/// Splits a separator-joined color string, e.g. `"#fff,#000"`.
pub fn split_color_list(input: &str, sep: &str) -> Vec<String> {
    let sep = if sep.is_empty() { "," } else { sep };
    input.split(sep).map(|s| s.trim().to_string()).collect()
}
