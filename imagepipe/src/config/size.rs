//! Human-readable sizes such as "512MB" or "40 MB".

use std::fmt;

use thiserror::Error;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size '{input}': expected a byte count like '512MB', '40 MB' or '1024'")]
pub struct SizeParseError {
    input: String,
}

/// Parses a size string into bytes.
///
/// Accepts a bare byte count or a whole number followed by `B`, `K`/`KB`,
/// `M`/`MB` or `G`/`GB` (binary multiples, case-insensitive).
///
/// ```
/// use imagepipe::config::parse_size;
///
/// assert_eq!(parse_size("40MB").unwrap(), 40 * 1024 * 1024);
/// assert_eq!(parse_size("16 k").unwrap(), 16 * 1024);
/// assert_eq!(parse_size("512").unwrap(), 512);
/// ```
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let error = || SizeParseError {
        input: input.to_string(),
    };
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(error());
    }

    let multiplier = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => KB,
        "M" | "MB" => MB,
        "G" | "GB" => GB,
        _ => return Err(error()),
    };
    let value: u64 = number.parse().map_err(|_| error())?;
    value.checked_mul(multiplier).ok_or_else(error)
}

/// Formats a byte count with the largest unit that divides it evenly.
///
/// ```
/// use imagepipe::config::format_size;
///
/// assert_eq!(format_size(40 * 1024 * 1024), "40MB");
/// assert_eq!(format_size(1000), "1000");
/// ```
pub fn format_size(bytes: u64) -> String {
    match bytes {
        0 => "0".to_string(),
        b if b % GB == 0 => format!("{}GB", b / GB),
        b if b % MB == 0 => format!("{}MB", b / MB),
        b if b % KB == 0 => format!("{}KB", b / KB),
        b => b.to_string(),
    }
}

/// A byte count that parses from and displays as a size string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Size(pub u64);

impl Size {
    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn from_mb(mb: u64) -> Self {
        Self(mb * MB)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_size(self.0))
    }
}

impl std::str::FromStr for Size {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(Size)
    }
}
