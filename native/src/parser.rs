// Control point extraction from SDK log lines.

use crate::sample::Sample;
use once_cell::sync::Lazy;
use regex::Regex;

/// Pattern the SDK uses when it logs an emitted control point.
pub const CONTROL_POINT_PATTERN: &str =
    r"\[(-?[0-9.]+),(-?[0-9.]+),(-?[0-9.]+)\] intensity (-?[0-9.]+)";

static CONTROL_POINT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(CONTROL_POINT_PATTERN).expect("control point pattern is valid"));

/// Extract a sample from a single log line.
///
/// The match may sit anywhere in the line, so timestamps and log-level
/// prefixes are ignored. Lines cut by a chunk boundary, or captures that are
/// not valid decimals (`1.2.3`, `.`), simply produce `None`.
pub fn parse_line(line: &str) -> Option<Sample> {
    let captures = CONTROL_POINT_REGEX.captures(line)?;

    let field = |index: usize| -> Option<f64> { captures.get(index)?.as_str().parse().ok() };

    Some(Sample::new(field(1)?, field(2)?, field(3)?, field(4)?))
}

/// Split a raw chunk read from the channel into text lines.
///
/// Bytes are decoded lossily so a multi-byte sequence split across two reads
/// degrades into replacement characters on one line instead of failing the
/// whole chunk.
pub fn chunk_lines(chunk: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(chunk)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}
