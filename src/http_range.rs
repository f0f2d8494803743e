#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

/// Parse a single-range `Range: bytes=..` header against a body of `size`
/// bytes. Multi-range requests are treated as invalid.
pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Invalid)?;
    if spec.contains(',') {
        return Err(RangeError::Invalid);
    }
    let (start_str, end_str) = spec.split_once('-').ok_or(RangeError::Invalid)?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    // suffix form: bytes=-N
    if start_str.is_empty() {
        let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(RangeSpec {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let end = if end_str.is_empty() {
        size - 1
    } else {
        let end: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        end.min(size - 1)
    };

    if end < start {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(RangeSpec { start, end })
}

pub fn content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}

pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{}", size)
}
