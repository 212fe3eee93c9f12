//! RFC 7233 single-range parsing plus `Content-Range` helpers.
//!
//! Multi-range requests are reduced to their first range before they reach
//! the caching driver.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

/// Parse a `Range: bytes=` header against a known object size. The first
/// range wins when several are present. Suffix (`bytes=-N`) and open-ended
/// (`bytes=N-`) forms are honoured; an end past the object is clipped.
pub fn parse_range(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
    let header = header.trim();
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Invalid)?;
    let first = spec.split(',').next().ok_or(RangeError::Invalid)?.trim();
    if first.is_empty() {
        return Err(RangeError::Invalid);
    }

    let (start_str, end_str) = first.split_once('-').ok_or(RangeError::Invalid)?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if start_str.is_empty() {
        // suffix form: last N bytes
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
    if size > 0 && start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    let end = if end_str.is_empty() {
        if size == 0 {
            return Err(RangeError::Invalid);
        }
        size - 1
    } else {
        let end: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
        if size > 0 && end >= size {
            size - 1
        } else {
            end
        }
    };

    if end < start {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(RangeSpec { start, end })
}

/// True when the header asks for everything from an offset to the end
/// (`bytes=N-`). Such requests are treated as full-object reads when the
/// driver assigns a cache status.
pub fn is_open_ended(header: &str) -> bool {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return false;
    };
    match spec.split(',').next() {
        Some(first) => {
            let first = first.trim();
            first.ends_with('-') && !first.starts_with('-') && first.len() > 1
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

/// Parse `Content-Range: bytes <start>-<end>/<size>`. The unsatisfied form
/// (`bytes */N`) and unknown totals (`.../*`) yield `None`.
pub fn parse_content_range(header: &str) -> Option<ContentRange> {
    let rest = header.trim().strip_prefix("bytes")?.trim_start();
    let (range, size) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        size: size.trim().parse().ok()?,
    })
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {start}-{end}/{size}")
}

pub fn unsatisfied_content_range(size: u64) -> String {
    format!("bytes */{size}")
}

/// Expand a range toward block boundaries to improve future hit rate.
/// `percent` caps how much extra data may be pulled in on either side;
/// the expansion never crosses the object end and falls back to the raw
/// range when the gain would exceed the cap.
pub fn fill_range(range: RangeSpec, size: u64, block_size: u64, percent: u64) -> RangeSpec {
    if block_size == 0 || percent == 0 || size == 0 {
        return range;
    }
    let percent = percent.min(100);
    let max_fill = block_size.saturating_mul(percent) / 100;

    let mut start = (range.start / block_size) * block_size;
    if range.start - start > max_fill {
        start = range.start;
    }

    let mut end = (range.end / block_size + 1).saturating_mul(block_size) - 1;
    if end >= size {
        end = size - 1;
    }
    if end.saturating_sub(range.end) > max_fill {
        end = range.end;
    }

    if end < start {
        return range;
    }
    RangeSpec { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bounded_range() {
        let r = parse_range("bytes=10-19", 100).unwrap();
        assert_eq!(r, RangeSpec { start: 10, end: 19 });
        assert_eq!(r.len(), 10);
    }

    #[test]
    fn parses_open_and_suffix_forms() {
        assert_eq!(
            parse_range("bytes=90-", 100).unwrap(),
            RangeSpec { start: 90, end: 99 }
        );
        assert_eq!(
            parse_range("bytes=-10", 100).unwrap(),
            RangeSpec { start: 90, end: 99 }
        );
        // suffix larger than the object clamps to the full body
        assert_eq!(
            parse_range("bytes=-500", 100).unwrap(),
            RangeSpec { start: 0, end: 99 }
        );
        assert!(is_open_ended("bytes=90-"));
        assert!(!is_open_ended("bytes=90-99"));
        assert!(!is_open_ended("bytes=-10"));
    }

    #[test]
    fn clips_end_past_object() {
        assert_eq!(
            parse_range("bytes=10-5000", 100).unwrap(),
            RangeSpec { start: 10, end: 99 }
        );
    }

    #[test]
    fn rejects_out_of_bounds_start() {
        assert_eq!(parse_range("bytes=5000-6000", 1024), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-0", 0), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=9-3", 100), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(parse_range("bits=0-1", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("bytes=a-b", 10), Err(RangeError::Invalid));
        assert_eq!(parse_range("bytes=", 10), Err(RangeError::Invalid));
    }

    #[test]
    fn content_range_round_trip() {
        let cr = parse_content_range("bytes 0-499/1000").unwrap();
        assert_eq!(
            cr,
            ContentRange { start: 0, end: 499, size: 1000 }
        );
        assert_eq!(build_content_range(0, 499, 1000), "bytes 0-499/1000");
        assert!(parse_content_range("bytes */1000").is_none());
        assert_eq!(unsatisfied_content_range(1024), "bytes */1024");
    }

    #[test]
    fn fill_expands_to_block_boundaries() {
        let raw = RangeSpec { start: 500_000, end: 600_000 };
        let filled = fill_range(raw, 3_145_728, 1_048_576, 100);
        assert_eq!(filled, RangeSpec { start: 0, end: 1_048_575 });
        // zero percent leaves the range alone
        assert_eq!(fill_range(raw, 3_145_728, 1_048_576, 0), raw);
        // never expands past the object end
        let tail = RangeSpec { start: 3_000_000, end: 3_145_727 };
        let filled = fill_range(tail, 3_145_728, 1_048_576, 100);
        assert_eq!(filled.end, 3_145_727);
    }
}
