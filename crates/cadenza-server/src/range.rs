//! HTTP `Range` header resolution.
//!
//! Only single `bytes=` ranges are honoured. A header that does not parse is
//! ignored and the full body is served; a range that starts past the end is
//! unsatisfiable.

/// Inclusive byte range within a body of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset
    pub start: u64,
    /// Last byte offset (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a `ByteRange` covers at least one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for this range.
    #[must_use]
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }

    /// Outgoing `Range` request header value.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Outcome of resolving a `Range` header against a body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// Serve the whole body with 200
    Full,
    /// Serve a slice with 206
    Partial(ByteRange),
    /// Respond 416
    Unsatisfiable,
}

impl RangeRequest {
    /// `Content-Range` value for a 416 response.
    #[must_use]
    pub fn unsatisfied_content_range(total: u64) -> String {
        format!("bytes */{total}")
    }
}

/// Resolve a `Range` header value against a body of `total` bytes.
#[must_use]
pub fn resolve_range(header: Option<&str>, total: u64) -> RangeRequest {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    let ranges = ranges.trim();
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return RangeRequest::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix form: last N bytes
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || total == 0 {
            return RangeRequest::Unsatisfiable;
        }
        let len = suffix.min(total);
        return RangeRequest::Partial(ByteRange {
            start: total - len,
            end: total - 1,
        });
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return RangeRequest::Full,
        }
    };
    if end.is_some_and(|end| end < start) {
        return RangeRequest::Full;
    }
    if start >= total {
        return RangeRequest::Unsatisfiable;
    }

    let last = total - 1;
    RangeRequest::Partial(ByteRange {
        start,
        end: end.map_or(last, |end| end.min(last)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn partial(start: u64, end: u64) -> RangeRequest {
        RangeRequest::Partial(ByteRange { start, end })
    }

    #[test]
    fn test_no_header() {
        assert_eq!(resolve_range(None, 100), RangeRequest::Full);
    }

    #[test]
    fn test_open_ended() {
        assert_eq!(resolve_range(Some("bytes=0-"), 100), partial(0, 99));
        assert_eq!(resolve_range(Some("bytes=40-"), 100), partial(40, 99));
    }

    #[test]
    fn test_closed() {
        assert_eq!(resolve_range(Some("bytes=5-9"), 100), partial(5, 9));
        assert_eq!(resolve_range(Some("bytes=90-500"), 100), partial(90, 99));
    }

    #[test]
    fn test_suffix() {
        assert_eq!(resolve_range(Some("bytes=-10"), 100), partial(90, 99));
        assert_eq!(resolve_range(Some("bytes=-500"), 100), partial(0, 99));
        assert_eq!(
            resolve_range(Some("bytes=-0"), 100),
            RangeRequest::Unsatisfiable
        );
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(
            resolve_range(Some("bytes=100-"), 100),
            RangeRequest::Unsatisfiable
        );
        assert_eq!(
            resolve_range(Some("bytes=0-"), 0),
            RangeRequest::Unsatisfiable
        );
        assert_eq!(RangeRequest::unsatisfied_content_range(100), "bytes */100");
    }

    #[test]
    fn test_malformed_is_ignored() {
        for header in ["items=0-1", "bytes=abc", "bytes=9-5", "bytes=0-1,5-6", "bytes=x-"] {
            assert_eq!(resolve_range(Some(header), 100), RangeRequest::Full, "{header}");
        }
    }

    #[test]
    fn test_header_strings() {
        let range = ByteRange { start: 5, end: 9 };
        assert_eq!(range.len(), 5);
        assert_eq!(range.content_range(100), "bytes 5-9/100");
        assert_eq!(range.to_header_value(), "bytes=5-9");
    }

    proptest! {
        #[test]
        fn prop_partial_within_bounds(start in 0u64..2000, len in 0u64..2000, total in 1u64..1000) {
            let header = format!("bytes={}-{}", start, start + len);
            match resolve_range(Some(&header), total) {
                RangeRequest::Partial(range) => {
                    prop_assert!(range.start <= range.end);
                    prop_assert!(range.end < total);
                    prop_assert_eq!(range.start, start);
                }
                RangeRequest::Unsatisfiable => prop_assert!(start >= total),
                RangeRequest::Full => prop_assert!(false, "well-formed range ignored"),
            }
        }
    }
}
