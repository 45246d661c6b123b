//! Byte-range header handling for cached blob serving

/// A satisfiable inclusive byte range within a blob of known size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Outcome of evaluating a `Range` header against a blob size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Serve 206 with this slice
    Partial(ByteRange),
    /// Serve 416 with `Content-Range: bytes */<size>`
    Unsatisfiable,
    /// Header is not a single bytes range we understand; serve the
    /// full 200 as HTTP permits
    Ignored,
}

/// Evaluate a `Range: bytes=<start>-<end>` header.
///
/// Either endpoint may be empty: start defaults to 0, end defaults to
/// `size - 1`. Out-of-bounds or inverted ranges are unsatisfiable;
/// anything not matching the single-range grammar is ignored.
pub fn evaluate_range(header: &str, size: u64) -> RangeOutcome {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Ignored;
    };
    // Multiple ranges are not supported; serving the whole blob is
    // always a valid response to any Range request.
    if spec.contains(',') {
        return RangeOutcome::Ignored;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Ignored;
    };

    let start = if start_str.trim().is_empty() {
        0
    } else {
        match start_str.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => return RangeOutcome::Ignored,
        }
    };
    let end = if end_str.trim().is_empty() {
        size.saturating_sub(1)
    } else {
        match end_str.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => return RangeOutcome::Ignored,
        }
    };

    if size == 0 || end >= size || start > end {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial(ByteRange { start, end })
}

/// The strong ETag for a blob digest
pub fn blob_etag(digest: &str) -> String {
    format!("\"{}\"", digest)
}

/// True if an `If-None-Match` header matches the ETag
pub fn if_none_match_matches(header: &str, etag: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == etag || candidate == "*")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 10 * 1024 * 1024;

    #[test]
    fn test_explicit_range() {
        assert_eq!(
            evaluate_range("bytes=1048576-2097151", SIZE),
            RangeOutcome::Partial(ByteRange {
                start: 1048576,
                end: 2097151
            })
        );
        if let RangeOutcome::Partial(range) = evaluate_range("bytes=1048576-2097151", SIZE) {
            assert_eq!(range.len(), 1048576);
        }
    }

    #[test]
    fn test_open_ended_ranges() {
        assert_eq!(
            evaluate_range("bytes=100-", SIZE),
            RangeOutcome::Partial(ByteRange {
                start: 100,
                end: SIZE - 1
            })
        );
        assert_eq!(
            evaluate_range("bytes=-999", SIZE),
            RangeOutcome::Partial(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn test_unsatisfiable_ranges() {
        assert_eq!(
            evaluate_range("bytes=20000000-20000001", SIZE),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(
            evaluate_range("bytes=5-4", SIZE),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(
            evaluate_range(&format!("bytes=0-{}", SIZE), SIZE),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(evaluate_range("bytes=0-0", 0), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn test_ignored_forms() {
        assert_eq!(evaluate_range("items=0-1", SIZE), RangeOutcome::Ignored);
        assert_eq!(evaluate_range("bytes=0-1,5-9", SIZE), RangeOutcome::Ignored);
        assert_eq!(evaluate_range("bytes=abc-", SIZE), RangeOutcome::Ignored);
        assert_eq!(evaluate_range("bytes=12", SIZE), RangeOutcome::Ignored);
    }

    #[test]
    fn test_etag_matching() {
        let etag = blob_etag("sha256:abc");
        assert_eq!(etag, "\"sha256:abc\"");
        assert!(if_none_match_matches("\"sha256:abc\"", &etag));
        assert!(if_none_match_matches("\"other\", \"sha256:abc\"", &etag));
        assert!(if_none_match_matches("*", &etag));
        assert!(!if_none_match_matches("\"sha256:def\"", &etag));
    }
}
