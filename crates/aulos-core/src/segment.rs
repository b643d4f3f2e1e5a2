use url::Url;

/// Byte range inside a larger resource, inclusive start, exclusive end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// One downloadable, time-bounded unit of media belonging to a
/// representation.
///
/// Segments are ordered within their index and chronologically
/// non-overlapping (the index guarantees this after repair).
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    /// Unique id within the owning index.
    pub id: String,
    /// Start time in seconds on the period timeline.
    pub start: f64,
    /// Duration in seconds. Zero for initialization segments.
    pub duration: f64,
    /// Candidate URLs, most-preferred first.
    pub urls: Vec<Url>,
    /// Optional byte range when several segments share one resource.
    pub byte_range: Option<ByteRange>,
    /// `true` for the initialization segment.
    pub is_init: bool,
}

impl Segment {
    /// Convenience constructor for a media segment without URLs, mostly
    /// useful in tests and index implementations.
    pub fn media(start: f64, duration: f64) -> Self {
        Self {
            id: format!("{start}"),
            start,
            duration,
            urls: Vec::new(),
            byte_range: None,
            is_init: false,
        }
    }

    /// Convenience constructor for an initialization segment.
    pub fn init() -> Self {
        Self {
            id: "init".to_string(),
            start: 0.0,
            duration: 0.0,
            urls: Vec::new(),
            byte_range: None,
            is_init: true,
        }
    }

    /// End time in seconds on the period timeline.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// `true` when the segment carries media for some part of
    /// `[start, end)`.
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        !self.is_init && self.start < end && self.end() > start
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::inside(2.0, 3.0, true)]
    #[case::exact(0.0, 4.0, true)]
    #[case::straddles_start(-1.0, 0.5, true)]
    #[case::touches_end(4.0, 8.0, false)]
    #[case::before(-4.0, 0.0, false)]
    fn overlap(#[case] start: f64, #[case] end: f64, #[case] expected: bool) {
        let seg = Segment::media(0.0, 4.0);
        assert_eq!(seg.overlaps(start, end), expected);
    }

    #[test]
    fn init_segment_never_overlaps() {
        let seg = Segment::init();
        assert!(!seg.overlaps(-1.0, 1.0));
    }
}
