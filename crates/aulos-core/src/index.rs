use crate::segment::Segment;

/// Read-only view over the list of segments a representation owns.
///
/// Implementations are produced by the manifest-parsing collaborator and
/// may be refreshed or pruned behind this trait for live content, which is
/// why "finished" style answers must be re-queried rather than cached by
/// callers.
pub trait SegmentIndex: Send + Sync {
    /// Media segments overlapping `[from, from + duration)`, in
    /// chronological order.
    fn segments(&self, from: f64, duration: f64) -> Vec<Segment>;

    /// The initialization segment, when the representation has one.
    fn init_segment(&self) -> Option<Segment>;

    /// `false` until the index has learned its segment list (e.g. an index
    /// loaded lazily from a sidecar resource).
    fn is_initialized(&self) -> bool;

    /// `true` once the index will not produce any further segment.
    /// Always `true` for finished VOD content, re-checked live.
    fn is_finished(&self) -> bool;

    /// Whether the manifest should be refreshed to get segments for
    /// `[from, to)`.
    fn should_refresh(&self, from: f64, to: f64) -> bool;

    /// When `time` falls inside a gap of the index, returns the start of
    /// that gap (the computed end of the segment preceding it). `None`
    /// when `time` is covered.
    fn check_discontinuity(&self, time: f64) -> Option<f64>;

    /// `false` when the given segment has been pruned from a refreshed
    /// live index and requesting it again is pointless.
    fn is_segment_still_available(&self, segment: &Segment) -> bool;

    /// End time of the last segment currently known, `None` when the index
    /// cannot tell yet.
    fn last_position(&self) -> Option<f64>;
}

/// Simple in-memory index over a fixed segment list.
///
/// This is what manifest parsers hand over for VOD-style content, and what
/// the test suites build their fixtures from.
#[derive(Clone, Debug, Default)]
pub struct StaticSegmentIndex {
    init: Option<Segment>,
    media: Vec<Segment>,
    finished: bool,
}

impl StaticSegmentIndex {
    pub fn new(init: Option<Segment>, mut media: Vec<Segment>, finished: bool) -> Self {
        media.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self {
            init,
            media,
            finished,
        }
    }
}

impl SegmentIndex for StaticSegmentIndex {
    fn segments(&self, from: f64, duration: f64) -> Vec<Segment> {
        self.media
            .iter()
            .filter(|s| s.overlaps(from, from + duration))
            .cloned()
            .collect()
    }

    fn init_segment(&self) -> Option<Segment> {
        self.init.clone()
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn should_refresh(&self, _from: f64, _to: f64) -> bool {
        false
    }

    fn check_discontinuity(&self, time: f64) -> Option<f64> {
        // A gap exists when the next segment starts more than one unit
        // after the previous segment's computed end.
        let mut previous_end: Option<f64> = None;
        for seg in &self.media {
            if let Some(end) = previous_end {
                if time >= end && time < seg.start && seg.start - end > 1.0 {
                    return Some(end);
                }
            }
            if time >= seg.start && time < seg.end() {
                return None;
            }
            previous_end = Some(seg.end());
        }
        None
    }

    fn is_segment_still_available(&self, segment: &Segment) -> bool {
        self.media.iter().any(|s| s.id == segment.id)
    }

    fn last_position(&self) -> Option<f64> {
        self.media.last().map(Segment::end)
    }
}
