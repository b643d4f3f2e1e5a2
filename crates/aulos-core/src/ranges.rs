use crate::types::ContentLocator;

/// Granularity under which two ranges are considered contiguous.
///
/// Media buffers routinely hold ranges split by micro-gaps caused by
/// rounding during remux; treating them as holes would re-download data
/// that is effectively there.
const CONTIGUITY_EPSILON: f64 = 1.0 / 60.0;

/// One buffered interval, attributed to the content it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct TaggedRange {
    pub start: f64,
    pub end: f64,
    pub locator: ContentLocator,
}

impl TaggedRange {
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start < end && self.end > start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Ordered, non-overlapping set of `[start, end)` intervals describing
/// what the sink currently holds for one track.
///
/// Only the sink mutates this in response to push/remove calls; the core
/// re-queries it after every mutating call instead of assuming state.
#[derive(Clone, Debug, Default)]
pub struct BufferedRanges {
    ranges: Vec<TaggedRange>,
}

impl BufferedRanges {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedRange> {
        self.ranges.iter()
    }

    /// Insert a tagged interval, keeping the set ordered. Overlapping
    /// parts of older entries are truncated or split: the newest push wins,
    /// which is how a media buffer behaves on overwrite.
    pub fn insert(&mut self, range: TaggedRange) {
        if range.end <= range.start {
            return;
        }
        let mut next = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if !existing.overlaps(range.start, range.end) {
                next.push(existing);
                continue;
            }
            if existing.start < range.start {
                next.push(TaggedRange {
                    end: range.start,
                    ..existing.clone()
                });
            }
            if existing.end > range.end {
                next.push(TaggedRange {
                    start: range.end,
                    ..existing
                });
            }
        }
        next.push(range);
        next.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.ranges = next;
    }

    /// Remove everything intersecting `[start, end)`.
    pub fn remove(&mut self, start: f64, end: f64) {
        if end <= start {
            return;
        }
        let mut next = Vec::with_capacity(self.ranges.len());
        for existing in self.ranges.drain(..) {
            if !existing.overlaps(start, end) {
                next.push(existing);
                continue;
            }
            if existing.start < start {
                next.push(TaggedRange {
                    end: start,
                    ..existing.clone()
                });
            }
            if existing.end > end {
                next.push(TaggedRange {
                    start: end,
                    ..existing
                });
            }
        }
        self.ranges = next;
    }

    /// The range containing `time`, if any.
    pub fn range_at(&self, time: f64) -> Option<&TaggedRange> {
        self.ranges.iter().find(|r| r.contains(time))
    }

    /// Buffered duration ahead of `time` inside the range containing it.
    pub fn ahead_of(&self, time: f64) -> f64 {
        self.range_at(time).map_or(0.0, |r| r.end - time)
    }

    /// Subtract from `[start, end)` every buffered part matching
    /// `keep`, returning the residual intervals still to cover.
    ///
    /// Contiguous matching ranges separated by micro-gaps are treated as
    /// one covered block.
    pub fn subtract_from(
        &self,
        start: f64,
        end: f64,
        keep: impl Fn(&TaggedRange) -> bool,
    ) -> Vec<(f64, f64)> {
        let mut residual = vec![(start, end)];
        for range in self.ranges.iter().filter(|r| keep(r)) {
            let mut next = Vec::with_capacity(residual.len() + 1);
            for (s, e) in residual {
                if range.start - CONTIGUITY_EPSILON > s {
                    next.push((s, e.min(range.start)));
                }
                if range.end + CONTIGUITY_EPSILON < e {
                    next.push((s.max(range.end), e));
                }
            }
            residual = next;
        }
        residual.retain(|(s, e)| e - s > CONTIGUITY_EPSILON);
        residual
    }

    /// All ranges whose tag fails `keep` and which intersect `[start, end)`.
    pub fn foreign_ranges(
        &self,
        start: f64,
        end: f64,
        keep: impl Fn(&TaggedRange) -> bool,
    ) -> Vec<&TaggedRange> {
        self.ranges
            .iter()
            .filter(|r| !keep(r) && r.overlaps(start, end))
            .collect()
    }
}

impl FromIterator<TaggedRange> for BufferedRanges {
    fn from_iter<I: IntoIterator<Item = TaggedRange>>(iter: I) -> Self {
        let mut ranges = BufferedRanges::new();
        for r in iter {
            ranges.insert(r);
        }
        ranges
    }
}
