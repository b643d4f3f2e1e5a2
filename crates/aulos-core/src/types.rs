use std::fmt;

use crate::segment::Segment;

/// Kind of track an adaptation carries.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrackType {
    Audio,
    Video,
    Text,
}

impl TrackType {
    /// Audio and video go through a native sink; their failures are fatal.
    /// Text-like tracks are isolated and can be disposed on error.
    pub fn is_native(self) -> bool {
        matches!(self, TrackType::Audio | TrackType::Video)
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackType::Audio => write!(f, "audio"),
            TrackType::Video => write!(f, "video"),
            TrackType::Text => write!(f, "text"),
        }
    }
}

/// Immutable tuple identifying exactly one addressable unit of media.
///
/// Used as the key for request correlation and buffer bookkeeping: every
/// byte pushed to the sink is tagged with the locator it came from, so
/// buffered ranges can always be attributed back to their
/// period/adaptation/representation.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentLocator {
    pub manifest_id: String,
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
    pub segment: Segment,
}

impl ContentLocator {
    /// `true` when both locators come from the same representation of the
    /// same adaptation/period (ignoring the segment itself).
    pub fn same_representation(&self, other: &ContentLocator) -> bool {
        self.manifest_id == other.manifest_id
            && self.period_id == other.period_id
            && self.adaptation_id == other.adaptation_id
            && self.representation_id == other.representation_id
    }

    /// `true` when both locators belong to the same adaptation, regardless
    /// of representation.
    pub fn same_adaptation(&self, other: &ContentLocator) -> bool {
        self.manifest_id == other.manifest_id
            && self.period_id == other.period_id
            && self.adaptation_id == other.adaptation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(repr: &str, adaptation: &str) -> ContentLocator {
        ContentLocator {
            manifest_id: "m1".into(),
            period_id: "p1".into(),
            adaptation_id: adaptation.into(),
            representation_id: repr.into(),
            segment: Segment::media(0.0, 4.0),
        }
    }

    #[test]
    fn same_representation_ignores_segment() {
        let mut a = locator("r1", "a1");
        let b = locator("r1", "a1");
        a.segment = Segment::media(4.0, 4.0);
        assert!(a.same_representation(&b));
    }

    #[test]
    fn different_representation_same_adaptation() {
        let a = locator("r1", "a1");
        let b = locator("r2", "a1");
        assert!(!a.same_representation(&b));
        assert!(a.same_adaptation(&b));
    }
}
