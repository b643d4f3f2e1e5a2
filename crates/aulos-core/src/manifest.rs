use std::sync::Arc;

use crate::{index::SegmentIndex, types::TrackType};

/// One encoded quality variant of an adaptation.
#[derive(Clone)]
pub struct Representation {
    pub id: String,
    /// Nominal bitrate, in bits per second.
    pub bitrate: u64,
    /// Codec string, e.g. `avc1.64001f` or `mp4a.40.2`.
    pub codec: String,
    /// Decoding-capability hints, when the manifest carries them.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    /// Segment index owned by this representation. May be refreshed from
    /// a live manifest behind the trait.
    pub index: Arc<dyn SegmentIndex>,
}

impl std::fmt::Debug for Representation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Representation")
            .field("id", &self.id)
            .field("bitrate", &self.bitrate)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

/// A track (one audio language, the video track, a text track) holding
/// multiple representations.
#[derive(Clone, Debug)]
pub struct Adaptation {
    pub id: String,
    pub track_type: TrackType,
    pub language: Option<String>,
    pub representations: Vec<Representation>,
}

/// A time-bounded slice of the overall timeline.
#[derive(Clone, Debug)]
pub struct Period {
    pub id: String,
    /// Start in seconds on the content timeline.
    pub start: f64,
    /// End in seconds; `None` for the still-growing last period of a live
    /// content.
    pub end: Option<f64>,
    pub adaptations: Vec<Adaptation>,
}

impl Period {
    /// Duration in seconds, `None` when the end is unknown.
    pub fn duration(&self) -> Option<f64> {
        self.end.map(|end| end - self.start)
    }

    /// Adaptations of the given type, in manifest order.
    pub fn adaptations_for(&self, track_type: TrackType) -> Vec<&Adaptation> {
        self.adaptations
            .iter()
            .filter(|a| a.track_type == track_type)
            .collect()
    }
}

/// Read-only content description produced by the parsing collaborator.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub id: String,
    pub periods: Vec<Period>,
    pub is_live: bool,
}

impl Manifest {
    /// The period active at `position`, if any.
    pub fn period_at(&self, position: f64) -> Option<&Period> {
        self.periods
            .iter()
            .find(|p| position >= p.start && p.end.is_none_or(|end| position < end))
    }
}
